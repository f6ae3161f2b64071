//! Query DSL parsing.
//!
//! Requests arrive as decoded query-string pairs:
//! `content_type=product&locale=de-DE&fields.price[gt]=15&order=-price&limit=10`.

use serde::{Deserialize, Serialize};

use cms_core::{CmsError, Result};

/// Page size when the request names none.
pub const DEFAULT_LIMIT: u64 = 100;

/// Largest accepted page size.
pub const MAX_LIMIT: u64 = 1000;

/// Largest accepted offset; bound as a PostgreSQL `integer`.
pub const MAX_SKIP: u64 = i32::MAX as u64;

/// Filter comparator, the bracketed suffix of a filter key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    Eq,
    Ne,
    Exists,
    Lt,
    Lte,
    Gt,
    Gte,
    Match,
    All,
    In,
    Nin,
}

impl Comparator {
    pub fn parse(name: &str) -> Result<Self> {
        Ok(match name {
            "" | "eq" => Self::Eq,
            "ne" => Self::Ne,
            "exists" => Self::Exists,
            "lt" => Self::Lt,
            "lte" => Self::Lte,
            "gt" => Self::Gt,
            "gte" => Self::Gte,
            "match" => Self::Match,
            "all" => Self::All,
            "in" => Self::In,
            "nin" => Self::Nin,
            other => return Err(CmsError::query(format!("unknown comparator [{}]", other))),
        })
    }

    /// Comparators taking a comma-separated value list.
    pub fn takes_list(&self) -> bool {
        matches!(self, Self::All | Self::In | Self::Nin)
    }
}

/// One `path[comparator]=value` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterTerm {
    pub path: String,
    pub comparator: Comparator,
    pub values: Vec<String>,
}

/// One `order` term.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSpec {
    pub path: String,
    pub descending: bool,
}

/// A decoded query request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueryRequest {
    pub content_type: String,
    /// `None` or `"default"` selects the space default.
    pub locale: Option<String>,
    pub skip: u64,
    pub limit: Option<u64>,
    pub order: Vec<OrderSpec>,
    /// Carried for a projection layer; not interpreted here.
    pub include: Option<u8>,
    /// Carried for a projection layer; not interpreted here.
    pub select: Vec<String>,
    pub filters: Vec<FilterTerm>,
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| CmsError::query(format!("{} must be a non-negative integer, got {:?}", key, value)))
}

/// Split `path[cmp]` into path and comparator name.
fn split_key(key: &str) -> Result<(&str, &str)> {
    match key.find('[') {
        None => Ok((key, "")),
        Some(open) => {
            let rest = &key[open + 1..];
            let close = rest
                .strip_suffix(']')
                .ok_or_else(|| CmsError::query(format!("malformed filter key {:?}", key)))?;
            Ok((&key[..open], close))
        }
    }
}

impl QueryRequest {
    pub fn new(content_type: &str) -> Self {
        Self {
            content_type: content_type.to_string(),
            ..Self::default()
        }
    }

    /// Parse decoded key/value pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut request = Self::default();
        for (key, value) in pairs {
            let (key, value) = (key.as_ref(), value.as_ref());
            match key {
                "content_type" => request.content_type = value.to_string(),
                "locale" => request.locale = Some(value.to_string()),
                "skip" => {
                    request.skip = parse_number(key, value)?;
                    request.check_skip()?;
                }
                "limit" => request.limit = Some(parse_number(key, value)?),
                "include" => request.include = Some(parse_number(key, value)?),
                "select" => request.select = split_list(value),
                "order" => {
                    request.order = split_list(value)
                        .into_iter()
                        .map(|term| match term.strip_prefix('-') {
                            Some(path) => OrderSpec {
                                path: path.to_string(),
                                descending: true,
                            },
                            None => OrderSpec {
                                path: term,
                                descending: false,
                            },
                        })
                        .collect();
                }
                _ => {
                    let (path, comparator) = split_key(key)?;
                    let comparator = Comparator::parse(comparator)?;
                    let values = if comparator.takes_list() {
                        split_list(value)
                    } else {
                        vec![value.to_string()]
                    };
                    request.filters.push(FilterTerm {
                        path: strip_fields_prefix(path).to_string(),
                        comparator,
                        values,
                    });
                }
            }
        }
        if request.content_type.is_empty() {
            return Err(CmsError::query("content_type is required"));
        }
        Ok(request)
    }

    pub fn with_filter(mut self, path: &str, comparator: Comparator, values: &[&str]) -> Self {
        self.filters.push(FilterTerm {
            path: strip_fields_prefix(path).to_string(),
            comparator,
            values: values.iter().map(|v| v.to_string()).collect(),
        });
        self
    }

    pub fn with_order(mut self, path: &str, descending: bool) -> Self {
        self.order.push(OrderSpec {
            path: strip_fields_prefix(path).to_string(),
            descending,
        });
        self
    }

    pub fn with_locale(mut self, locale: &str) -> Self {
        self.locale = Some(locale.to_string());
        self
    }

    pub fn with_page(mut self, skip: u64, limit: u64) -> Self {
        self.skip = skip;
        self.limit = Some(limit);
        self
    }

    /// Reject offsets above [`MAX_SKIP`].
    pub fn check_skip(&self) -> Result<()> {
        if self.skip > MAX_SKIP {
            return Err(CmsError::query(format!(
                "skip must be at most {}, got {}",
                MAX_SKIP, self.skip
            )));
        }
        Ok(())
    }

    /// Effective page size: the default when unset, capped at [`MAX_LIMIT`].
    pub fn take(&self) -> u64 {
        self.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT)
    }
}

fn strip_fields_prefix(path: &str) -> &str {
    path.strip_prefix("fields.").unwrap_or(path)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
