//! Payload to row conversion.
//!
//! One row per `(sys_id, locale)`: a row for every space locale present in
//! the payload plus the default locale. Array-of-link fields produce edge rows
//! for their ConTable, one per element, keyed by position.

use std::collections::BTreeSet;

use serde_json::Value;
use tracing::warn;

use cms_core::{
    link_id, row_id, Asset, CmsError, ColumnDef, Entry, FieldType, Ident, QualifiedName,
    Result, Space, SqlType, SqlValue,
};
use cms_schema::{asset_fields, CompiledSchema, ConTable, GeneratedTable, Storage};

/// Rows of one record for its table.
#[derive(Debug, Clone)]
pub struct RecordRows {
    pub sys_id: String,
    pub table: Ident,
    pub columns: Vec<ColumnDef>,
    pub rows: Vec<Vec<SqlValue>>,
    /// Locales a row was produced for.
    pub locales: Vec<String>,
    /// Edge rows per ConTable of the record's type, including empty sets.
    pub edges: Vec<EdgeSet>,
}

/// Replacement edge set of one array-of-link field.
#[derive(Debug, Clone)]
pub struct EdgeSet {
    pub con_table: Ident,
    pub field_id: String,
    pub rows: Vec<Vec<SqlValue>>,
    /// Whether the payload carried the field at all.
    pub present: bool,
}

impl RecordRows {
    pub fn qualified(&self, namespace: &Ident) -> QualifiedName {
        QualifiedName::new(namespace, &self.table)
    }
}

/// Builds rows against a compiled schema.
pub struct RowBuilder<'a> {
    schema: &'a CompiledSchema,
    space: &'a Space,
    default_locale: String,
}

fn apply_error(sys_id: &str, field: &str, message: impl std::fmt::Display) -> CmsError {
    CmsError::apply(format!("{}.{}: {}", sys_id, field, message))
}

fn opt_text(value: &Option<String>) -> SqlValue {
    value.clone().map(SqlValue::Text).unwrap_or(SqlValue::Null)
}

/// Convert a payload value to the SQL value of a column.
///
/// `lenient` columns (unknown field kinds) keep non-string values as JSON
/// text.
pub fn convert_value(value: &Value, ty: &SqlType, lenient: bool) -> std::result::Result<SqlValue, String> {
    if value.is_null() {
        return Ok(SqlValue::Null);
    }
    match ty {
        SqlType::Text => match value {
            Value::String(s) => Ok(SqlValue::text(s.clone())),
            other if lenient => Ok(SqlValue::text(other.to_string())),
            other => Err(format!("expected text, got {}", other)),
        },
        // `integer` columns are 32-bit
        SqlType::Integer => match value.as_i64() {
            Some(n) if i32::try_from(n).is_ok() => Ok(SqlValue::Int(n)),
            Some(n) => Err(format!("integer {} out of range for integer column", n)),
            None => Err(format!("expected integer, got {}", value)),
        },
        SqlType::Decimal => match value {
            Value::Number(n) if n.is_i64() => Ok(SqlValue::Int(n.as_i64().unwrap_or_default())),
            Value::Number(n) => n
                .as_f64()
                .map(SqlValue::Float)
                .ok_or_else(|| format!("expected number, got {}", n)),
            other => Err(format!("expected number, got {}", other)),
        },
        SqlType::Date => value
            .as_str()
            .map(SqlValue::text)
            .ok_or_else(|| format!("expected date string, got {}", value)),
        SqlType::Boolean => value
            .as_bool()
            .map(SqlValue::Bool)
            .ok_or_else(|| format!("expected boolean, got {}", value)),
        SqlType::Point => {
            let lat = value.get("lat").and_then(Value::as_f64);
            let lon = value.get("lon").and_then(Value::as_f64);
            match (lat, lon) {
                (Some(lat), Some(lon)) => Ok(SqlValue::Point { lon, lat }),
                _ => Err(format!("expected location, got {}", value)),
            }
        }
        SqlType::Jsonb => Ok(SqlValue::Json(value.clone())),
        SqlType::Array(inner) => match value {
            Value::Array(items) => items
                .iter()
                .map(|item| convert_value(item, inner, lenient))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map(SqlValue::Array),
            other => Err(format!("expected array, got {}", other)),
        },
    }
}

impl<'a> RowBuilder<'a> {
    pub fn new(schema: &'a CompiledSchema, space: &'a Space) -> Result<Self> {
        let default_locale = space.default_locale()?.code.clone();
        Ok(Self {
            schema,
            space,
            default_locale,
        })
    }

    pub fn default_locale(&self) -> &str {
        &self.default_locale
    }

    /// Canonical locale codes of the payload keys, in space order, always
    /// including the default locale. Unknown codes are logged and skipped.
    fn row_locales<'k>(&self, sys_id: &str, keys: impl Iterator<Item = &'k String>) -> Vec<String> {
        let mut present = BTreeSet::new();
        present.insert(self.default_locale.clone());
        for key in keys {
            match self.space.lookup_locale_code(key) {
                Some(code) => {
                    present.insert(code.to_string());
                }
                None => warn!(sys_id = sys_id, locale = key.as_str(), "Unknown payload locale skipped"),
            }
        }
        self.space
            .locale_codes()
            .into_iter()
            .filter(|code| present.contains(*code))
            .map(str::to_string)
            .collect()
    }

    /// Value of a field for one locale; payload keys may be aliases.
    fn localized_value<'v>(&self, values: &'v cms_core::LocalizedValue, locale: &str) -> Option<&'v Value> {
        values.iter().find_map(|(key, value)| {
            (self.space.lookup_locale_code(key) == Some(locale)).then_some(value)
        })
    }

    /// Table of a content type, `None` if it is not in the compiled schema.
    pub fn table_for(&self, content_type: &str) -> Option<&'a GeneratedTable> {
        self.schema.tables.iter().find(|t| t.content_type == content_type)
    }

    pub fn entry_rows(&self, entry: &Entry) -> Result<RecordRows> {
        let table = self.table_for(&entry.sys.content_type).ok_or_else(|| {
            CmsError::ContentTypeNotFound {
                id: entry.sys.content_type.clone(),
            }
        })?;
        let sys = &entry.sys;
        let lenient: BTreeSet<&str> = table
            .source
            .iter()
            .flat_map(|ct| ct.fields.iter())
            .filter(|f| f.kind == FieldType::Unknown)
            .map(|f| f.id.as_str())
            .collect();

        let locales = self.row_locales(
            &sys.id,
            entry
                .fields
                .iter()
                .filter(|(id, _)| table.field(id).map(|f| f.localized).unwrap_or(false))
                .flat_map(|(_, values)| values.keys()),
        );

        let mut rows = Vec::with_capacity(locales.len());
        for locale in &locales {
            let mut row = vec![
                SqlValue::text(row_id(&sys.id, locale)),
                SqlValue::text(sys.id.clone()),
                SqlValue::text(locale.clone()),
                SqlValue::Int(sys.version),
                SqlValue::Int(sys.revision),
                opt_text(&sys.created_at),
                opt_text(&sys.updated_at),
                opt_text(&sys.published_at),
            ];
            for layout in &table.fields {
                let Storage::Column(ty) = &layout.storage else {
                    continue;
                };
                let read_locale = if layout.localized {
                    locale.as_str()
                } else {
                    self.default_locale.as_str()
                };
                let value = entry
                    .fields
                    .get(&layout.field_id)
                    .and_then(|values| self.localized_value(values, read_locale));
                let converted = match value {
                    None => SqlValue::Null,
                    Some(v) if layout.classification != cms_schema::Classification::NoReference => {
                        if v.is_null() {
                            SqlValue::Null
                        } else {
                            link_id(v)
                                .map(SqlValue::text)
                                .ok_or_else(|| apply_error(&sys.id, &layout.field_id, "expected link"))?
                        }
                    }
                    Some(v) => convert_value(v, ty, lenient.contains(layout.field_id.as_str()))
                        .map_err(|e| apply_error(&sys.id, &layout.field_id, e))?,
                };
                row.push(converted);
            }
            rows.push(row);
        }

        let mut edges = Vec::with_capacity(table.con_tables.len());
        for con in &table.con_tables {
            edges.push(self.edge_set(entry, con, &locales)?);
        }

        Ok(RecordRows {
            sys_id: sys.id.clone(),
            table: table.name.clone(),
            columns: table.columns.clone(),
            rows,
            locales,
            edges,
        })
    }

    fn edge_set(&self, entry: &Entry, con: &ConTable, locales: &[String]) -> Result<EdgeSet> {
        let sys_id = &entry.sys.id;
        let values = entry.fields.get(&con.field_id);
        let mut rows = Vec::new();

        let edge_locales: Vec<&str> = if con.localized {
            locales.iter().map(String::as_str).collect()
        } else {
            vec![self.default_locale.as_str()]
        };

        for locale in edge_locales {
            let Some(items) = values.and_then(|v| self.localized_value(v, locale)) else {
                continue;
            };
            let items = match items {
                Value::Null => continue,
                Value::Array(items) => items,
                other => return Err(apply_error(sys_id, &con.field_id, format!("expected array, got {}", other))),
            };
            let owner_id = row_id(sys_id, locale);
            for (position, item) in items.iter().enumerate() {
                let target = link_id(item)
                    .ok_or_else(|| apply_error(sys_id, &con.field_id, "expected link"))?;
                rows.push(vec![
                    SqlValue::text(format!("{}_{}", owner_id, position)),
                    SqlValue::text(owner_id.clone()),
                    SqlValue::text(sys_id.clone()),
                    SqlValue::text(row_id(target, locale)),
                    SqlValue::text(target),
                    SqlValue::text(locale),
                    SqlValue::Int(position as i64),
                ]);
            }
        }

        Ok(EdgeSet {
            con_table: con.name.clone(),
            field_id: con.field_id.clone(),
            rows,
            present: values.is_some(),
        })
    }

    pub fn asset_rows(&self, asset: &Asset) -> Result<RecordRows> {
        let table = &self.schema.assets;
        let sys = &asset.sys;
        let fields = &asset.fields;
        let locales = self.row_locales(&sys.id, asset.locales());

        let pick = |map: &std::collections::BTreeMap<String, String>, locale: &str| {
            map.iter()
                .find(|(key, _)| self.space.lookup_locale_code(key) == Some(locale))
                .map(|(_, v)| SqlValue::text(v.clone()))
                .unwrap_or(SqlValue::Null)
        };

        let mut rows = Vec::with_capacity(locales.len());
        for locale in &locales {
            let file = fields
                .file
                .iter()
                .find(|(key, _)| self.space.lookup_locale_code(key) == Some(locale.as_str()))
                .map(|(_, file)| file);
            let mut row = vec![
                SqlValue::text(row_id(&sys.id, locale)),
                SqlValue::text(sys.id.clone()),
                SqlValue::text(locale.clone()),
                SqlValue::Int(sys.version),
                SqlValue::Int(sys.revision),
                opt_text(&sys.created_at),
                opt_text(&sys.updated_at),
                opt_text(&sys.published_at),
            ];
            for layout in &table.fields {
                row.push(match layout.field_id.as_str() {
                    asset_fields::TITLE => pick(&fields.title, locale),
                    asset_fields::DESCRIPTION => pick(&fields.description, locale),
                    asset_fields::FILE_NAME => file
                        .map(|f| SqlValue::text(f.file_name.clone()))
                        .unwrap_or(SqlValue::Null),
                    asset_fields::CONTENT_TYPE => file
                        .map(|f| SqlValue::text(f.content_type.clone()))
                        .unwrap_or(SqlValue::Null),
                    asset_fields::URL => file
                        .map(|f| SqlValue::text(f.url.clone()))
                        .unwrap_or(SqlValue::Null),
                    _ => SqlValue::Null,
                });
            }
            rows.push(row);
        }

        Ok(RecordRows {
            sys_id: sys.id.clone(),
            table: table.name.clone(),
            columns: table.columns.clone(),
            rows,
            locales,
            edges: Vec::new(),
        })
    }
}
