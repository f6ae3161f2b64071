//! Content model: spaces, locales, content types, entries and assets.
//!
//! These are passive data types mirroring what the upstream content source
//! delivers. Behaviour lives in the compiler and the sync engine.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CmsError, Result};

/// Locale code used by callers to ask for the space default.
pub const DEFAULT_LOCALE_KEYWORD: &str = "default";

/// Synthetic primary key of a row: one row per `(sys_id, locale)`.
pub fn row_id(sys_id: &str, locale: &str) -> String {
    format!("{}_{}", sys_id, locale)
}

/// Tenant root owning the locale configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Space {
    /// Space identifier.
    pub id: String,

    /// Display name.
    #[serde(default)]
    pub name: String,

    /// Ordered locales, exactly one of them default.
    pub locales: Vec<Locale>,
}

/// A locale of a space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Locale {
    /// Locale code, e.g. `en-US`.
    pub code: String,

    /// Display name.
    #[serde(default)]
    pub name: String,

    /// Whether this is the space default.
    #[serde(default)]
    pub default: bool,

    /// Locale consulted when a value is missing in this one.
    #[serde(default)]
    pub fallback_code: Option<String>,

    /// Alternative codes accepted for this locale.
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl Locale {
    /// Create a locale with no fallback and no aliases.
    pub fn new(code: &str, default: bool) -> Self {
        Self {
            code: code.to_string(),
            name: code.to_string(),
            default,
            fallback_code: None,
            aliases: Vec::new(),
        }
    }

    /// Set the fallback locale.
    pub fn with_fallback(mut self, code: &str) -> Self {
        self.fallback_code = Some(code.to_string());
        self
    }

    /// Add an alias code.
    pub fn with_alias(mut self, alias: &str) -> Self {
        self.aliases.push(alias.to_string());
        self
    }

    fn answers_to(&self, code: &str) -> bool {
        self.code == code || self.aliases.iter().any(|a| a == code)
    }
}

impl Space {
    /// Create a space from its locales.
    pub fn new(id: &str, locales: Vec<Locale>) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            locales,
        }
    }

    /// Check locale invariants: one default, known fallbacks, no cycles.
    pub fn validate(&self) -> Result<()> {
        let defaults = self.locales.iter().filter(|l| l.default).count();
        if defaults != 1 {
            return Err(CmsError::invalid_space(format!(
                "expected exactly one default locale, found {}",
                defaults
            )));
        }

        let mut seen = HashSet::new();
        for locale in &self.locales {
            for code in std::iter::once(&locale.code).chain(locale.aliases.iter()) {
                if !seen.insert(code.as_str()) {
                    return Err(CmsError::invalid_space(format!(
                        "locale code {} declared twice",
                        code
                    )));
                }
            }
        }

        for locale in &self.locales {
            self.fallback_chain(&locale.code)?;
        }

        Ok(())
    }

    /// The default locale.
    pub fn default_locale(&self) -> Result<&Locale> {
        self.locales
            .iter()
            .find(|l| l.default)
            .ok_or_else(|| CmsError::invalid_space("space has no default locale"))
    }

    /// Find a locale by code or alias.
    pub fn locale(&self, code: &str) -> Option<&Locale> {
        self.locales.iter().find(|l| l.answers_to(code))
    }

    /// Map a payload or request locale code to its canonical code.
    pub fn lookup_locale_code(&self, code: &str) -> Option<&str> {
        self.locale(code).map(|l| l.code.as_str())
    }

    /// Resolve a requested locale; `None` and `"default"` mean the default locale.
    pub fn resolve_locale(&self, requested: Option<&str>) -> Result<&Locale> {
        match requested {
            None => self.default_locale(),
            Some(code) if code == DEFAULT_LOCALE_KEYWORD => self.default_locale(),
            Some(code) => self.locale(code).ok_or_else(|| CmsError::LocaleNotFound {
                code: code.to_string(),
            }),
        }
    }

    /// The tenant fallback of a locale: its declared fallback, or the default.
    pub fn fallback_of(&self, code: &str) -> Result<&str> {
        let locale = self.resolve_locale(Some(code))?;
        match &locale.fallback_code {
            Some(fallback) => self
                .lookup_locale_code(fallback)
                .ok_or_else(|| CmsError::invalid_space(format!("unknown fallback locale {}", fallback))),
            None => Ok(self.default_locale()?.code.as_str()),
        }
    }

    /// Ordered lookup sequence for a locale, ending at the default locale.
    pub fn fallback_chain(&self, code: &str) -> Result<Vec<&str>> {
        let default_code = self.default_locale()?.code.as_str();
        let mut current = self.resolve_locale(Some(code))?;
        let mut chain: Vec<&str> = Vec::new();

        loop {
            if chain.contains(&current.code.as_str()) {
                return Err(CmsError::invalid_space(format!(
                    "fallback cycle through locale {}",
                    current.code
                )));
            }
            chain.push(current.code.as_str());

            if current.code == default_code {
                return Ok(chain);
            }

            current = match &current.fallback_code {
                Some(fallback) => self.locale(fallback).ok_or_else(|| {
                    CmsError::invalid_space(format!("unknown fallback locale {}", fallback))
                })?,
                None => self.default_locale()?,
            };
        }
    }

    /// Canonical locale codes in declaration order.
    pub fn locale_codes(&self) -> Vec<&str> {
        self.locales.iter().map(|l| l.code.as_str()).collect()
    }
}

/// A content type: the schema of one kind of entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentType {
    /// Stable identifier.
    pub id: String,

    /// Display name.
    #[serde(default)]
    pub name: String,

    /// Optional description.
    #[serde(default)]
    pub description: Option<String>,

    /// Field used as the entry title.
    #[serde(default)]
    pub display_field: Option<String>,

    /// Ordered field definitions.
    pub fields: Vec<Field>,
}

impl ContentType {
    /// Create a content type with the given fields.
    pub fn new(id: &str, fields: Vec<Field>) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            description: None,
            display_field: None,
            fields,
        }
    }

    /// Look up a field by id.
    pub fn field(&self, id: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.id == id)
    }

    /// Blake3 digest of the canonical JSON form, hex encoded.
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(blake3::hash(&canonical).as_bytes())
    }
}

/// Declared kind of a field as delivered upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    Symbol,
    Text,
    Integer,
    Number,
    Date,
    Boolean,
    Location,
    Object,
    RichText,
    Link,
    Array,
    #[serde(other)]
    Unknown,
}

/// Kind of record a link points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkType {
    Entry,
    Asset,
}

/// Field validation; only `linkContentType` is interpreted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldValidation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_content_type: Option<Vec<String>>,
}

/// Item definition of an array field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldItems {
    #[serde(rename = "type")]
    pub kind: FieldType,

    #[serde(default)]
    pub link_type: Option<LinkType>,

    #[serde(default)]
    pub validations: Vec<FieldValidation>,
}

/// A field of a content type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    /// Field identifier, unique within the content type.
    pub id: String,

    /// Display name.
    #[serde(default)]
    pub name: String,

    /// Declared kind.
    #[serde(rename = "type")]
    pub kind: FieldType,

    /// Target kind for `Link` fields.
    #[serde(default)]
    pub link_type: Option<LinkType>,

    /// Item definition for `Array` fields.
    #[serde(default)]
    pub items: Option<FieldItems>,

    #[serde(default)]
    pub validations: Vec<FieldValidation>,

    #[serde(default)]
    pub required: bool,

    #[serde(default)]
    pub localized: bool,

    #[serde(default)]
    pub unique: bool,

    #[serde(default)]
    pub disabled: bool,

    /// Omitted fields are not delivered and get no column.
    #[serde(default)]
    pub omitted: bool,
}

/// Scalar value kinds a column can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    Text,
    Integer,
    Number,
    Date,
    Boolean,
    Location,
    Object,
}

/// Where a link resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkTarget {
    /// The asset table.
    Asset,
    /// Entries restricted to the listed content types (empty: any type).
    Entry { content_types: Vec<String> },
}

/// Element kind of an array field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArrayItems {
    Scalar(ScalarKind),
    Link(LinkTarget),
}

/// A field is exactly one of scalar, single link or array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldShape {
    Scalar(ScalarKind),
    Link(LinkTarget),
    Array(ArrayItems),
}

impl FieldType {
    /// Scalar kind for non-structural types; unknown kinds default to text.
    pub fn scalar_kind(&self) -> Option<ScalarKind> {
        match self {
            Self::Symbol | Self::Text | Self::Unknown => Some(ScalarKind::Text),
            Self::Integer => Some(ScalarKind::Integer),
            Self::Number => Some(ScalarKind::Number),
            Self::Date => Some(ScalarKind::Date),
            Self::Boolean => Some(ScalarKind::Boolean),
            Self::Location => Some(ScalarKind::Location),
            Self::Object | Self::RichText => Some(ScalarKind::Object),
            Self::Link | Self::Array => None,
        }
    }
}

fn link_target(
    owner: &str,
    field: &str,
    link_type: Option<LinkType>,
    validations: &[FieldValidation],
) -> Result<LinkTarget> {
    match link_type {
        Some(LinkType::Asset) => Ok(LinkTarget::Asset),
        Some(LinkType::Entry) => {
            let content_types = validations
                .iter()
                .filter_map(|v| v.link_content_type.as_ref())
                .flatten()
                .cloned()
                .collect();
            Ok(LinkTarget::Entry { content_types })
        }
        None => Err(CmsError::compile(
            owner,
            format!("link field {} has no link type", field),
        )),
    }
}

impl Field {
    /// Create a scalar or link-less field of the given kind.
    pub fn new(id: &str, kind: FieldType) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            kind,
            link_type: None,
            items: None,
            validations: Vec::new(),
            required: false,
            localized: false,
            unique: false,
            disabled: false,
            omitted: false,
        }
    }

    /// Create a single link to an entry of the given content type.
    pub fn entry_link(id: &str, content_type: &str) -> Self {
        let mut field = Self::new(id, FieldType::Link);
        field.link_type = Some(LinkType::Entry);
        field.validations = vec![FieldValidation {
            link_content_type: Some(vec![content_type.to_string()]),
        }];
        field
    }

    /// Create a single link to an asset.
    pub fn asset_link(id: &str) -> Self {
        let mut field = Self::new(id, FieldType::Link);
        field.link_type = Some(LinkType::Asset);
        field
    }

    /// Create an array of links to entries of the given content type.
    pub fn entry_links(id: &str, content_type: &str) -> Self {
        let mut field = Self::new(id, FieldType::Array);
        field.items = Some(FieldItems {
            kind: FieldType::Link,
            link_type: Some(LinkType::Entry),
            validations: vec![FieldValidation {
                link_content_type: Some(vec![content_type.to_string()]),
            }],
        });
        field
    }

    /// Create an array of scalars.
    pub fn scalar_array(id: &str, kind: FieldType) -> Self {
        let mut field = Self::new(id, FieldType::Array);
        field.items = Some(FieldItems {
            kind,
            link_type: None,
            validations: Vec::new(),
        });
        field
    }

    /// Mark the field as localized.
    pub fn localized(mut self) -> Self {
        self.localized = true;
        self
    }

    /// Classify the field; `owner` is the content type id used in errors.
    pub fn shape(&self, owner: &str) -> Result<FieldShape> {
        match self.kind {
            FieldType::Link => Ok(FieldShape::Link(link_target(
                owner,
                &self.id,
                self.link_type,
                &self.validations,
            )?)),
            FieldType::Array => {
                let items = self.items.as_ref().ok_or_else(|| {
                    CmsError::compile(owner, format!("array field {} has no items", self.id))
                })?;
                match items.kind {
                    FieldType::Link => Ok(FieldShape::Array(ArrayItems::Link(link_target(
                        owner,
                        &self.id,
                        items.link_type,
                        &items.validations,
                    )?))),
                    FieldType::Array => Err(CmsError::compile(
                        owner,
                        format!("array field {} nests another array", self.id),
                    )),
                    other => match other.scalar_kind() {
                        Some(kind) => Ok(FieldShape::Array(ArrayItems::Scalar(kind))),
                        None => Err(CmsError::compile(
                            owner,
                            format!("array field {} has unsupported items", self.id),
                        )),
                    },
                }
            }
            other => other
                .scalar_kind()
                .map(FieldShape::Scalar)
                .ok_or_else(|| CmsError::compile(owner, format!("field {} is unsupported", self.id))),
        }
    }
}

/// Per-locale values of one field: `locale -> value`.
pub type LocalizedValue = BTreeMap<String, Value>;

/// System metadata of an entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntrySys {
    pub id: String,
    pub content_type: String,
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub revision: i64,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub published_at: Option<String>,
}

/// A versioned content record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub sys: EntrySys,

    /// `fields[field_id][locale] -> value`.
    #[serde(default)]
    pub fields: BTreeMap<String, LocalizedValue>,
}

impl Entry {
    /// Create an entry with no field values.
    pub fn new(id: &str, content_type: &str) -> Self {
        Self {
            sys: EntrySys {
                id: id.to_string(),
                content_type: content_type.to_string(),
                version: 1,
                revision: 1,
                created_at: None,
                updated_at: None,
                published_at: None,
            },
            fields: BTreeMap::new(),
        }
    }

    /// Set a field value for one locale.
    pub fn with_field(mut self, field: &str, locale: &str, value: Value) -> Self {
        self.fields
            .entry(field.to_string())
            .or_default()
            .insert(locale.to_string(), value);
        self
    }
}

/// File metadata of an asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetFile {
    pub file_name: String,
    pub content_type: String,
    pub url: String,
}

/// Fixed field set of an asset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetFields {
    #[serde(default)]
    pub title: BTreeMap<String, String>,
    #[serde(default)]
    pub description: BTreeMap<String, String>,
    #[serde(default)]
    pub file: BTreeMap<String, AssetFile>,
}

/// System metadata of an asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetSys {
    pub id: String,
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub revision: i64,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub published_at: Option<String>,
}

/// A binary asset (image, document) with localized metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub sys: AssetSys,
    #[serde(default)]
    pub fields: AssetFields,
}

impl Asset {
    /// Create an asset with a file in one locale.
    pub fn new(id: &str, locale: &str, title: &str, url: &str) -> Self {
        let mut fields = AssetFields::default();
        fields.title.insert(locale.to_string(), title.to_string());
        fields.file.insert(
            locale.to_string(),
            AssetFile {
                file_name: url.rsplit('/').next().unwrap_or(url).to_string(),
                content_type: "application/octet-stream".to_string(),
                url: url.to_string(),
            },
        );
        Self {
            sys: AssetSys {
                id: id.to_string(),
                version: 1,
                revision: 1,
                created_at: None,
                updated_at: None,
                published_at: None,
            },
            fields,
        }
    }

    /// Locales this asset carries any value in.
    pub fn locales(&self) -> impl Iterator<Item = &String> {
        self.fields
            .title
            .keys()
            .chain(self.fields.description.keys())
            .chain(self.fields.file.keys())
    }
}

/// Kind of deleted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TombstoneKind {
    DeletedEntry,
    DeletedAsset,
}

/// Deletion marker carrying only identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tombstone {
    pub sys_id: String,
    pub kind: TombstoneKind,
    /// Owning content type, when the source reports it.
    #[serde(default)]
    pub content_type: Option<String>,
}

impl Tombstone {
    /// Tombstone for an entry of a known content type.
    pub fn entry(sys_id: &str, content_type: &str) -> Self {
        Self {
            sys_id: sys_id.to_string(),
            kind: TombstoneKind::DeletedEntry,
            content_type: Some(content_type.to_string()),
        }
    }

    /// Tombstone for an asset.
    pub fn asset(sys_id: &str) -> Self {
        Self {
            sys_id: sys_id.to_string(),
            kind: TombstoneKind::DeletedAsset,
            content_type: None,
        }
    }
}

/// Where the next fetch continues from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageCursor {
    /// More pages follow in this cycle.
    Next(String),
    /// Cycle complete; the token resumes the next cycle.
    Done(String),
}

impl PageCursor {
    /// The resumable token carried by either variant.
    pub fn token(&self) -> &str {
        match self {
            Self::Next(token) | Self::Done(token) => token,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done(_))
    }
}

/// One page of the upstream delta feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPage {
    #[serde(default)]
    pub entries: Vec<Entry>,
    #[serde(default)]
    pub assets: Vec<Asset>,
    #[serde(default)]
    pub deletions: Vec<Tombstone>,
    #[serde(default)]
    pub content_types: Vec<ContentType>,
    pub cursor: PageCursor,
}

impl SyncPage {
    /// An empty page ending the cycle with the given token.
    pub fn done(token: &str) -> Self {
        Self {
            entries: Vec::new(),
            assets: Vec::new(),
            deletions: Vec::new(),
            content_types: Vec::new(),
            cursor: PageCursor::Done(token.to_string()),
        }
    }

    /// An empty page followed by another page.
    pub fn next(token: &str) -> Self {
        Self {
            cursor: PageCursor::Next(token.to_string()),
            ..Self::done(token)
        }
    }

    pub fn with_entry(mut self, entry: Entry) -> Self {
        self.entries.push(entry);
        self
    }

    pub fn with_asset(mut self, asset: Asset) -> Self {
        self.assets.push(asset);
        self
    }

    pub fn with_deletion(mut self, tombstone: Tombstone) -> Self {
        self.deletions.push(tombstone);
        self
    }

    /// Number of records carried by the page.
    pub fn len(&self) -> usize {
        self.entries.len() + self.assets.len() + self.deletions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Extract the target id from a link value `{"sys": {"id": ...}}`.
pub fn link_id(value: &Value) -> Option<&str> {
    value.get("sys")?.get("id")?.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn space() -> Space {
        Space::new(
            "demo",
            vec![
                Locale::new("en-US", true).with_alias("en"),
                Locale::new("de-DE", false),
                Locale::new("de-AT", false).with_fallback("de-DE"),
            ],
        )
    }

    #[test]
    fn test_space_validates() {
        assert!(space().validate().is_ok());
    }

    #[test]
    fn test_space_requires_single_default() {
        let space = Space::new(
            "bad",
            vec![Locale::new("en-US", true), Locale::new("fr-FR", true)],
        );
        assert!(matches!(space.validate(), Err(CmsError::InvalidSpace { .. })));
    }

    #[test]
    fn test_fallback_cycle_rejected() {
        let space = Space::new(
            "cyclic",
            vec![
                Locale::new("en-US", true),
                Locale::new("de-DE", false).with_fallback("de-AT"),
                Locale::new("de-AT", false).with_fallback("de-DE"),
            ],
        );
        assert!(space.validate().is_err());
    }

    #[test]
    fn test_fallback_chain_ends_at_default() {
        let space = space();
        assert_eq!(
            space.fallback_chain("de-AT").unwrap(),
            vec!["de-AT", "de-DE", "en-US"]
        );
        assert_eq!(space.fallback_chain("en-US").unwrap(), vec!["en-US"]);
        assert_eq!(space.fallback_of("de-AT").unwrap(), "de-DE");
        assert_eq!(space.fallback_of("de-DE").unwrap(), "en-US");
    }

    #[test]
    fn test_resolve_locale() {
        let space = space();
        assert_eq!(space.resolve_locale(None).unwrap().code, "en-US");
        assert_eq!(space.resolve_locale(Some("default")).unwrap().code, "en-US");
        assert_eq!(space.resolve_locale(Some("en")).unwrap().code, "en-US");
        assert!(matches!(
            space.resolve_locale(Some("xx")),
            Err(CmsError::LocaleNotFound { .. })
        ));
    }

    #[test]
    fn test_field_shapes() {
        assert_eq!(
            Field::new("title", FieldType::Symbol).shape("t").unwrap(),
            FieldShape::Scalar(ScalarKind::Text)
        );
        assert_eq!(
            Field::asset_link("image").shape("t").unwrap(),
            FieldShape::Link(LinkTarget::Asset)
        );
        assert_eq!(
            Field::entry_links("tags", "tag").shape("t").unwrap(),
            FieldShape::Array(ArrayItems::Link(LinkTarget::Entry {
                content_types: vec!["tag".to_string()]
            }))
        );
        assert_eq!(
            Field::scalar_array("keywords", FieldType::Symbol)
                .shape("t")
                .unwrap(),
            FieldShape::Array(ArrayItems::Scalar(ScalarKind::Text))
        );
    }

    #[test]
    fn test_invalid_shapes_are_compile_errors() {
        let dangling = Field::new("broken", FieldType::Link);
        assert!(matches!(dangling.shape("t"), Err(CmsError::Compile { .. })));

        let no_items = Field::new("list", FieldType::Array);
        assert!(no_items.shape("t").is_err());

        let nested = Field::scalar_array("matrix", FieldType::Array);
        assert!(nested.shape("t").is_err());
    }

    #[test]
    fn test_content_type_deserializes() {
        let ct: ContentType = serde_json::from_value(json!({
            "id": "product",
            "name": "Product",
            "displayField": "name",
            "fields": [
                {"id": "name", "type": "Symbol", "localized": true},
                {"id": "brand", "type": "Link", "linkType": "Entry",
                 "validations": [{"linkContentType": ["brand"]}, {"size": {"max": 3}}]},
                {"id": "blob", "type": "SomethingNew"}
            ]
        }))
        .unwrap();
        assert_eq!(ct.fields.len(), 3);
        assert!(ct.fields[0].localized);
        assert_eq!(ct.fields[2].kind, FieldType::Unknown);
        assert_eq!(
            ct.fields[1].shape("product").unwrap(),
            FieldShape::Link(LinkTarget::Entry {
                content_types: vec!["brand".to_string()]
            })
        );
    }

    #[test]
    fn test_fingerprint_tracks_changes() {
        let a = ContentType::new("product", vec![Field::new("name", FieldType::Symbol)]);
        let mut b = a.clone();
        assert_eq!(a.fingerprint(), b.fingerprint());
        b.fields[0].localized = true;
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_link_id() {
        let value = json!({"sys": {"type": "Link", "linkType": "Entry", "id": "abc"}});
        assert_eq!(link_id(&value), Some("abc"));
        assert_eq!(link_id(&json!("abc")), None);
    }

    #[test]
    fn test_row_id() {
        assert_eq!(row_id("abc", "en-US"), "abc_en-US");
    }
}
