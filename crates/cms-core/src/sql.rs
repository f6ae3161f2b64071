//! Typed SQL statement builder.
//!
//! Identifiers (schema, table and column names) come from the compiled
//! schema and are validated [`Ident`]s rendered double-quoted. Values never
//! appear in SQL text: they are collected as [`SqlValue`] parameters and
//! rendered as `$n::<type>` placeholders. Every parameter is bound as text
//! (or a text array) and cast server-side, so binding is uniform.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CmsError, Result};
use crate::plan::ProcedurePlan;

/// Longest identifier PostgreSQL keeps without truncation.
pub const MAX_IDENT_LEN: usize = 63;

/// Rows per multi-row INSERT before a new statement is started.
const ROWS_PER_STATEMENT: usize = 500;

/// Column names shared by every generated table.
pub mod columns {
    pub const ID: &str = "id";
    pub const SYS_ID: &str = "sys_id";
    pub const LOCALE: &str = "locale";
    pub const VERSION: &str = "version";
    pub const REVISION: &str = "revision";
    pub const CREATED_AT: &str = "created_at";
    pub const UPDATED_AT: &str = "updated_at";
    pub const PUBLISHED_AT: &str = "published_at";

    /// ConTable columns.
    pub const OWNER_ID: &str = "owner_id";
    pub const OWNER_SYS_ID: &str = "owner_sys_id";
    pub const TARGET_ID: &str = "target_id";
    pub const TARGET_SYS_ID: &str = "target_sys_id";
    pub const POSITION: &str = "position";

    /// Nested JSON document produced by query functions.
    pub const DATA: &str = "_data";

    /// Names a content field may not take.
    pub const RESERVED: &[&str] = &[
        ID,
        SYS_ID,
        LOCALE,
        VERSION,
        REVISION,
        CREATED_AT,
        UPDATED_AT,
        PUBLISHED_AT,
        DATA,
    ];
}

/// A validated SQL identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ident(String);

impl Ident {
    /// Validate an identifier: `[a-z_][a-z0-9_]*`, at most 63 bytes.
    pub fn new(name: &str) -> Result<Self> {
        let valid = !name.is_empty()
            && name.len() <= MAX_IDENT_LEN
            && name
                .chars()
                .next()
                .map(|c| c.is_ascii_lowercase() || c == '_')
                .unwrap_or(false)
            && name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

        if valid {
            Ok(Self(name.to_string()))
        } else {
            Err(CmsError::InvalidIdentifier {
                name: name.to_string(),
            })
        }
    }

    /// Turn an arbitrary name into a valid identifier.
    ///
    /// camelCase becomes snake_case, other characters become `_`, and names
    /// longer than 63 bytes keep a prefix plus a short blake3 suffix so
    /// distinct inputs stay distinct.
    pub fn sanitize(raw: &str) -> Self {
        let mut out = String::with_capacity(raw.len() + 4);
        let mut prev_lower = false;

        for c in raw.chars() {
            if c.is_ascii_uppercase() {
                if prev_lower {
                    out.push('_');
                }
                out.push(c.to_ascii_lowercase());
                prev_lower = false;
            } else if c.is_ascii_lowercase() || c.is_ascii_digit() {
                out.push(c);
                prev_lower = true;
            } else if c == '_' {
                out.push(c);
                prev_lower = false;
            } else {
                if !out.ends_with('_') {
                    out.push('_');
                }
                prev_lower = false;
            }
        }

        if out.chars().all(|c| c == '_') {
            out = "x".to_string();
        }
        if out.starts_with(|c: char| c.is_ascii_digit()) {
            out.insert(0, '_');
        }

        if out.len() > MAX_IDENT_LEN {
            let digest = hex::encode(&blake3::hash(raw.as_bytes()).as_bytes()[..4]);
            out.truncate(MAX_IDENT_LEN - digest.len() - 1);
            out.push('_');
            out.push_str(&digest);
        }

        Self(out)
    }

    /// Identifier for a name known to be valid at compile time.
    pub(crate) fn trusted(name: &'static str) -> Self {
        debug_assert!(Self::new(name).is_ok(), "invalid trusted identifier {}", name);
        Self(name.to_string())
    }

    /// Identifier with a suffix appended, shortened if needed.
    pub fn with_suffix(&self, suffix: &str) -> Self {
        Self::sanitize(&format!("{}{}", self.0, suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Double-quoted form for SQL text.
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shorthand for [`Ident::trusted`] on the shared column names.
pub fn col(name: &'static str) -> Ident {
    Ident::trusted(name)
}

/// Schema-qualified object name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QualifiedName {
    pub schema: Ident,
    pub name: Ident,
}

impl QualifiedName {
    pub fn new(schema: &Ident, name: &Ident) -> Self {
        Self {
            schema: schema.clone(),
            name: name.clone(),
        }
    }

    /// Same object name under another schema.
    pub fn in_schema(&self, schema: &Ident) -> Self {
        Self::new(schema, &self.name)
    }

    pub fn quoted(&self) -> String {
        format!("{}.{}", self.schema.quoted(), self.name.quoted())
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Column types produced by the compiler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SqlType {
    Text,
    Integer,
    Decimal,
    Date,
    Point,
    Boolean,
    Jsonb,
    Array(Box<SqlType>),
}

impl SqlType {
    /// Type name as written in DDL and casts.
    pub fn ddl(&self) -> String {
        match self {
            Self::Text => "text".to_string(),
            Self::Integer => "integer".to_string(),
            Self::Decimal => "numeric".to_string(),
            Self::Date => "timestamptz".to_string(),
            Self::Point => "point".to_string(),
            Self::Boolean => "boolean".to_string(),
            Self::Jsonb => "jsonb".to_string(),
            Self::Array(inner) => format!("{}[]", inner.ddl()),
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Self::Array(_))
    }

    /// Array type with this element type.
    pub fn array_of(&self) -> SqlType {
        match self {
            Self::Array(_) => self.clone(),
            other => Self::Array(Box::new(other.clone())),
        }
    }

    /// Whether values of this type are ordered by `<`/`>`.
    pub fn is_orderable(&self) -> bool {
        matches!(
            self,
            Self::Text | Self::Integer | Self::Decimal | Self::Date | Self::Boolean
        )
    }
}

/// A parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Json(Value),
    Point { lon: f64, lat: f64 },
    Array(Vec<SqlValue>),
}

impl SqlValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Text representation used for binding; `None` binds SQL NULL.
    pub fn to_sql_text(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Bool(b) => Some(b.to_string()),
            Self::Int(i) => Some(i.to_string()),
            Self::Float(f) => Some(f.to_string()),
            Self::Text(s) => Some(s.clone()),
            Self::Json(v) => Some(v.to_string()),
            Self::Point { lon, lat } => Some(format!("({},{})", lon, lat)),
            Self::Array(items) => Some(format!(
                "{{{}}}",
                items
                    .iter()
                    .map(|item| match item.to_sql_text() {
                        None => "NULL".to_string(),
                        Some(text) => {
                            format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
                        }
                    })
                    .collect::<Vec<_>>()
                    .join(",")
            )),
        }
    }

    /// JSON form of the value as it appears in query results.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::Text(s) => Value::String(s.clone()),
            Self::Json(v) => v.clone(),
            Self::Point { lon, lat } => serde_json::json!({ "lat": lat, "lon": lon }),
            Self::Array(items) => Value::Array(items.iter().map(|i| i.to_json()).collect()),
        }
    }

    /// SQL-style ordering; `None` when the values are not comparable.
    pub fn compare(&self, other: &SqlValue) -> Option<Ordering> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(b)),
            (Self::Int(a), Self::Float(b)) => (*a as f64).partial_cmp(b),
            (Self::Float(a), Self::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Self::Float(a), Self::Float(b)) => a.partial_cmp(b),
            (Self::Text(a), Self::Text(b)) => Some(a.cmp(b)),
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Equality with numeric widening; NULL equals nothing.
    pub fn sql_eq(&self, other: &SqlValue) -> bool {
        match (self, other) {
            (Self::Null, _) | (_, Self::Null) => false,
            (Self::Json(a), Self::Json(b)) => a == b,
            (Self::Point { .. }, Self::Point { .. }) => self == other,
            (Self::Array(a), Self::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.sql_eq(y))
            }
            _ => self.compare(other) == Some(Ordering::Equal),
        }
    }
}

/// A column definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: Ident,
    pub ty: SqlType,
    pub primary_key: bool,
    pub not_null: bool,
}

impl ColumnDef {
    pub fn new(name: Ident, ty: SqlType) -> Self {
        Self {
            name,
            ty,
            primary_key: false,
            not_null: false,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.not_null = true;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    fn ddl(&self) -> String {
        let mut out = format!("{} {}", self.name.quoted(), self.ty.ddl());
        if self.primary_key {
            out.push_str(" PRIMARY KEY");
        } else if self.not_null {
            out.push_str(" NOT NULL");
        }
        out
    }
}

/// A table definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDef {
    pub name: QualifiedName,
    pub columns: Vec<ColumnDef>,
}

impl TableDef {
    /// Primary key column, if any.
    pub fn primary_key(&self) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.primary_key)
    }
}

/// An index definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: Ident,
    pub table: QualifiedName,
    pub columns: Vec<Ident>,
    pub unique: bool,
}

/// Row-delete trigger removing ConTable rows owned by the deleted row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerDef {
    pub table: QualifiedName,
    pub con_tables: Vec<Ident>,
}

/// A generated query function.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub name: QualifiedName,
    pub output: Vec<ColumnDef>,
    /// Rendered SELECT body.
    pub body: String,
    /// Plan the body was rendered from.
    pub plan: Arc<ProcedurePlan>,
}

/// A per-(type, locale) materialized view over a query function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewDef {
    pub name: QualifiedName,
    pub function: QualifiedName,
    pub locale: String,
    pub unique_key: Ident,
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl CompareOp {
    fn sql(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "IS DISTINCT FROM",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Gt => ">",
            Self::Gte => ">=",
        }
    }

    /// Apply the operator to an ordering.
    pub fn holds(&self, ordering: Ordering) -> bool {
        match self {
            Self::Eq => ordering == Ordering::Equal,
            Self::Ne => ordering != Ordering::Equal,
            Self::Lt => ordering == Ordering::Less,
            Self::Lte => ordering != Ordering::Greater,
            Self::Gt => ordering == Ordering::Greater,
            Self::Gte => ordering != Ordering::Less,
        }
    }
}

/// A column reference with its type, used for placeholder casts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRef {
    pub name: Ident,
    pub ty: SqlType,
}

impl ColumnRef {
    pub fn new(name: Ident, ty: SqlType) -> Self {
        Self { name, ty }
    }

    fn sql(&self, alias: Option<&str>) -> String {
        match alias {
            Some(alias) => format!("{}.{}", alias, self.name.quoted()),
            None => self.name.quoted(),
        }
    }
}

/// Boolean condition over one row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    Compare {
        column: ColumnRef,
        op: CompareOp,
        value: SqlValue,
    },
    IsNull(ColumnRef),
    IsNotNull(ColumnRef),
    /// Case-insensitive pattern with `%` wildcards.
    Matches { column: ColumnRef, pattern: String },
    /// Array column contains every value.
    ContainsAll {
        column: ColumnRef,
        values: Vec<SqlValue>,
    },
    /// Scalar column equals one of, or array column overlaps, the values.
    AnyOf {
        column: ColumnRef,
        values: Vec<SqlValue>,
    },
    /// Negation of `AnyOf`; rows with NULL qualify.
    NoneOf {
        column: ColumnRef,
        values: Vec<SqlValue>,
    },
    And(Vec<Predicate>),
}

impl Predicate {
    /// `column = value` on a text column.
    pub fn text_eq(column: &'static str, value: &str) -> Self {
        Self::Compare {
            column: ColumnRef::new(col(column), SqlType::Text),
            op: CompareOp::Eq,
            value: SqlValue::text(value),
        }
    }

    /// Render with columns optionally qualified by `alias`.
    pub fn render(&self, alias: Option<&str>, params: &mut Params) -> String {
        match self {
            Self::Compare { column, op, value } => format!(
                "{} {} {}",
                column.sql(alias),
                op.sql(),
                params.bind(value.clone(), &column.ty)
            ),
            Self::IsNull(column) => format!("{} IS NULL", column.sql(alias)),
            Self::IsNotNull(column) => format!("{} IS NOT NULL", column.sql(alias)),
            Self::Matches { column, pattern } => {
                let target = if column.ty.is_array() {
                    format!("array_to_string({}, ' ')", column.sql(alias))
                } else {
                    format!("{}::text", column.sql(alias))
                };
                format!(
                    "{} ILIKE {}",
                    target,
                    params.bind(SqlValue::text(pattern.clone()), &SqlType::Text)
                )
            }
            Self::ContainsAll { column, values } => format!(
                "{} @> {}",
                column.sql(alias),
                params.bind(SqlValue::Array(values.clone()), &column.ty.array_of())
            ),
            Self::AnyOf { column, values } => {
                let placeholder = params.bind(SqlValue::Array(values.clone()), &column.ty.array_of());
                if column.ty.is_array() {
                    format!("{} && {}", column.sql(alias), placeholder)
                } else {
                    format!("{} = ANY({})", column.sql(alias), placeholder)
                }
            }
            Self::NoneOf { column, values } => {
                let placeholder = params.bind(SqlValue::Array(values.clone()), &column.ty.array_of());
                if column.ty.is_array() {
                    format!(
                        "({c} IS NULL OR NOT ({c} && {p}))",
                        c = column.sql(alias),
                        p = placeholder
                    )
                } else {
                    format!(
                        "({c} IS NULL OR {c} <> ALL({p}))",
                        c = column.sql(alias),
                        p = placeholder
                    )
                }
            }
            Self::And(parts) if parts.is_empty() => "TRUE".to_string(),
            Self::And(parts) => parts
                .iter()
                .map(|p| format!("({})", p.render(alias, params)))
                .collect::<Vec<_>>()
                .join(" AND "),
        }
    }
}

/// Parameter collector producing `$n::type` placeholders.
#[derive(Debug, Default)]
pub struct Params {
    values: Vec<SqlValue>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a value and return its placeholder.
    pub fn bind(&mut self, value: SqlValue, ty: &SqlType) -> String {
        self.values.push(value);
        format!("${}::{}", self.values.len(), ty.ddl())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_values(self) -> Vec<SqlValue> {
        self.values
    }
}

/// SQL text plus its parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedSql {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl RenderedSql {
    fn plain(sql: String) -> Self {
        Self {
            sql,
            params: Vec::new(),
        }
    }
}

/// Quote a trusted string as a SQL literal (DDL only, never user values).
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// One DDL or DML statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    CreateSchema(Ident),
    DropSchema(Ident),
    /// Promote `shadow` to `live`, retiring the previous live schema.
    SwapSchemas {
        live: Ident,
        shadow: Ident,
        retired: Ident,
    },
    CreateTable(TableDef),
    CreateIndex(IndexDef),
    CreateDeleteTrigger(TriggerDef),
    CreateFunction(FunctionDef),
    CreateMaterializedView(ViewDef),
    RefreshMaterializedView {
        name: QualifiedName,
        concurrently: bool,
    },
    /// `INSERT ... ON CONFLICT (conflict) DO UPDATE`.
    Upsert {
        table: QualifiedName,
        columns: Vec<ColumnDef>,
        rows: Vec<Vec<SqlValue>>,
        conflict: Ident,
    },
    Insert {
        table: QualifiedName,
        columns: Vec<ColumnDef>,
        rows: Vec<Vec<SqlValue>>,
    },
    /// Bulk load through `COPY ... FROM STDIN`.
    CopyIn {
        table: QualifiedName,
        columns: Vec<ColumnDef>,
        rows: Vec<Vec<SqlValue>>,
    },
    Delete {
        table: QualifiedName,
        predicate: Predicate,
    },
    SaveSyncToken {
        schema: Ident,
        token: String,
    },
}

/// Name of the sync token table.
pub const SYNC_TOKEN_TABLE: &str = "_sync_token";

/// Name of the locale table consulted by query functions.
pub const LOCALES_TABLE: &str = "_locales";

impl Statement {
    /// Short statement kind for logs and diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreateSchema(_) => "create_schema",
            Self::DropSchema(_) => "drop_schema",
            Self::SwapSchemas { .. } => "swap_schemas",
            Self::CreateTable(_) => "create_table",
            Self::CreateIndex(_) => "create_index",
            Self::CreateDeleteTrigger(_) => "create_delete_trigger",
            Self::CreateFunction(_) => "create_function",
            Self::CreateMaterializedView(_) => "create_materialized_view",
            Self::RefreshMaterializedView { .. } => "refresh_materialized_view",
            Self::Upsert { .. } => "upsert",
            Self::Insert { .. } => "insert",
            Self::CopyIn { .. } => "copy_in",
            Self::Delete { .. } => "delete",
            Self::SaveSyncToken { .. } => "save_sync_token",
        }
    }

    /// Schema the statement writes to.
    pub fn schema(&self) -> &Ident {
        match self {
            Self::CreateSchema(name) | Self::DropSchema(name) => name,
            Self::SwapSchemas { live, .. } => live,
            Self::CreateTable(def) => &def.name.schema,
            Self::CreateIndex(def) => &def.table.schema,
            Self::CreateDeleteTrigger(def) => &def.table.schema,
            Self::CreateFunction(def) => &def.name.schema,
            Self::CreateMaterializedView(def) => &def.name.schema,
            Self::RefreshMaterializedView { name, .. } => &name.schema,
            Self::Upsert { table, .. }
            | Self::Insert { table, .. }
            | Self::CopyIn { table, .. }
            | Self::Delete { table, .. } => &table.schema,
            Self::SaveSyncToken { schema, .. } => schema,
        }
    }

    /// Render as PostgreSQL. `CopyIn` renders only the `COPY` command; the
    /// executor streams the rows.
    pub fn render(&self) -> Vec<RenderedSql> {
        match self {
            Self::CreateSchema(name) => vec![RenderedSql::plain(format!(
                "CREATE SCHEMA IF NOT EXISTS {}",
                name.quoted()
            ))],
            Self::DropSchema(name) => vec![RenderedSql::plain(format!(
                "DROP SCHEMA IF EXISTS {} CASCADE",
                name.quoted()
            ))],
            Self::SwapSchemas {
                live,
                shadow,
                retired,
            } => vec![
                RenderedSql::plain(format!("DROP SCHEMA IF EXISTS {} CASCADE", retired.quoted())),
                RenderedSql::plain(format!(
                    "DO $$ BEGIN IF EXISTS (SELECT 1 FROM pg_namespace WHERE nspname = {}) THEN ALTER SCHEMA {} RENAME TO {}; END IF; END $$",
                    quote_literal(live.as_str()),
                    live.quoted(),
                    retired.quoted()
                )),
                RenderedSql::plain(format!(
                    "ALTER SCHEMA {} RENAME TO {}",
                    shadow.quoted(),
                    live.quoted()
                )),
                RenderedSql::plain(format!("DROP SCHEMA IF EXISTS {} CASCADE", retired.quoted())),
            ],
            Self::CreateTable(def) => vec![RenderedSql::plain(format!(
                "CREATE TABLE IF NOT EXISTS {} ({})",
                def.name.quoted(),
                def.columns
                    .iter()
                    .map(ColumnDef::ddl)
                    .collect::<Vec<_>>()
                    .join(", ")
            ))],
            Self::CreateIndex(def) => vec![RenderedSql::plain(format!(
                "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
                if def.unique { "UNIQUE " } else { "" },
                def.name.quoted(),
                def.table.quoted(),
                quoted_list(&def.columns)
            ))],
            Self::CreateDeleteTrigger(def) => render_trigger(def),
            Self::CreateFunction(def) => vec![RenderedSql::plain(format!(
                "CREATE OR REPLACE FUNCTION {}(_locale text) RETURNS TABLE ({}) LANGUAGE sql STABLE BEGIN ATOMIC {}; END",
                def.name.quoted(),
                def.output
                    .iter()
                    .map(|c| format!("{} {}", c.name.quoted(), c.ty.ddl()))
                    .collect::<Vec<_>>()
                    .join(", "),
                def.body
            ))],
            Self::CreateMaterializedView(def) => vec![
                RenderedSql::plain(format!(
                    "CREATE MATERIALIZED VIEW IF NOT EXISTS {} AS SELECT * FROM {}({}) WITH DATA",
                    def.name.quoted(),
                    def.function.quoted(),
                    quote_literal(&def.locale)
                )),
                RenderedSql::plain(format!(
                    "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} ({})",
                    def.name.name.with_suffix("_key").quoted(),
                    def.name.quoted(),
                    def.unique_key.quoted()
                )),
            ],
            Self::RefreshMaterializedView { name, concurrently } => {
                vec![RenderedSql::plain(format!(
                    "REFRESH MATERIALIZED VIEW {}{}",
                    if *concurrently { "CONCURRENTLY " } else { "" },
                    name.quoted()
                ))]
            }
            Self::Upsert {
                table,
                columns,
                rows,
                conflict,
            } => {
                let updates = columns
                    .iter()
                    .filter(|c| &c.name != conflict)
                    .map(|c| format!("{n} = EXCLUDED.{n}", n = c.name.quoted()))
                    .collect::<Vec<_>>()
                    .join(", ");
                let suffix = if updates.is_empty() {
                    format!(" ON CONFLICT ({}) DO NOTHING", conflict.quoted())
                } else {
                    format!(" ON CONFLICT ({}) DO UPDATE SET {}", conflict.quoted(), updates)
                };
                render_insert(table, columns, rows, &suffix)
            }
            Self::Insert {
                table,
                columns,
                rows,
            } => render_insert(table, columns, rows, ""),
            Self::CopyIn { table, columns, .. } => vec![RenderedSql::plain(format!(
                "COPY {} ({}) FROM STDIN WITH (FORMAT csv)",
                table.quoted(),
                quoted_list(&columns.iter().map(|c| c.name.clone()).collect::<Vec<_>>())
            ))],
            Self::Delete { table, predicate } => {
                let mut params = Params::new();
                let condition = predicate.render(None, &mut params);
                vec![RenderedSql {
                    sql: format!("DELETE FROM {} WHERE {}", table.quoted(), condition),
                    params: params.into_values(),
                }]
            }
            Self::SaveSyncToken { schema, token } => {
                let mut params = Params::new();
                let placeholder = params.bind(SqlValue::text(token.clone()), &SqlType::Text);
                vec![RenderedSql {
                    sql: format!(
                        "INSERT INTO {}.\"{}\" (\"id\", \"token\", \"updated_at\") VALUES (0, {}, now()) \
                         ON CONFLICT (\"id\") DO UPDATE SET \"token\" = EXCLUDED.\"token\", \"updated_at\" = EXCLUDED.\"updated_at\"",
                        schema.quoted(),
                        SYNC_TOKEN_TABLE,
                        placeholder
                    ),
                    params: params.into_values(),
                }]
            }
        }
    }
}

fn saturating_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn quoted_list(idents: &[Ident]) -> String {
    idents
        .iter()
        .map(Ident::quoted)
        .collect::<Vec<_>>()
        .join(", ")
}

fn render_insert(
    table: &QualifiedName,
    columns: &[ColumnDef],
    rows: &[Vec<SqlValue>],
    suffix: &str,
) -> Vec<RenderedSql> {
    let names = quoted_list(&columns.iter().map(|c| c.name.clone()).collect::<Vec<_>>());

    rows.chunks(ROWS_PER_STATEMENT)
        .map(|chunk| {
            let mut params = Params::new();
            let tuples = chunk
                .iter()
                .map(|row| {
                    let values = row
                        .iter()
                        .zip(columns)
                        .map(|(value, column)| params.bind(value.clone(), &column.ty))
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!("({})", values)
                })
                .collect::<Vec<_>>()
                .join(", ");
            RenderedSql {
                sql: format!(
                    "INSERT INTO {} ({}) VALUES {}{}",
                    table.quoted(),
                    names,
                    tuples,
                    suffix
                ),
                params: params.into_values(),
            }
        })
        .collect()
}

fn render_trigger(def: &TriggerDef) -> Vec<RenderedSql> {
    let function = QualifiedName::new(
        &def.table.schema,
        &def.table.name.with_suffix("_cascade"),
    );
    // Con tables are resolved through TG_TABLE_SCHEMA so the trigger keeps
    // working after the schema is renamed.
    let deletes = def
        .con_tables
        .iter()
        .map(|con| {
            format!(
                "EXECUTE format('DELETE FROM %I.%I WHERE {} = $1', TG_TABLE_SCHEMA, {}) USING OLD.{};",
                columns::OWNER_ID,
                quote_literal(con.as_str()),
                columns::ID
            )
        })
        .collect::<Vec<_>>()
        .join(" ");

    vec![
        RenderedSql::plain(format!(
            "CREATE OR REPLACE FUNCTION {}() RETURNS trigger LANGUAGE plpgsql AS $$ BEGIN {} RETURN OLD; END $$",
            function.quoted(),
            deletes
        )),
        RenderedSql::plain(format!(
            "DROP TRIGGER IF EXISTS {} ON {}",
            function.name.quoted(),
            def.table.quoted()
        )),
        RenderedSql::plain(format!(
            "CREATE TRIGGER {} AFTER DELETE ON {} FOR EACH ROW EXECUTE FUNCTION {}()",
            function.name.quoted(),
            def.table.quoted(),
            function.quoted()
        )),
    ]
}

/// An ordered batch of statements applied in one transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    statements: Vec<Statement>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, statement: Statement) {
        self.statements.push(statement);
    }

    pub fn extend(&mut self, statements: impl IntoIterator<Item = Statement>) {
        self.statements.extend(statements);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Statement> {
        self.statements.iter()
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn into_statements(self) -> Vec<Statement> {
        self.statements
    }
}

impl From<Vec<Statement>> for Batch {
    fn from(statements: Vec<Statement>) -> Self {
        Self { statements }
    }
}

impl From<Statement> for Batch {
    fn from(statement: Statement) -> Self {
        Self {
            statements: vec![statement],
        }
    }
}

/// What a query reads from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuerySource {
    /// Generated query function, called with the locale.
    Function(QualifiedName),
    /// Materialized view already bound to a locale.
    View(QualifiedName),
}

/// One ORDER BY term; NULLs always sort last.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderTerm {
    pub column: Ident,
    pub descending: bool,
}

/// An invocation of a generated query procedure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcedureCall {
    pub source: QuerySource,
    pub locale: String,
    pub filters: Vec<Predicate>,
    pub order: Vec<OrderTerm>,
    pub skip: u64,
    pub take: u64,
}

impl ProcedureCall {
    /// Order terms with the `sys_id` tiebreak appended.
    pub fn effective_order(&self) -> Vec<OrderTerm> {
        let mut order = self.order.clone();
        if !order.iter().any(|t| t.column.as_str() == columns::SYS_ID) {
            order.push(OrderTerm {
                column: col(columns::SYS_ID),
                descending: false,
            });
        }
        order
    }

    fn from_clause(&self, params: &mut Params) -> String {
        match &self.source {
            QuerySource::Function(name) => format!(
                "{}({}) AS t",
                name.quoted(),
                params.bind(SqlValue::text(self.locale.clone()), &SqlType::Text)
            ),
            QuerySource::View(name) => format!("{} AS t", name.quoted()),
        }
    }

    fn order_clause(&self, alias: &str) -> String {
        self.effective_order()
            .iter()
            .map(|term| {
                format!(
                    "{}.{} {} NULLS LAST",
                    alias,
                    term.column.quoted(),
                    if term.descending { "DESC" } else { "ASC" }
                )
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// `SELECT count(*)` over the filtered source.
    pub fn render_count(&self) -> RenderedSql {
        let mut params = Params::new();
        let from = self.from_clause(&mut params);
        let condition = Predicate::And(self.filters.clone()).render(Some("t"), &mut params);
        RenderedSql {
            sql: format!("SELECT count(*) FROM {} WHERE {}", from, condition),
            params: params.into_values(),
        }
    }

    /// JSON array of the `_data` documents of the requested page.
    pub fn render_items(&self) -> RenderedSql {
        let mut params = Params::new();
        let from = self.from_clause(&mut params);
        let condition = Predicate::And(self.filters.clone()).render(Some("t"), &mut params);
        let skip = params.bind(SqlValue::Int(saturating_i64(self.skip)), &SqlType::Integer);
        let take = params.bind(SqlValue::Int(saturating_i64(self.take)), &SqlType::Integer);
        RenderedSql {
            sql: format!(
                "SELECT COALESCE(jsonb_agg(p.{data} ORDER BY {outer}), '[]'::jsonb) FROM \
                 (SELECT t.* FROM {from} WHERE {condition} ORDER BY {inner} OFFSET {skip} LIMIT {take}) AS p",
                data = Ident::trusted(columns::DATA).quoted(),
                outer = self.order_clause("p"),
                from = from,
                condition = condition,
                inner = self.order_clause("t"),
                skip = skip,
                take = take
            ),
            params: params.into_values(),
        }
    }
}

/// Result of a procedure invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPage {
    /// Rows matching the filters, ignoring skip/take.
    pub count: u64,
    /// JSON array of items for the requested page.
    pub items: Value,
}

impl QueryPage {
    /// Items as a slice; empty when `items` is not an array.
    pub fn item_list(&self) -> &[Value] {
        self.items.as_array().map(Vec::as_slice).unwrap_or(&[])
    }
}
