//! Schema compiler: content types to relational tables.
//!
//! Every content type becomes one table with one row per `(sys_id, locale)`.
//! Scalar fields and single links become columns, arrays of links become
//! ConTables. Compilation never touches the database; [`CompiledSchema::ddl`]
//! turns the result into statements for a given namespace.

use std::collections::HashSet;

use cms_core::{
    col, columns, ArrayItems, CmsError, ColumnDef, ContentType, FieldShape, IndexDef, NodeKind,
    QualifiedName, Result, ScalarKind, Space, SqlType, SqlValue, Statement, TableDef, TriggerDef,
    Ident, LOCALES_TABLE, SYNC_TOKEN_TABLE,
};
use tracing::{debug, info, warn};

use crate::links::{classify, dependencies_of, Classification, Dependency, DependencyGraph, Reference, ReferenceKind, TargetRef};
use crate::naming::{self, ASSETS_TABLE};

/// Field ids of the asset table.
pub mod asset_fields {
    pub const TITLE: &str = "title";
    pub const DESCRIPTION: &str = "description";
    pub const FILE_NAME: &str = "fileName";
    pub const CONTENT_TYPE: &str = "contentType";
    pub const URL: &str = "url";
}

/// Where a field's value is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Storage {
    /// A column of the entry table.
    Column(SqlType),
    /// Rows of a ConTable.
    ConTable(Ident),
}

/// Layout of one field in its table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldLayout {
    pub field_id: String,
    pub column: Ident,
    pub localized: bool,
    pub shape: FieldShape,
    pub storage: Storage,
    pub classification: Classification,
}

/// Generated join table for one array-of-links field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConTable {
    pub name: Ident,
    pub owner_type: String,
    pub owner_table: Ident,
    pub field_id: String,
    pub localized: bool,
    pub target: TargetRef,
}

impl ConTable {
    pub fn columns() -> Vec<ColumnDef> {
        vec![
            ColumnDef::new(col(columns::ID), SqlType::Text).primary_key(),
            ColumnDef::new(col(columns::OWNER_ID), SqlType::Text).not_null(),
            ColumnDef::new(col(columns::OWNER_SYS_ID), SqlType::Text).not_null(),
            ColumnDef::new(col(columns::TARGET_ID), SqlType::Text),
            ColumnDef::new(col(columns::TARGET_SYS_ID), SqlType::Text).not_null(),
            ColumnDef::new(col(columns::LOCALE), SqlType::Text).not_null(),
            ColumnDef::new(col(columns::POSITION), SqlType::Integer).not_null(),
        ]
    }
}

/// An index without its namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: Ident,
    pub columns: Vec<Ident>,
    pub unique: bool,
}

/// Table generated for a content type or for assets.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedTable {
    pub content_type: String,
    pub name: Ident,
    pub kind: NodeKind,
    pub columns: Vec<ColumnDef>,
    pub fields: Vec<FieldLayout>,
    pub con_tables: Vec<ConTable>,
    pub indexes: Vec<IndexSpec>,
    /// Fingerprint of the source content type.
    pub fingerprint: String,
    /// Source definition (`None` for the asset table).
    pub source: Option<ContentType>,
}

impl GeneratedTable {
    pub fn field(&self, field_id: &str) -> Option<&FieldLayout> {
        self.fields.iter().find(|f| f.field_id == field_id)
    }

    pub fn has_localized(&self) -> bool {
        self.fields.iter().any(|f| f.localized)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name.as_str() == name)
    }
}

/// Delete trigger of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteTrigger {
    pub table: Ident,
    pub con_tables: Vec<Ident>,
}

/// A content type left out of the schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileFailure {
    pub content_type: String,
    pub message: String,
}

impl From<CompileFailure> for CmsError {
    fn from(failure: CompileFailure) -> Self {
        CmsError::compile(failure.content_type, failure.message)
    }
}

/// Output of [`SchemaCompiler::compile`].
#[derive(Debug, Clone)]
pub struct CompiledSchema {
    /// Content type tables in input order.
    pub tables: Vec<GeneratedTable>,
    pub assets: GeneratedTable,
    pub references: Vec<Reference>,
    pub dependencies: Vec<Dependency>,
    pub graph: DependencyGraph,
    pub delete_triggers: Vec<DeleteTrigger>,
    pub errors: Vec<CompileFailure>,
}

fn system_columns() -> Vec<ColumnDef> {
    vec![
        ColumnDef::new(col(columns::ID), SqlType::Text).primary_key(),
        ColumnDef::new(col(columns::SYS_ID), SqlType::Text).not_null(),
        ColumnDef::new(col(columns::LOCALE), SqlType::Text).not_null(),
        ColumnDef::new(col(columns::VERSION), SqlType::Integer),
        ColumnDef::new(col(columns::REVISION), SqlType::Integer),
        ColumnDef::new(col(columns::CREATED_AT), SqlType::Date),
        ColumnDef::new(col(columns::UPDATED_AT), SqlType::Date),
        ColumnDef::new(col(columns::PUBLISHED_AT), SqlType::Date),
    ]
}

/// SQL type of a scalar kind.
pub fn scalar_type(kind: ScalarKind) -> SqlType {
    match kind {
        ScalarKind::Text => SqlType::Text,
        ScalarKind::Integer => SqlType::Integer,
        ScalarKind::Number => SqlType::Decimal,
        ScalarKind::Date => SqlType::Date,
        ScalarKind::Boolean => SqlType::Boolean,
        ScalarKind::Location => SqlType::Point,
        ScalarKind::Object => SqlType::Jsonb,
    }
}

fn base_indexes(table: &Ident) -> Vec<IndexSpec> {
    let sys_id = col(columns::SYS_ID);
    let locale = col(columns::LOCALE);
    vec![
        IndexSpec {
            name: naming::index_name(table, &[&sys_id, &locale], true),
            columns: vec![sys_id.clone(), locale],
            unique: true,
        },
        IndexSpec {
            name: naming::index_name(table, &[&sys_id], false),
            columns: vec![sys_id],
            unique: false,
        },
    ]
}

impl CompiledSchema {
    /// Table of a content type id (`_assets` for the asset table).
    pub fn table(&self, content_type: &str) -> Option<&GeneratedTable> {
        if content_type == ASSETS_TABLE {
            return Some(&self.assets);
        }
        self.tables.iter().find(|t| t.content_type == content_type)
    }

    /// Content type tables plus the asset table.
    pub fn all_tables(&self) -> impl Iterator<Item = &GeneratedTable> {
        self.tables.iter().chain(std::iter::once(&self.assets))
    }

    pub fn con_tables(&self) -> impl Iterator<Item = &ConTable> {
        self.tables.iter().flat_map(|t| t.con_tables.iter())
    }

    pub fn content_type_ids(&self) -> impl Iterator<Item = &str> {
        self.tables.iter().map(|t| t.content_type.as_str())
    }

    /// Digest over the compiled content type fingerprints.
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for table in &self.tables {
            hasher.update(table.content_type.as_bytes());
            hasher.update(b"\0");
            hasher.update(table.fingerprint.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize().as_bytes())
    }

    /// Statements creating the schema in `namespace`: bookkeeping tables,
    /// asset and content tables, ConTables, indexes, delete triggers and the
    /// locale rows.
    pub fn ddl(&self, namespace: &Ident, space: &Space) -> Result<Vec<Statement>> {
        let mut out = vec![Statement::CreateSchema(namespace.clone())];

        let sync_token = QualifiedName::new(namespace, &col(SYNC_TOKEN_TABLE));
        out.push(Statement::CreateTable(TableDef {
            name: sync_token,
            columns: vec![
                ColumnDef::new(col(columns::ID), SqlType::Integer).primary_key(),
                ColumnDef::new(Ident::sanitize("token"), SqlType::Text).not_null(),
                ColumnDef::new(col(columns::UPDATED_AT), SqlType::Date),
            ],
        }));

        let locales = QualifiedName::new(namespace, &col(LOCALES_TABLE));
        let locale_columns = vec![
            ColumnDef::new(Ident::sanitize("code"), SqlType::Text).primary_key(),
            ColumnDef::new(Ident::sanitize("fallback_code"), SqlType::Text),
            ColumnDef::new(Ident::sanitize("is_default"), SqlType::Boolean).not_null(),
        ];
        out.push(Statement::CreateTable(TableDef {
            name: locales.clone(),
            columns: locale_columns.clone(),
        }));

        for table in self.all_tables() {
            let name = QualifiedName::new(namespace, &table.name);
            out.push(Statement::CreateTable(TableDef {
                name: name.clone(),
                columns: table.columns.clone(),
            }));
            for index in &table.indexes {
                out.push(Statement::CreateIndex(IndexDef {
                    name: index.name.clone(),
                    table: name.clone(),
                    columns: index.columns.clone(),
                    unique: index.unique,
                }));
            }

            for con in &table.con_tables {
                let con_name = QualifiedName::new(namespace, &con.name);
                out.push(Statement::CreateTable(TableDef {
                    name: con_name.clone(),
                    columns: ConTable::columns(),
                }));
                for column in [columns::OWNER_ID, columns::OWNER_SYS_ID, columns::TARGET_SYS_ID] {
                    let column = col(column);
                    out.push(Statement::CreateIndex(IndexDef {
                        name: naming::index_name(&con.name, &[&column], false),
                        table: con_name.clone(),
                        columns: vec![column],
                        unique: false,
                    }));
                }
            }
        }

        for trigger in &self.delete_triggers {
            out.push(Statement::CreateDeleteTrigger(TriggerDef {
                table: QualifiedName::new(namespace, &trigger.table),
                con_tables: trigger.con_tables.clone(),
            }));
        }

        let mut rows = Vec::with_capacity(space.locales.len());
        for locale in &space.locales {
            let fallback = if locale.default {
                SqlValue::Null
            } else {
                SqlValue::text(space.fallback_of(&locale.code)?)
            };
            rows.push(vec![
                SqlValue::text(locale.code.clone()),
                fallback,
                SqlValue::Bool(locale.default),
            ]);
        }
        out.push(Statement::Upsert {
            table: locales,
            columns: locale_columns,
            rows,
            conflict: Ident::sanitize("code"),
        });

        Ok(out)
    }
}

/// Compiles content types against a space.
pub struct SchemaCompiler {
    space: Space,
}

impl SchemaCompiler {
    /// Create a compiler; the space's locale configuration must be valid.
    pub fn new(space: &Space) -> Result<Self> {
        space.validate()?;
        Ok(Self {
            space: space.clone(),
        })
    }

    pub fn space(&self) -> &Space {
        &self.space
    }

    /// Compile all types. Types with invalid field shapes are recorded in
    /// `errors` and left out; the rest compile.
    pub fn compile(&self, types: &[ContentType]) -> CompiledSchema {
        self.compile_filtered(types, None)
    }

    /// Compile a single type. Links to other types still resolve against
    /// every type in `types`.
    pub fn compile_one(&self, types: &[ContentType], content_type: &str) -> Result<CompiledSchema> {
        if !types.iter().any(|t| t.id == content_type) {
            return Err(CmsError::ContentTypeNotFound {
                id: content_type.to_string(),
            });
        }
        let schema = self.compile_filtered(types, Some(content_type));
        if let Some(failure) = schema.errors.first() {
            return Err(failure.clone().into());
        }
        Ok(schema)
    }

    fn compile_filtered(&self, types: &[ContentType], only: Option<&str>) -> CompiledSchema {
        let mut errors = Vec::new();
        let mut valid = Vec::new();
        let mut seen_tables = HashSet::new();

        for ct in types {
            match validate_type(ct) {
                Ok(()) if !seen_tables.insert(naming::table_name(&ct.id)) => {
                    errors.push(CompileFailure {
                        content_type: ct.id.clone(),
                        message: format!("table name {} already taken", naming::table_name(&ct.id)),
                    });
                }
                Ok(()) => valid.push(ct),
                Err(e) => {
                    warn!(content_type = ct.id.as_str(), error = %e, "Content type not compiled");
                    errors.push(CompileFailure {
                        content_type: ct.id.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        let known: HashSet<String> = valid.iter().map(|ct| ct.id.clone()).collect();

        let mut tables = Vec::new();
        for ct in valid {
            if only.map(|id| id != ct.id).unwrap_or(false) {
                continue;
            }
            tables.push(compile_type(ct, &known));
        }
        if let Some(id) = only {
            errors.retain(|e| e.content_type == id);
        }

        let mut references = Vec::new();
        let mut delete_triggers = Vec::new();
        for table in &tables {
            for field in &table.fields {
                let (kind, target) = match &field.classification {
                    Classification::NoReference => continue,
                    Classification::OneToOne { target } => (ReferenceKind::OneToOne, target),
                    Classification::ManyToMany { target } => (ReferenceKind::ManyToMany, target),
                };
                let storage = match &field.storage {
                    Storage::Column(_) => field.column.clone(),
                    Storage::ConTable(name) => name.clone(),
                };
                references.push(Reference {
                    owner: table.content_type.clone(),
                    field_id: field.field_id.clone(),
                    kind,
                    target: target.clone(),
                    storage,
                });
            }
            if !table.con_tables.is_empty() {
                delete_triggers.push(DeleteTrigger {
                    table: table.name.clone(),
                    con_tables: table.con_tables.iter().map(|c| c.name.clone()).collect(),
                });
            }
        }

        let dependencies = references.iter().flat_map(dependencies_of).collect();
        let graph = DependencyGraph::from_references(&references);

        info!(
            tables = tables.len(),
            references = references.len(),
            errors = errors.len(),
            "Schema compiled"
        );

        CompiledSchema {
            tables,
            assets: asset_table(),
            references,
            dependencies,
            graph,
            delete_triggers,
            errors,
        }
    }
}

fn validate_type(ct: &ContentType) -> Result<()> {
    if ct.id.is_empty() {
        return Err(CmsError::compile("", "content type without id"));
    }
    if ct.id == ASSETS_TABLE || naming::table_name(&ct.id).as_str() == ASSETS_TABLE {
        return Err(CmsError::compile(&ct.id, "content type id collides with the asset table"));
    }
    let mut columns_seen = HashSet::new();
    for field in ct.fields.iter().filter(|f| !f.omitted) {
        field.shape(&ct.id)?;
        if !columns_seen.insert(naming::column_name(&field.id)) {
            return Err(CmsError::compile(
                &ct.id,
                format!("field {} maps to an existing column", field.id),
            ));
        }
    }
    Ok(())
}

fn compile_type(ct: &ContentType, known: &HashSet<String>) -> GeneratedTable {
    let table = naming::table_name(&ct.id);
    let mut columns = system_columns();
    let mut fields = Vec::new();
    let mut con_tables = Vec::new();
    let mut indexes = base_indexes(&table);

    for field in ct.fields.iter().filter(|f| !f.omitted) {
        // validate_type already checked the shape
        let Ok(shape) = field.shape(&ct.id) else {
            continue;
        };
        let column = naming::column_name(&field.id);
        let classification = classify(&ct.id, &field.id, &shape, known);

        let storage = match &shape {
            FieldShape::Scalar(kind) => {
                if field.kind == cms_core::FieldType::Unknown {
                    warn!(
                        content_type = ct.id.as_str(),
                        field = field.id.as_str(),
                        "Unknown field kind stored as text"
                    );
                }
                Storage::Column(scalar_type(*kind))
            }
            FieldShape::Array(ArrayItems::Scalar(kind)) => {
                Storage::Column(SqlType::Array(Box::new(scalar_type(*kind))))
            }
            FieldShape::Link(_) => {
                indexes.push(IndexSpec {
                    name: naming::index_name(&table, &[&column], false),
                    columns: vec![column.clone()],
                    unique: false,
                });
                Storage::Column(SqlType::Text)
            }
            FieldShape::Array(ArrayItems::Link(_)) => {
                let name = naming::con_table_name(&table, &column);
                let target = match &classification {
                    Classification::ManyToMany { target } => target.clone(),
                    _ => TargetRef::Unresolved {
                        reason: "not a many-to-many field".to_string(),
                    },
                };
                con_tables.push(ConTable {
                    name: name.clone(),
                    owner_type: ct.id.clone(),
                    owner_table: table.clone(),
                    field_id: field.id.clone(),
                    localized: field.localized,
                    target,
                });
                Storage::ConTable(name)
            }
        };

        if let Storage::Column(ty) = &storage {
            columns.push(ColumnDef::new(column.clone(), ty.clone()));
            if field.unique {
                let locale = col(columns::LOCALE);
                indexes.push(IndexSpec {
                    name: naming::index_name(&table, &[&column, &locale], false),
                    columns: vec![column.clone(), locale],
                    unique: false,
                });
            }
        }

        fields.push(FieldLayout {
            field_id: field.id.clone(),
            column,
            localized: field.localized,
            shape,
            storage,
            classification,
        });
    }

    debug!(
        content_type = ct.id.as_str(),
        table = table.as_str(),
        columns = columns.len(),
        con_tables = con_tables.len(),
        "Compiled content type"
    );

    GeneratedTable {
        content_type: ct.id.clone(),
        name: table,
        kind: NodeKind::Entry,
        columns,
        fields,
        con_tables,
        indexes,
        fingerprint: ct.fingerprint(),
        source: Some(ct.clone()),
    }
}

fn asset_table() -> GeneratedTable {
    let name = Ident::sanitize(ASSETS_TABLE);
    let mut columns = system_columns();
    let mut fields = Vec::new();
    for field_id in [
        asset_fields::TITLE,
        asset_fields::DESCRIPTION,
        asset_fields::FILE_NAME,
        asset_fields::CONTENT_TYPE,
        asset_fields::URL,
    ] {
        let column = naming::column_name(field_id);
        columns.push(ColumnDef::new(column.clone(), SqlType::Text));
        fields.push(FieldLayout {
            field_id: field_id.to_string(),
            column,
            localized: true,
            shape: FieldShape::Scalar(ScalarKind::Text),
            storage: Storage::Column(SqlType::Text),
            classification: Classification::NoReference,
        });
    }

    GeneratedTable {
        content_type: ASSETS_TABLE.to_string(),
        indexes: base_indexes(&name),
        name,
        kind: NodeKind::Asset,
        columns,
        fields,
        con_tables: Vec::new(),
        fingerprint: String::new(),
        source: None,
    }
}
