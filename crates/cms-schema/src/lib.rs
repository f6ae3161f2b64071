//! cms-schema - Schema compilation and query procedure generation
//!
//! Turns content types into tables, ConTables, indexes and delete triggers,
//! resolves link fields into references and dependency edges, and builds
//! one locale-aware query function per content type.

pub mod compiler;
pub mod links;
pub mod naming;
pub mod procedure;
pub mod render;

pub use compiler::{
    asset_fields, scalar_type, CompileFailure, CompiledSchema, ConTable, DeleteTrigger,
    FieldLayout, GeneratedTable, IndexSpec, SchemaCompiler, Storage,
};
pub use links::{
    classify, Classification, Dependency, DependencyGraph, Reference, ReferenceKind, TargetRef,
};
pub use naming::ASSETS_TABLE;
pub use procedure::{ProcedureGenerator, DEFAULT_MAX_INCLUDE_DEPTH};
pub use render::PgPlanRenderer;
