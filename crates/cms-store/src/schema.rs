//! Catalog queries used by the PostgreSQL store.

/// Whether a schema exists; `$1` is the schema name.
pub const SCHEMA_EXISTS: &str =
    "SELECT EXISTS (SELECT 1 FROM pg_namespace WHERE nspname = $1::text)";

/// Whether a relation exists; `$1` is a quoted qualified name.
pub const TABLE_EXISTS: &str = "SELECT to_regclass($1::text) IS NOT NULL";

/// Snapshot for the count and items statements of one procedure call.
pub const READ_SNAPSHOT: &str = "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY";
