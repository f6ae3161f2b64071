//! cms-migrate - Shadow-namespace migration orchestrator
//!
//! Rebuilds a tenant from scratch next to the live namespace and promotes
//! it with an atomic swap. A failure in any stage leaves live as it was.

pub mod orchestrator;

pub use orchestrator::{MigrationReport, MigrationStage, Migrator, PreparedMigration};
