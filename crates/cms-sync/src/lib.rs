//! cms-sync - Content replication into the compiled schema
//!
//! The first cycle of a namespace bulk-loads every page through `COPY` in a
//! single transaction. Later cycles apply one transaction per delta page:
//! upserts keyed on row id, ConTable edge replacement, tombstone deletes and
//! the page's sync token.

pub mod engine;
pub mod rows;

pub use engine::{SyncEngine, SyncMode, SyncReport, SyncState};
pub use rows::{convert_value, EdgeSet, RecordRows, RowBuilder};
