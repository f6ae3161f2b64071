//! cms-store - Storage backends for the content mirror
//!
//! [`PgStore`] executes statement batches against PostgreSQL through a sqlx
//! pool. [`MemoryStore`] interprets the same batches and procedure plans in
//! process and backs the test suites of the other crates.

mod memory;
mod postgres;
mod schema;

pub use memory::{eval_predicate, ilike, MemoryStore, Row};
pub use postgres::{encode_csv, PgStore};
