//! cms-views - Materialized view management
//!
//! One materialized view per (content type, locale) over the type's query
//! function. Publishing a content type refreshes the views of every type
//! that reads it, on a bounded worker pool.

pub mod manager;
pub mod pool;

pub use manager::ViewManager;
pub use pool::{RefreshFailure, RefreshJob, RefreshPool, RefreshReport};
