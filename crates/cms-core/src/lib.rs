//! cms-core - Core types and traits for contentdb
//!
//! This crate provides the content model, the typed SQL statement builder,
//! the join-plan AST, collaborator traits, configuration and error handling
//! used throughout the workspace.

pub mod cancel;
pub mod config;
pub mod error;
#[cfg(any(test, feature = "fixtures"))]
pub mod fixtures;
pub mod model;
pub mod plan;
pub mod sql;
pub mod telemetry;
pub mod traits;

pub use cancel::{CancelHandle, Cancellation};
pub use config::*;
pub use error::{CmsError, Result};
pub use model::*;
pub use plan::*;
pub use sql::*;
pub use telemetry::init_tracing;
pub use traits::*;
