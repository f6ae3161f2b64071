//! cms-query - Query DSL translation
//!
//! Parses Contentful-style query parameters into a [`QueryRequest`], resolves
//! its field paths against a compiled schema and produces a parameterized
//! [`ProcedureCall`](cms_core::ProcedureCall) over a generated query function
//! or materialized view.
//!
//! # Example
//!
//! ```rust,ignore
//! use cms_query::{QueryRequest, QueryService};
//!
//! let request = QueryRequest::from_pairs([
//!     ("content_type", "product"),
//!     ("fields.price[gt]", "15"),
//!     ("order", "-price"),
//! ])?;
//! let page = service.query(&request).await?;
//! ```

pub mod request;
pub mod translator;

pub use request::{Comparator, FilterTerm, OrderSpec, QueryRequest, DEFAULT_LIMIT, MAX_LIMIT, MAX_SKIP};
pub use translator::{match_pattern, sniff, QueryService, QueryTarget, QueryTranslator};
