//! Core traits defining the interfaces to external collaborators.

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{ContentType, Space, SyncPage};
use crate::sql::{Batch, Ident, ProcedureCall, QueryPage};

/// Upstream content delivery API.
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Space metadata including its locales.
    async fn space(&self) -> Result<Space>;

    /// All content type definitions, in upstream order.
    async fn content_types(&self) -> Result<Vec<ContentType>>;

    /// Fetch one page of the delta feed.
    ///
    /// `None` starts an initial sync; otherwise the token returned by the
    /// previous page's cursor. Rate limiting is reported as
    /// [`CmsError::RateLimited`](crate::CmsError::RateLimited).
    async fn sync_page(&self, token: Option<&str>) -> Result<SyncPage>;
}

/// Relational store.
#[async_trait]
pub trait Database: Send + Sync {
    /// Execute all statements in one transaction; on error nothing is applied.
    async fn execute(&self, batch: Batch) -> Result<()>;

    /// Open a write transaction that spans several batches.
    async fn begin<'a>(&'a self) -> Result<Box<dyn Transaction + 'a>>;

    /// Invoke a query procedure, returning the total count and one page.
    async fn call(&self, call: &ProcedureCall) -> Result<QueryPage>;

    /// Token saved in `schema._sync_token`, `None` if absent.
    async fn load_sync_token(&self, schema: &Ident) -> Result<Option<String>>;

    /// Whether the schema (namespace) exists.
    async fn schema_exists(&self, schema: &Ident) -> Result<bool>;

    /// Release connections.
    async fn close(&self);
}

/// Write transaction opened by [`Database::begin`].
///
/// Batches apply in order and become visible on `commit`. After a failed
/// batch only `rollback` is meaningful. Dropping without `commit` rolls back.
#[async_trait]
pub trait Transaction: Send {
    async fn execute(&mut self, batch: Batch) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}
