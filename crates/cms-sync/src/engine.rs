//! Sync engine: initial bulk load and incremental delta apply.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use cms_core::{
    columns, col, Batch, Cancellation, CmsError, ColumnDef, ColumnRef, ContentSource, ContentType,
    Database, Ident, Predicate, QualifiedName, Result, Space, SqlType, SqlValue, Statement,
    SyncConfig, SyncPage, TombstoneKind, Transaction,
};
use cms_schema::{CompiledSchema, ConTable};

use crate::rows::{RecordRows, RowBuilder};

/// Lifecycle of one sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    Idle,
    Fetching,
    Applying,
    Committed,
    Failed,
}

/// Whether a cycle bulk-loaded or applied deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    Initial,
    Delta,
}

/// Summary of one sync cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub mode: SyncMode,
    pub pages: usize,
    pub rows_upserted: usize,
    pub rows_copied: usize,
    pub deletions: usize,
    /// Array-of-link fields whose edges were replaced.
    pub edges_replaced: usize,
    /// Array-of-link fields cleared because the payload omitted them.
    pub edges_cleared: usize,
    /// Entries of content types missing from the schema.
    pub skipped: usize,
    pub token: Option<String>,
    /// The source delivered content type definitions that differ from the
    /// compiled schema.
    pub schema_changed: bool,
    pub elapsed_ms: u64,
}

impl SyncReport {
    fn new(mode: SyncMode) -> Self {
        Self {
            mode,
            pages: 0,
            rows_upserted: 0,
            rows_copied: 0,
            deletions: 0,
            edges_replaced: 0,
            edges_cleared: 0,
            skipped: 0,
            token: None,
            schema_changed: false,
            elapsed_ms: 0,
        }
    }
}

/// Replicates one space into one namespace.
///
/// A cycle runs with `&mut self`; one engine per tenant serializes its
/// cycles.
pub struct SyncEngine<S: ?Sized, D: ?Sized> {
    source: Arc<S>,
    db: Arc<D>,
    schema: Arc<CompiledSchema>,
    space: Space,
    namespace: Ident,
    config: SyncConfig,
    state: SyncState,
}

impl<S, D> SyncEngine<S, D>
where
    S: ContentSource + ?Sized,
    D: Database + ?Sized,
{
    pub fn new(
        source: Arc<S>,
        db: Arc<D>,
        schema: Arc<CompiledSchema>,
        space: Space,
        namespace: Ident,
    ) -> Self {
        Self {
            source,
            db,
            schema,
            space,
            namespace,
            config: SyncConfig::default(),
            state: SyncState::Idle,
        }
    }

    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn namespace(&self) -> &Ident {
        &self.namespace
    }

    /// Bulk load when no token is stored, apply deltas otherwise.
    pub async fn run(&mut self, cancel: &Cancellation) -> Result<SyncReport> {
        let token = self.db.load_sync_token(&self.namespace).await?;
        let result = match token {
            None => self.initial(cancel).await,
            Some(token) => self.delta(token, cancel).await,
        };
        self.finish(result)
    }

    async fn initial(&mut self, cancel: &Cancellation) -> Result<SyncReport> {
        self.load(cancel, true).await
    }

    /// Fetch every page from the start and copy it in one transaction.
    /// The token is returned in the report, not saved.
    pub async fn bulk_load(&mut self, cancel: &Cancellation) -> Result<SyncReport> {
        let result = self.load(cancel, false).await;
        self.finish(result)
    }

    fn finish(&mut self, result: Result<SyncReport>) -> Result<SyncReport> {
        match &result {
            Ok(report) => {
                self.state = SyncState::Committed;
                info!(
                    namespace = self.namespace.as_str(),
                    mode = ?report.mode,
                    pages = report.pages,
                    rows_copied = report.rows_copied,
                    rows_upserted = report.rows_upserted,
                    deletions = report.deletions,
                    skipped = report.skipped,
                    elapsed_ms = report.elapsed_ms,
                    "Sync committed"
                );
            }
            Err(e) => {
                self.state = SyncState::Failed;
                warn!(namespace = self.namespace.as_str(), error = %e, "Sync failed");
            }
        }
        result
    }

    /// Copy every page inside one transaction as it arrives. With
    /// `save_token` the final token commits together with the rows.
    async fn load(&mut self, cancel: &Cancellation, save_token: bool) -> Result<SyncReport> {
        let start = Instant::now();
        let mut report = SyncReport::new(SyncMode::Initial);
        let db = Arc::clone(&self.db);
        let mut tx = db.begin().await?;

        match self.copy_pages(tx.as_mut(), &mut report, cancel, save_token).await {
            Ok(token) => report.token = Some(token),
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "Bulk load rollback failed");
                }
                return Err(e);
            }
        }
        tx.commit().await?;

        report.elapsed_ms = start.elapsed().as_millis() as u64;
        Ok(report)
    }

    async fn copy_pages(
        &mut self,
        tx: &mut (dyn Transaction + '_),
        report: &mut SyncReport,
        cancel: &Cancellation,
        save_token: bool,
    ) -> Result<String> {
        let schema = Arc::clone(&self.schema);
        let builder = RowBuilder::new(&schema, &self.space)?;
        // tables holding each copied sys_id, for re-deliveries and tombstones
        let mut copied: HashMap<String, Vec<Ident>> = HashMap::new();
        let mut cursor: Option<String> = None;

        let token = loop {
            cancel.check()?;
            self.state = SyncState::Fetching;
            let page = self.fetch(cursor.as_deref(), cancel).await?;
            report.pages += 1;
            report.schema_changed |= self.detect_drift(&page.content_types);

            let mut records: BTreeMap<(Ident, String), RecordRows> = BTreeMap::new();
            for entry in &page.entries {
                if builder.table_for(&entry.sys.content_type).is_none() {
                    warn!(
                        sys_id = entry.sys.id.as_str(),
                        content_type = entry.sys.content_type.as_str(),
                        "Entry of unknown content type skipped"
                    );
                    report.skipped += 1;
                    continue;
                }
                let record = builder.entry_rows(entry)?;
                records.insert((record.table.clone(), record.sys_id.clone()), record);
            }
            for asset in &page.assets {
                let record = builder.asset_rows(asset)?;
                records.insert((record.table.clone(), record.sys_id.clone()), record);
            }

            // rows copied by an earlier page that this page replaces or deletes
            let mut stale: BTreeSet<(Ident, String)> = records
                .keys()
                .filter(|(table, sys_id)| {
                    copied
                        .get(sys_id)
                        .map(|tables| tables.contains(table))
                        .unwrap_or(false)
                })
                .cloned()
                .collect();
            for tombstone in &page.deletions {
                let before = records.len();
                records.retain(|(_, sys_id), _| sys_id != &tombstone.sys_id);
                let mut hit = records.len() < before;
                if let Some(tables) = copied.remove(&tombstone.sys_id) {
                    for table in tables {
                        stale.insert((table, tombstone.sys_id.clone()));
                    }
                    hit = true;
                }
                if hit {
                    report.deletions += 1;
                }
            }
            for (table, sys_id) in records.keys() {
                let tables = copied.entry(sys_id.clone()).or_default();
                if !tables.contains(table) {
                    tables.push(table.clone());
                }
            }

            let batch = self.copy_batch(stale, records, report);
            let statements = batch.len();
            if !batch.is_empty() {
                self.state = SyncState::Applying;
                tx.execute(batch).await?;
            }

            debug!(
                page = report.pages,
                entries = page.entries.len(),
                assets = page.assets.len(),
                deletions = page.deletions.len(),
                statements = statements,
                "Copied page"
            );

            let next = page.cursor.token().to_string();
            if page.cursor.is_done() {
                break next;
            }
            cursor = Some(next);
        };

        if save_token {
            tx.execute(Batch::from(Statement::SaveSyncToken {
                schema: self.namespace.clone(),
                token: token.clone(),
            }))
            .await?;
        }
        Ok(token)
    }

    /// Deletes of stale rows, then one `CopyIn` per table and ConTable.
    fn copy_batch(
        &self,
        stale: BTreeSet<(Ident, String)>,
        records: BTreeMap<(Ident, String), RecordRows>,
        report: &mut SyncReport,
    ) -> Batch {
        let mut batch = Batch::new();
        for (table, sys_id) in stale {
            batch.push(Statement::Delete {
                table: QualifiedName::new(&self.namespace, &table),
                predicate: Predicate::text_eq(columns::SYS_ID, &sys_id),
            });
        }

        let mut tables: BTreeMap<Ident, (Vec<ColumnDef>, Vec<Vec<SqlValue>>)> = BTreeMap::new();
        let mut edges: BTreeMap<Ident, Vec<Vec<SqlValue>>> = BTreeMap::new();
        for ((table, _), record) in records {
            let slot = tables
                .entry(table)
                .or_insert_with(|| (record.columns.clone(), Vec::new()));
            slot.1.extend(record.rows);
            for set in record.edges {
                edges.entry(set.con_table).or_default().extend(set.rows);
            }
        }

        for (table, (columns, rows)) in tables {
            if rows.is_empty() {
                continue;
            }
            report.rows_copied += rows.len();
            batch.push(Statement::CopyIn {
                table: QualifiedName::new(&self.namespace, &table),
                columns,
                rows,
            });
        }
        for (con, rows) in edges {
            if rows.is_empty() {
                continue;
            }
            batch.push(Statement::CopyIn {
                table: QualifiedName::new(&self.namespace, &con),
                columns: ConTable::columns(),
                rows,
            });
        }
        batch
    }

    async fn delta(&mut self, mut token: String, cancel: &Cancellation) -> Result<SyncReport> {
        let start = Instant::now();
        let mut report = SyncReport::new(SyncMode::Delta);

        loop {
            cancel.check()?;
            self.state = SyncState::Fetching;
            let page = self.fetch(Some(&token), cancel).await?;
            report.pages += 1;
            report.schema_changed |= self.detect_drift(&page.content_types);

            cancel.check()?;
            self.state = SyncState::Applying;
            let batch = self.page_batch(&page, &mut report)?;
            self.db.execute(batch).await?;

            debug!(
                page = report.pages,
                token = page.cursor.token(),
                records = page.len(),
                "Applied page"
            );

            token = page.cursor.token().to_string();
            if page.cursor.is_done() {
                break;
            }
        }

        report.token = Some(token);
        report.elapsed_ms = start.elapsed().as_millis() as u64;
        Ok(report)
    }

    /// Statements applying one delta page, ending with its token.
    pub fn page_batch(&self, page: &SyncPage, report: &mut SyncReport) -> Result<Batch> {
        let builder = RowBuilder::new(&self.schema, &self.space)?;
        let mut batch = Batch::new();

        for entry in &page.entries {
            if builder.table_for(&entry.sys.content_type).is_none() {
                warn!(
                    sys_id = entry.sys.id.as_str(),
                    content_type = entry.sys.content_type.as_str(),
                    "Entry of unknown content type skipped"
                );
                report.skipped += 1;
                continue;
            }
            let record = builder.entry_rows(entry)?;
            self.push_record(&mut batch, record, report);
        }
        for asset in &page.assets {
            let record = builder.asset_rows(asset)?;
            self.push_record(&mut batch, record, report);
        }

        for tombstone in &page.deletions {
            let tables: Vec<Ident> = match (tombstone.kind, &tombstone.content_type) {
                (TombstoneKind::DeletedAsset, _) => vec![self.schema.assets.name.clone()],
                (TombstoneKind::DeletedEntry, Some(ct)) => match builder.table_for(ct) {
                    Some(table) => vec![table.name.clone()],
                    None => {
                        report.skipped += 1;
                        continue;
                    }
                },
                (TombstoneKind::DeletedEntry, None) => {
                    self.schema.tables.iter().map(|t| t.name.clone()).collect()
                }
            };
            for table in tables {
                batch.push(Statement::Delete {
                    table: QualifiedName::new(&self.namespace, &table),
                    predicate: Predicate::text_eq(columns::SYS_ID, &tombstone.sys_id),
                });
            }
            report.deletions += 1;
        }

        batch.push(Statement::SaveSyncToken {
            schema: self.namespace.clone(),
            token: page.cursor.token().to_string(),
        });
        Ok(batch)
    }

    fn push_record(&self, batch: &mut Batch, record: RecordRows, report: &mut SyncReport) {
        let table = record.qualified(&self.namespace);
        report.rows_upserted += record.rows.len();
        batch.push(Statement::Upsert {
            table: table.clone(),
            columns: record.columns,
            rows: record.rows,
            conflict: col(columns::ID),
        });

        // rows of locales the entry no longer carries
        batch.push(Statement::Delete {
            table,
            predicate: Predicate::And(vec![
                Predicate::text_eq(columns::SYS_ID, &record.sys_id),
                Predicate::NoneOf {
                    column: ColumnRef::new(col(columns::LOCALE), SqlType::Text),
                    values: record.locales.iter().cloned().map(SqlValue::Text).collect(),
                },
            ]),
        });

        for set in record.edges {
            let con = QualifiedName::new(&self.namespace, &set.con_table);
            batch.push(Statement::Delete {
                table: con.clone(),
                predicate: Predicate::text_eq(columns::OWNER_SYS_ID, &record.sys_id),
            });
            if set.present {
                report.edges_replaced += 1;
            } else {
                report.edges_cleared += 1;
            }
            if !set.rows.is_empty() {
                batch.push(Statement::Insert {
                    table: con,
                    columns: ConTable::columns(),
                    rows: set.rows,
                });
            }
        }
    }

    /// Whether delivered definitions differ from the compiled ones.
    fn detect_drift(&self, delivered: &[ContentType]) -> bool {
        let mut changed = false;
        for ct in delivered {
            let compiled = self
                .schema
                .tables
                .iter()
                .find(|t| t.content_type == ct.id)
                .map(|t| t.fingerprint.as_str());
            if compiled != Some(ct.fingerprint().as_str()) {
                info!(content_type = ct.id.as_str(), "Content type definition changed upstream");
                changed = true;
            }
        }
        changed
    }

    /// Fetch one page, sleeping out rate limits.
    async fn fetch(&self, token: Option<&str>, cancel: &Cancellation) -> Result<SyncPage> {
        let mut attempts = 0u32;
        loop {
            match self.source.sync_page(token).await {
                Err(CmsError::RateLimited { retry_after }) if attempts < self.config.max_rate_limit_retries => {
                    attempts += 1;
                    let wait = retry_after.unwrap_or_else(|| self.config.default_backoff());
                    warn!(
                        attempt = attempts,
                        wait_ms = wait.as_millis() as u64,
                        "Rate limited by content source"
                    );
                    sleep_or_cancel(wait, cancel).await?;
                }
                other => return other,
            }
        }
    }
}

async fn sleep_or_cancel(wait: Duration, cancel: &Cancellation) -> Result<()> {
    let mut signal = cancel.clone();
    tokio::select! {
        _ = tokio::time::sleep(wait) => Ok(()),
        _ = signal.cancelled() => Err(CmsError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cms_core::fixtures::{
        brand, catalog_space, catalog_types, entry_link, product, tag, StaticSource, DE, EN,
    };
    use cms_core::{Asset, Entry, Tombstone};
    use cms_schema::SchemaCompiler;
    use cms_store::MemoryStore;
    use serde_json::json;

    fn ns() -> Ident {
        Ident::new("content").unwrap()
    }

    async fn setup() -> (Arc<StaticSource>, Arc<MemoryStore>, SyncEngine<StaticSource, MemoryStore>) {
        let space = catalog_space();
        let schema = SchemaCompiler::new(&space).unwrap().compile(&catalog_types());
        let store = Arc::new(MemoryStore::new());
        store
            .execute(Batch::from(schema.ddl(&ns(), &space).unwrap()))
            .await
            .unwrap();
        let source = Arc::new(StaticSource::catalog());
        let engine = SyncEngine::new(source.clone(), store.clone(), Arc::new(schema), space, ns())
            .with_config(SyncConfig {
                max_rate_limit_retries: 2,
                default_backoff_ms: 10,
            });
        (source, store, engine)
    }

    async fn seed(engine: &mut SyncEngine<StaticSource, MemoryStore>, source: &StaticSource) {
        source.push_page(SyncPage::done("t0"));
        engine.run(&Cancellation::never()).await.unwrap();
    }

    #[tokio::test]
    async fn test_initial_run_bulk_loads_and_saves_token() {
        let (source, store, mut engine) = setup().await;
        source.push_page(
            SyncPage::next("p1")
                .with_entry(product("p1", "Foo", 10).with_field("tags", EN, json!([entry_link("t1")])))
                .with_entry(tag("t1", "new")),
        );
        source.push_page(
            SyncPage::done("t1")
                .with_entry(product("p2", "Bar", 20))
                .with_asset(Asset::new("a1", EN, "Logo", "https://cdn/logo.png")),
        );

        let report = engine.run(&Cancellation::never()).await.unwrap();
        assert_eq!(report.mode, SyncMode::Initial);
        assert_eq!(report.pages, 2);
        assert_eq!(report.rows_copied, 4);
        assert_eq!(report.token.as_deref(), Some("t1"));
        assert_eq!(engine.state(), SyncState::Committed);

        assert_eq!(store.row_count("content", "product"), 2);
        assert_eq!(store.row_count("content", "con_product_tags"), 1);
        assert_eq!(store.row_count("content", "_assets"), 1);
        assert_eq!(
            store.load_sync_token(&ns()).await.unwrap().as_deref(),
            Some("t1")
        );
        assert_eq!(source.requests(), vec![None, Some("p1".to_string())]);
    }

    #[tokio::test]
    async fn test_bulk_load_drops_tombstoned_records() {
        let (source, store, mut engine) = setup().await;
        source.push_page(SyncPage::next("p1").with_entry(product("p1", "Foo", 10)));
        source.push_page(
            SyncPage::done("t1")
                .with_entry(product("p2", "Bar", 20))
                .with_deletion(Tombstone::entry("p1", "product")),
        );

        let report = engine.bulk_load(&Cancellation::never()).await.unwrap();
        assert_eq!(report.deletions, 1);
        assert_eq!(store.row_count("content", "product"), 1);
        // bulk load leaves the token to the caller
        assert_eq!(store.load_sync_token(&ns()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failed_token_save_allows_retry() {
        let (source, store, mut engine) = setup().await;
        source.push_page(SyncPage::done("t1").with_entry(product("p1", "Foo", 10)));
        store.fail_when(|statement| matches!(statement, Statement::SaveSyncToken { .. }));

        let result = engine.run(&Cancellation::never()).await;
        assert!(matches!(result, Err(CmsError::Database { .. })));
        // rows and token commit together or not at all
        assert_eq!(store.row_count("content", "product"), 0);
        assert_eq!(store.load_sync_token(&ns()).await.unwrap(), None);

        store.clear_failures();
        source.push_page(SyncPage::done("t1").with_entry(product("p1", "Foo", 10)));
        let report = engine.run(&Cancellation::never()).await.unwrap();
        assert_eq!(report.mode, SyncMode::Initial);
        assert_eq!(store.row_count("content", "product"), 1);
        assert_eq!(
            store.load_sync_token(&ns()).await.unwrap().as_deref(),
            Some("t1")
        );
    }

    #[tokio::test]
    async fn test_bulk_load_copies_each_page_as_it_arrives() {
        let (source, store, mut engine) = setup().await;
        for page in 0..5 {
            let mut next = if page == 4 {
                SyncPage::done("t1")
            } else {
                SyncPage::next(&format!("p{}", page))
            };
            for i in 0..10 {
                let id = format!("p{}_{}", page, i);
                next = next.with_entry(product(&id, &id, i));
            }
            source.push_page(next);
        }
        let committed = store.committed_batches();
        let applied = store.applied_batches();

        let report = engine.run(&Cancellation::never()).await.unwrap();
        assert_eq!(report.pages, 5);
        assert_eq!(report.rows_copied, 50);
        // one copy per page plus the token, in one transaction
        assert_eq!(store.applied_batches() - applied, 6);
        assert_eq!(store.committed_batches() - committed, 1);
        assert_eq!(store.row_count("content", "product"), 50);
    }

    #[tokio::test]
    async fn test_bulk_load_replaces_redelivered_records() {
        let (source, store, mut engine) = setup().await;
        source.push_page(SyncPage::next("p1").with_entry(
            product("p1", "Foo", 10).with_field("tags", EN, json!([entry_link("t1")])),
        ));
        source.push_page(SyncPage::done("t1").with_entry(product("p1", "Foo", 12)));

        let report = engine.run(&Cancellation::never()).await.unwrap();
        assert_eq!(report.deletions, 0);
        let rows = store.rows("content", "product");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("price"), Some(&SqlValue::Int(12)));
        assert_eq!(store.row_count("content", "con_product_tags"), 0);
    }

    #[tokio::test]
    async fn test_delta_page_is_idempotent() {
        let (source, store, mut engine) = setup().await;
        seed(&mut engine, &source).await;

        let page = SyncPage::done("t1")
            .with_entry(
                product("p1", "Foo", 10)
                    .with_field("name", DE, json!("Fuh"))
                    .with_field("tags", EN, json!([entry_link("t1"), entry_link("t2")])),
            )
            .with_entry(tag("t1", "a"));

        source.push_page(page.clone());
        let report = engine.run(&Cancellation::never()).await.unwrap();
        assert_eq!(report.mode, SyncMode::Delta);
        let products = store.table_digest("content", "product").unwrap();
        let edges = store.table_digest("content", "con_product_tags").unwrap();

        source.push_page(page);
        engine.run(&Cancellation::never()).await.unwrap();
        assert_eq!(store.table_digest("content", "product").unwrap(), products);
        assert_eq!(store.table_digest("content", "con_product_tags").unwrap(), edges);
        assert_eq!(store.row_count("content", "product"), 2);
        assert_eq!(store.row_count("content", "con_product_tags"), 2);
    }

    #[tokio::test]
    async fn test_delta_replaces_edges_and_stale_locales() {
        let (source, store, mut engine) = setup().await;
        seed(&mut engine, &source).await;

        source.push_page(
            SyncPage::done("t1").with_entry(
                product("p1", "Foo", 10)
                    .with_field("name", DE, json!("Fuh"))
                    .with_field("tags", EN, json!([entry_link("t1"), entry_link("t2")])),
            ),
        );
        engine.run(&Cancellation::never()).await.unwrap();
        assert_eq!(store.row_count("content", "product"), 2);

        source.push_page(SyncPage::done("t2").with_entry(product("p1", "Foo", 11)));
        let report = engine.run(&Cancellation::never()).await.unwrap();
        assert_eq!(report.edges_cleared, 1);
        assert_eq!(store.row_count("content", "product"), 1);
        assert_eq!(store.row_count("content", "con_product_tags"), 0);
    }

    #[tokio::test]
    async fn test_tombstones_cascade_edges() {
        let (source, store, mut engine) = setup().await;
        seed(&mut engine, &source).await;

        source.push_page(SyncPage::done("t1").with_entry(
            product("p1", "Foo", 10).with_field("tags", EN, json!([entry_link("t1")])),
        ));
        engine.run(&Cancellation::never()).await.unwrap();

        source.push_page(
            SyncPage::done("t2")
                .with_deletion(Tombstone {
                    sys_id: "p1".to_string(),
                    kind: TombstoneKind::DeletedEntry,
                    content_type: None,
                }),
        );
        let report = engine.run(&Cancellation::never()).await.unwrap();
        assert_eq!(report.deletions, 1);
        assert_eq!(store.row_count("content", "product"), 0);
        assert_eq!(store.row_count("content", "con_product_tags"), 0);
    }

    #[tokio::test]
    async fn test_unknown_types_are_skipped_and_drift_reported() {
        let (source, store, mut engine) = setup().await;
        seed(&mut engine, &source).await;

        let mut page = SyncPage::done("t1")
            .with_entry(Entry::new("x1", "video"))
            .with_entry(brand("b1", "Acme"));
        page.content_types = vec![ContentType::new("video", Vec::new())];
        source.push_page(page);

        let report = engine.run(&Cancellation::never()).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert!(report.schema_changed);
        assert_eq!(store.row_count("content", "brand"), 1);
    }

    #[tokio::test]
    async fn test_rate_limits_are_retried() {
        let (source, store, mut engine) = setup().await;
        source.push_error(CmsError::RateLimited {
            retry_after: Some(Duration::from_millis(5)),
        });
        source.push_error(CmsError::RateLimited { retry_after: None });
        source.push_page(SyncPage::done("t1").with_entry(product("p1", "Foo", 10)));

        let report = engine.run(&Cancellation::never()).await.unwrap();
        assert_eq!(report.pages, 1);
        assert_eq!(store.row_count("content", "product"), 1);
        assert_eq!(source.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_rate_limit_retries_are_bounded() {
        let (source, store, mut engine) = setup().await;
        for _ in 0..3 {
            source.push_error(CmsError::RateLimited { retry_after: None });
        }
        let result = engine.run(&Cancellation::never()).await;
        assert!(matches!(result, Err(CmsError::RateLimited { .. })));
        assert_eq!(engine.state(), SyncState::Failed);
        assert_eq!(store.load_sync_token(&ns()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_fetch_errors_surface() {
        let (source, _store, mut engine) = setup().await;
        source.push_error(CmsError::fetch("token rejected"));
        let result = engine.run(&Cancellation::never()).await;
        assert!(matches!(result, Err(CmsError::Fetch { .. })));
        assert_eq!(source.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_bulk_load_applies_nothing() {
        let (source, store, mut engine) = setup().await;
        source.push_page(SyncPage::next("p1").with_entry(product("p1", "Foo", 10)));
        source.push_page(SyncPage::done("t1").with_entry(product("p2", "Bar", 20)));

        let (handle, cancel) = Cancellation::new();
        handle.cancel();
        let result = engine.run(&cancel).await;
        assert!(matches!(result, Err(CmsError::Cancelled)));
        assert_eq!(store.row_count("content", "product"), 0);
        assert_eq!(store.load_sync_token(&ns()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let (source, store, engine) = setup().await;
        let mut engine = engine.with_config(SyncConfig {
            max_rate_limit_retries: 5,
            default_backoff_ms: 60_000,
        });
        source.push_error(CmsError::RateLimited { retry_after: None });

        let (handle, cancel) = Cancellation::new();
        let run = tokio::spawn(async move { engine.run(&cancel).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(CmsError::Cancelled)));
        assert_eq!(store.row_count("content", "product"), 0);
    }

    #[tokio::test]
    async fn test_failed_page_keeps_previous_token() {
        let (source, store, mut engine) = setup().await;
        seed(&mut engine, &source).await;

        source.push_page(SyncPage::next("p1").with_entry(product("p1", "Foo", 10)));
        source.push_page(
            SyncPage::done("t2").with_entry(product("p2", "Bar", 20).with_field("price", EN, json!("x"))),
        );
        let result = engine.run(&Cancellation::never()).await;
        assert!(matches!(result, Err(CmsError::Apply { .. })));
        // the first page committed with its own cursor
        assert_eq!(
            store.load_sync_token(&ns()).await.unwrap().as_deref(),
            Some("p1")
        );
        assert_eq!(store.row_count("content", "product"), 1);
    }
}
