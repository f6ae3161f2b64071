//! Shadow-namespace migrations.
//!
//! A migration rebuilds the whole tenant into `<live><shadow_suffix>`:
//! compile, bulk load, token, procedures and views. Nothing touches the live
//! namespace until [`PreparedMigration::swap`] promotes the shadow in one
//! transaction.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};

use cms_core::{
    Batch, Cancellation, CmsConfig, CmsError, ContentSource, Database, Ident, Result, Space,
    Statement,
};
use cms_schema::{CompiledSchema, ProcedureGenerator, SchemaCompiler};
use cms_sync::{SyncEngine, SyncReport};
use cms_views::ViewManager;

/// Migration stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStage {
    DropShadow,
    CompileSchema,
    BulkSync,
    SaveToken,
    BuildProcedures,
    RefreshViews,
    SwapNamespaces,
}

impl MigrationStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DropShadow => "drop_shadow",
            Self::CompileSchema => "compile_schema",
            Self::BulkSync => "bulk_sync",
            Self::SaveToken => "save_token",
            Self::BuildProcedures => "build_procedures",
            Self::RefreshViews => "refresh_views",
            Self::SwapNamespaces => "swap_namespaces",
        }
    }
}

impl fmt::Display for MigrationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a prepared migration built.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub shadow: String,
    pub content_types: usize,
    /// Content types left out of the schema, with the reason.
    pub skipped_types: Vec<(String, String)>,
    pub sync: SyncReport,
    pub functions: usize,
    pub views: usize,
    pub elapsed_ms: u64,
}

/// Builds shadow namespaces from a content source.
pub struct Migrator<S: ?Sized, D: ?Sized> {
    source: Arc<S>,
    db: Arc<D>,
    live: Ident,
    config: CmsConfig,
}

impl<S, D> Migrator<S, D>
where
    S: ContentSource + ?Sized,
    D: Database + ?Sized + 'static,
{
    pub fn new(source: Arc<S>, db: Arc<D>, live: Ident) -> Self {
        Self {
            source,
            db,
            live,
            config: CmsConfig::default(),
        }
    }

    pub fn with_config(mut self, config: CmsConfig) -> Self {
        self.config = config;
        self
    }

    pub fn live(&self) -> &Ident {
        &self.live
    }

    pub fn shadow(&self) -> Ident {
        self.live.with_suffix(&self.config.migration.shadow_suffix)
    }

    pub fn retired(&self) -> Ident {
        self.live.with_suffix(&self.config.migration.retired_suffix)
    }

    /// Run every stage up to, not including, the swap.
    ///
    /// On failure the shadow is dropped on a best-effort basis and the error
    /// names the failed stage.
    pub async fn prepare(&self, cancel: &Cancellation) -> Result<PreparedMigration<D>> {
        let start = Instant::now();
        let shadow = self.shadow();
        info!(live = self.live.as_str(), shadow = shadow.as_str(), "Preparing migration");

        match self.build(&shadow, cancel).await {
            Ok(mut report) => {
                report.elapsed_ms = start.elapsed().as_millis() as u64;
                info!(
                    shadow = shadow.as_str(),
                    content_types = report.content_types,
                    functions = report.functions,
                    views = report.views,
                    elapsed_ms = report.elapsed_ms,
                    "Migration prepared"
                );
                Ok(PreparedMigration {
                    db: Arc::clone(&self.db),
                    live: self.live.clone(),
                    shadow,
                    retired: self.retired(),
                    report,
                })
            }
            Err(e) => {
                warn!(shadow = shadow.as_str(), error = %e, "Migration failed, dropping shadow");
                if let Err(cleanup) = self.db.execute(Batch::from(Statement::DropSchema(shadow))).await {
                    warn!(error = %cleanup, "Could not drop shadow namespace");
                }
                Err(e)
            }
        }
    }

    async fn build(&self, shadow: &Ident, cancel: &Cancellation) -> Result<MigrationReport> {
        let stage = MigrationStage::DropShadow;
        self.db
            .execute(Batch::from(Statement::DropSchema(shadow.clone())))
            .await
            .map_err(|e| CmsError::migration(stage, e))?;

        let stage = MigrationStage::CompileSchema;
        let (space, schema) = self
            .compile(shadow, cancel)
            .await
            .map_err(|e| CmsError::migration(stage, e))?;
        let schema = Arc::new(schema);

        let stage = MigrationStage::BulkSync;
        let sync = async {
            cancel.check()?;
            let mut engine = SyncEngine::new(
                Arc::clone(&self.source),
                Arc::clone(&self.db),
                Arc::clone(&schema),
                space.clone(),
                shadow.clone(),
            )
            .with_config(self.config.sync.clone());
            engine.bulk_load(cancel).await
        }
        .await
        .map_err(|e| CmsError::migration(stage, e))?;

        let stage = MigrationStage::SaveToken;
        let token = sync
            .token
            .clone()
            .ok_or_else(|| CmsError::migration(stage, CmsError::fetch("initial sync returned no token")))?;
        self.db
            .execute(Batch::from(Statement::SaveSyncToken {
                schema: shadow.clone(),
                token,
            }))
            .await
            .map_err(|e| CmsError::migration(stage, e))?;

        let stage = MigrationStage::BuildProcedures;
        let functions = async {
            cancel.check()?;
            let statements = ProcedureGenerator::new(self.config.schema.max_include_depth)
                .statements(&schema, shadow)?;
            let count = statements.len();
            self.db.execute(Batch::from(statements)).await?;
            Ok::<_, CmsError>(count)
        }
        .await
        .map_err(|e| CmsError::migration(stage, e))?;

        let stage = MigrationStage::RefreshViews;
        let views = async {
            cancel.check()?;
            ViewManager::new(Arc::clone(&self.db), Arc::clone(&schema), space.clone(), shadow.clone())
                .with_config(&self.config)
                .create_all()
                .await
        }
        .await
        .map_err(|e| CmsError::migration(stage, e))?;

        Ok(MigrationReport {
            shadow: shadow.to_string(),
            content_types: schema.tables.len(),
            skipped_types: schema
                .errors
                .iter()
                .map(|f| (f.content_type.clone(), f.message.clone()))
                .collect(),
            sync,
            functions,
            views,
            elapsed_ms: 0,
        })
    }

    async fn compile(&self, shadow: &Ident, cancel: &Cancellation) -> Result<(Space, CompiledSchema)> {
        cancel.check()?;
        let space = self.source.space().await?;
        let types = self.source.content_types().await?;
        let schema = SchemaCompiler::new(&space)?.compile(&types);
        for failure in &schema.errors {
            warn!(
                content_type = failure.content_type.as_str(),
                reason = failure.message.as_str(),
                "Content type left out of migration"
            );
        }
        self.db.execute(Batch::from(schema.ddl(shadow, &space)?)).await?;
        Ok((space, schema))
    }
}

/// A fully built shadow namespace awaiting promotion.
pub struct PreparedMigration<D: ?Sized> {
    db: Arc<D>,
    live: Ident,
    shadow: Ident,
    retired: Ident,
    report: MigrationReport,
}

impl<D> PreparedMigration<D>
where
    D: Database + ?Sized,
{
    pub fn report(&self) -> &MigrationReport {
        &self.report
    }

    pub fn shadow(&self) -> &Ident {
        &self.shadow
    }

    /// Promote the shadow to live in one transaction; the previous live
    /// namespace is dropped.
    pub async fn swap(self) -> Result<MigrationReport> {
        let statement = Statement::SwapSchemas {
            live: self.live.clone(),
            shadow: self.shadow.clone(),
            retired: self.retired.clone(),
        };
        self.db
            .execute(Batch::from(statement))
            .await
            .map_err(|e| CmsError::migration(MigrationStage::SwapNamespaces, e))?;
        info!(live = self.live.as_str(), "Migration swapped in");
        Ok(self.report)
    }

    /// Drop the shadow and leave live untouched.
    pub async fn abandon(self) -> Result<()> {
        self.db
            .execute(Batch::from(Statement::DropSchema(self.shadow.clone())))
            .await?;
        info!(shadow = self.shadow.as_str(), "Migration abandoned");
        Ok(())
    }
}
