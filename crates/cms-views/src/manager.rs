//! Per-(content type, locale) materialized views.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info};

use cms_core::{
    col, columns, Batch, CmsConfig, CmsError, Database, Ident, QualifiedName, Result, Space,
    Statement, ViewDef, ViewsConfig,
};
use cms_schema::{naming, CompiledSchema, DEFAULT_MAX_INCLUDE_DEPTH};

use crate::pool::{RefreshJob, RefreshPool, RefreshReport};

/// Creates and refreshes the materialized views of one namespace.
pub struct ViewManager<D: ?Sized> {
    db: Arc<D>,
    schema: Arc<CompiledSchema>,
    space: Space,
    namespace: Ident,
    config: ViewsConfig,
    dependency_depth: u8,
}

impl<D> ViewManager<D>
where
    D: Database + ?Sized + 'static,
{
    pub fn new(db: Arc<D>, schema: Arc<CompiledSchema>, space: Space, namespace: Ident) -> Self {
        Self {
            db,
            schema,
            space,
            namespace,
            config: ViewsConfig::default(),
            dependency_depth: DEFAULT_MAX_INCLUDE_DEPTH,
        }
    }

    /// Apply the `views` section and the effective dependency depth.
    pub fn with_config(mut self, config: &CmsConfig) -> Self {
        self.config = config.views.clone();
        self.dependency_depth = config.dependency_depth();
        self
    }

    pub fn dependency_depth(&self) -> u8 {
        self.dependency_depth
    }

    fn view_def(&self, table: &Ident, locale: &str) -> ViewDef {
        ViewDef {
            name: QualifiedName::new(&self.namespace, &naming::view_name(table, locale)),
            function: QualifiedName::new(&self.namespace, &naming::function_name(table)),
            locale: locale.to_string(),
            unique_key: col(columns::SYS_ID),
        }
    }

    /// View definitions for the given content types in every locale.
    fn defs_for<'a>(&'a self, types: impl IntoIterator<Item = &'a str>) -> Vec<(String, ViewDef)> {
        let mut defs = Vec::new();
        for content_type in types {
            let Some(table) = self.schema.tables.iter().find(|t| t.content_type == content_type) else {
                continue;
            };
            for locale in self.space.locale_codes() {
                defs.push((content_type.to_string(), self.view_def(&table.name, locale)));
            }
        }
        defs
    }

    /// Every view of the namespace.
    pub fn view_defs(&self) -> Vec<ViewDef> {
        self.defs_for(self.schema.content_type_ids())
            .into_iter()
            .map(|(_, def)| def)
            .collect()
    }

    /// `CreateMaterializedView` statements for every view.
    pub fn create_statements(&self) -> Vec<Statement> {
        self.view_defs()
            .into_iter()
            .map(Statement::CreateMaterializedView)
            .collect()
    }

    /// Create and populate every view in one transaction.
    pub async fn create_all(&self) -> Result<usize> {
        let statements = self.create_statements();
        let count = statements.len();
        self.db.execute(Batch::from(statements)).await?;
        info!(namespace = self.namespace.as_str(), views = count, "Created materialized views");
        Ok(count)
    }

    /// Refresh every view of the namespace.
    pub async fn refresh_all(&self) -> RefreshReport {
        let jobs = self.jobs(self.schema.content_type_ids());
        self.pool().run(jobs).await
    }

    /// Content types whose views read `content_type`, including itself,
    /// within the dependency depth.
    pub fn affected_types(&self, content_type: &str) -> Result<BTreeSet<String>> {
        // Assets are graph nodes without views of their own.
        if self.schema.table(content_type).is_none() {
            return Err(CmsError::ContentTypeNotFound {
                id: content_type.to_string(),
            });
        }
        Ok(self
            .schema
            .graph
            .dependents_closure(content_type, self.dependency_depth)
            .into_iter()
            .filter(|id| self.schema.content_type_ids().any(|known| known == id.as_str()))
            .collect())
    }

    /// Refresh the views affected by a publish of `content_type`.
    pub async fn publish(&self, content_type: &str) -> Result<RefreshReport> {
        let affected = self.affected_types(content_type)?;
        debug!(
            content_type = content_type,
            affected = ?affected,
            depth = self.dependency_depth,
            "Refreshing views after publish"
        );
        let jobs = self.jobs(affected.iter().map(String::as_str));
        Ok(self.pool().run(jobs).await)
    }

    fn jobs<'a>(&'a self, types: impl IntoIterator<Item = &'a str>) -> Vec<RefreshJob> {
        self.defs_for(types)
            .into_iter()
            .map(|(content_type, def)| RefreshJob {
                content_type,
                locale: def.locale,
                view: def.name,
            })
            .collect()
    }

    fn pool(&self) -> RefreshPool<D> {
        RefreshPool::new(
            Arc::clone(&self.db),
            self.config.workers,
            self.config.concurrent_refresh,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cms_core::fixtures::{catalog_space, catalog_types, EN};
    use cms_core::{ContentType, Field, FieldType};
    use cms_schema::{ProcedureGenerator, SchemaCompiler};
    use cms_store::MemoryStore;
    use std::time::Duration;

    fn ns() -> Ident {
        Ident::new("content").unwrap()
    }

    /// `b` links to `a`; `c` stands alone.
    fn chain_types() -> Vec<ContentType> {
        vec![
            ContentType::new("a", vec![Field::new("title", FieldType::Symbol)]),
            ContentType::new(
                "b",
                vec![
                    Field::new("title", FieldType::Symbol),
                    Field::entry_link("parent", "a"),
                ],
            ),
            ContentType::new("c", vec![Field::new("title", FieldType::Symbol)]),
        ]
    }

    async fn manager_for(types: Vec<ContentType>, store: Arc<MemoryStore>) -> ViewManager<MemoryStore> {
        let space = catalog_space();
        let schema = SchemaCompiler::new(&space).unwrap().compile(&types);
        let mut batch = Batch::from(schema.ddl(&ns(), &space).unwrap());
        batch.extend(ProcedureGenerator::default().statements(&schema, &ns()).unwrap());
        store.execute(batch).await.unwrap();
        ViewManager::new(store, Arc::new(schema), space, ns())
    }

    #[tokio::test]
    async fn test_create_all_builds_view_per_type_and_locale() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager_for(catalog_types(), store.clone()).await;

        let created = manager.create_all().await.unwrap();
        assert_eq!(created, 4 * 3);
        let views = store.views("content");
        assert_eq!(views.len(), 12);
        assert!(views.contains(&"mv_product__en_us".to_string()));
        assert!(views.contains(&"mv_article__fr_fr".to_string()));

        let defs = manager.view_defs();
        assert!(defs.iter().all(|d| d.unique_key.as_str() == "sys_id"));
        let product = defs.iter().find(|d| d.name.name.as_str() == "mv_product__en_us").unwrap();
        assert_eq!(product.function.name.as_str(), "q_product");
        assert_eq!(product.locale, EN);
    }

    #[tokio::test]
    async fn test_publish_refreshes_dependents_only() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager_for(chain_types(), store.clone()).await;
        manager.create_all().await.unwrap();

        let stamp = |view: &str| store.view_refreshed("content", view).unwrap();
        let before_a = stamp("mv_a__en_us");
        let before_b = stamp("mv_b__de_de");
        let before_c = stamp("mv_c__en_us");

        let report = manager.publish("a").await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.refreshed.len(), 2 * 3);
        let mut types: Vec<_> = report.refreshed.iter().map(|j| j.content_type.as_str()).collect();
        types.sort();
        types.dedup();
        assert_eq!(types, vec!["a", "b"]);

        assert!(stamp("mv_a__en_us") > before_a);
        assert!(stamp("mv_b__de_de") > before_b);
        assert_eq!(stamp("mv_c__en_us"), before_c);

        let standalone = manager.publish("c").await.unwrap();
        assert_eq!(standalone.refreshed.len(), 3);
    }

    #[tokio::test]
    async fn test_affected_types() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager_for(chain_types(), store).await;

        let affected = manager.affected_types("a").unwrap();
        assert_eq!(affected.into_iter().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(manager.affected_types("b").unwrap().len(), 1);
        assert!(matches!(
            manager.affected_types("missing"),
            Err(CmsError::ContentTypeNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_refresh_all_is_bounded() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager_for(catalog_types(), store.clone()).await;
        manager.create_all().await.unwrap();

        let mut config = CmsConfig::default();
        config.views.workers = 3;
        let manager = manager.with_config(&config);

        store.set_latency(Some(Duration::from_millis(10)));
        let report = manager.refresh_all().await;
        assert!(report.is_success());
        assert_eq!(report.refreshed.len(), 12);
        assert!(store.max_in_flight() <= 3);
        assert!(store.max_in_flight() >= 2);
    }

    #[tokio::test]
    async fn test_refresh_failures_are_reported() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager_for(chain_types(), store.clone()).await;
        manager.create_all().await.unwrap();

        store.fail_when(|statement| match statement {
            Statement::RefreshMaterializedView { name, .. } => name.name.as_str().starts_with("mv_b"),
            _ => false,
        });
        let report = manager.refresh_all().await;
        assert_eq!(report.len(), 9);
        assert_eq!(report.failed.len(), 3);
        assert!(report.failed.iter().all(|f| f.job.content_type == "b"));
        assert!(!report.is_success());
    }
}
