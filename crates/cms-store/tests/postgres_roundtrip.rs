//! Migrate, query, replay and publish against a live PostgreSQL.
//!
//! Runs only when `CMS_TEST_DATABASE_URL` names a database the test may
//! create schemas in.

use std::sync::Arc;

use serde_json::json;

use cms_core::fixtures::{catalog_space, catalog_types, product, StaticSource, DE, EN, FR};
use cms_core::{
    Batch, Cancellation, Database, DatabaseConfig, Ident, QueryPage, Statement, SyncPage,
};
use cms_migrate::Migrator;
use cms_query::{QueryRequest, QueryService};
use cms_schema::SchemaCompiler;
use cms_store::PgStore;
use cms_sync::{SyncEngine, SyncMode};
use cms_views::ViewManager;

const DATABASE_URL_VAR: &str = "CMS_TEST_DATABASE_URL";

async fn connect() -> Option<Arc<PgStore>> {
    let url = match std::env::var(DATABASE_URL_VAR) {
        Ok(url) if !url.is_empty() => url,
        _ => {
            eprintln!("{} not set, skipping", DATABASE_URL_VAR);
            return None;
        }
    };
    let config = DatabaseConfig {
        url,
        ..DatabaseConfig::default()
    };
    Some(Arc::new(PgStore::connect(&config).await.unwrap()))
}

fn names(page: &QueryPage) -> Vec<String> {
    page.item_list()
        .iter()
        .map(|i| i["fields"]["name"].as_str().unwrap_or_default().to_string())
        .collect()
}

async fn query(service: &QueryService<PgStore>, pairs: &[(&str, &str)]) -> QueryPage {
    let mut all = vec![("content_type", "product")];
    all.extend_from_slice(pairs);
    service
        .query(&QueryRequest::from_pairs(all).unwrap())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_postgres_round_trip() {
    let Some(store) = connect().await else {
        return;
    };
    let live = Ident::new(&format!("cms_it_{}", std::process::id())).unwrap();
    let space = catalog_space();
    let source = Arc::new(StaticSource::catalog());
    source.push_page(
        SyncPage::next("p1")
            .with_entry(product("p1", "Foo", 10).with_field("keywords", EN, json!(["red", "big"])))
            .with_entry(product("p2", "Bar", 20).with_field("name", DE, json!("Balken"))),
    );
    source.push_page(SyncPage::done("t1").with_entry(product("p3", "Zoo", 30)));

    let migrator = Migrator::new(source.clone(), store.clone(), live.clone());
    let report = migrator
        .prepare(&Cancellation::never())
        .await
        .unwrap()
        .swap()
        .await
        .unwrap();
    assert_eq!(report.sync.pages, 2);
    assert_eq!(report.views, 12);
    assert_eq!(
        store.load_sync_token(&live).await.unwrap().as_deref(),
        Some("t1")
    );

    let schema = Arc::new(
        SchemaCompiler::new(&space)
            .unwrap()
            .compile(&catalog_types()),
    );
    let service = QueryService::new(store.clone(), schema.clone(), space.clone(), live.clone());

    let gt = query(&service, &[("price[gt]", "15"), ("order", "price")]).await;
    assert_eq!(gt.count, 2);
    assert_eq!(names(&gt), vec!["Bar", "Zoo"]);

    let within = query(&service, &[("price[in]", "10,30"), ("order", "price")]).await;
    assert_eq!(names(&within), vec!["Foo", "Zoo"]);

    let matched = query(&service, &[("name[match]", "OO"), ("order", "name")]).await;
    assert_eq!(names(&matched), vec!["Foo", "Zoo"]);

    let paged = query(&service, &[("order", "-price"), ("skip", "1"), ("limit", "1")]).await;
    assert_eq!(paged.count, 3);
    assert_eq!(names(&paged), vec!["Bar"]);

    // fr-FR falls back to de-DE, then the default
    let french = query(&service, &[("locale", FR), ("order", "price")]).await;
    assert_eq!(names(&french), vec!["Foo", "Balken", "Zoo"]);
    assert_eq!(french.item_list()[0]["sys"]["locale"], FR);

    let mut engine = SyncEngine::new(
        source.clone(),
        store.clone(),
        schema.clone(),
        space.clone(),
        live.clone(),
    );
    let delta = SyncPage::done("t2").with_entry(product("p1", "Foo", 15));
    for _ in 0..2 {
        source.push_page(delta.clone());
        let report = engine.run(&Cancellation::never()).await.unwrap();
        assert_eq!(report.mode, SyncMode::Delta);
    }
    let replayed = query(&service, &[("price[gt]", "12"), ("order", "price")]).await;
    assert_eq!(replayed.count, 3);
    assert_eq!(names(&replayed), vec!["Foo", "Bar", "Zoo"]);
    assert_eq!(replayed.item_list()[0]["fields"]["price"], 15);
    assert_eq!(
        store.load_sync_token(&live).await.unwrap().as_deref(),
        Some("t2")
    );

    let by_id = QueryRequest::from_pairs([("content_type", "product"), ("sys.id", "p1")]).unwrap();
    let stale = service.query_view(&by_id).await.unwrap();
    assert_eq!(stale.item_list()[0]["fields"]["price"], 10);

    let views = ViewManager::new(store.clone(), schema.clone(), space.clone(), live.clone());
    let refreshed = views.publish("product").await.unwrap();
    assert!(refreshed.is_success());
    let fresh = service.query_view(&by_id).await.unwrap();
    assert_eq!(fresh.item_list()[0]["fields"]["price"], 15);

    store
        .execute(Batch::from(Statement::DropSchema(live)))
        .await
        .unwrap();
    store.close().await;
}
