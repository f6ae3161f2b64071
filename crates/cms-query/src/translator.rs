//! Query translation: requests to procedure calls.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use cms_core::{
    col, columns, CmsError, ColumnRef, CompareOp, Database, Ident, OrderTerm, Predicate,
    ProcedureCall, QualifiedName, QueryPage, QuerySource, Result, Space, SqlType, SqlValue,
};
use cms_schema::{naming, CompiledSchema, GeneratedTable, Storage};

use crate::request::{Comparator, FilterTerm, OrderSpec, QueryRequest};

/// What a translated call reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryTarget {
    /// The per-type query function.
    #[default]
    Function,
    /// The per-(type, locale) materialized view.
    View,
}

/// Metadata paths and their output columns.
const SYS_PATHS: &[(&str, &str, SqlType)] = &[
    ("sys.id", columns::SYS_ID, SqlType::Text),
    ("sys.locale", columns::LOCALE, SqlType::Text),
    ("sys.version", columns::VERSION, SqlType::Integer),
    ("sys.createdAt", columns::CREATED_AT, SqlType::Date),
    ("sys.updatedAt", columns::UPDATED_AT, SqlType::Date),
];

fn unsupported_path(path: &str) -> CmsError {
    CmsError::query(format!("unsupported filter path {:?}", path))
}

/// Type-sniff a raw value: booleans, integers, decimals, else text.
pub fn sniff(raw: &str) -> SqlValue {
    match raw {
        "true" => return SqlValue::Bool(true),
        "false" => return SqlValue::Bool(false),
        _ => {}
    }
    if let Ok(i) = raw.parse::<i64>() {
        return SqlValue::Int(i);
    }
    match raw.parse::<f64>() {
        Ok(f) if f.is_finite() => SqlValue::Float(f),
        _ => SqlValue::text(raw),
    }
}

/// Reconcile a sniffed value with the column's scalar type.
fn coerce(path: &str, raw: &str, ty: &SqlType) -> Result<SqlValue> {
    let mismatch = |expected: &str| {
        CmsError::query(format!("{} expects {}, got {:?}", path, expected, raw))
    };
    match (ty, sniff(raw)) {
        (SqlType::Text | SqlType::Date, _) => Ok(SqlValue::text(raw)),
        (SqlType::Integer, SqlValue::Int(i)) => Ok(SqlValue::Int(i)),
        (SqlType::Integer, _) => Err(mismatch("an integer")),
        (SqlType::Decimal, value @ (SqlValue::Int(_) | SqlValue::Float(_))) => Ok(value),
        (SqlType::Decimal, _) => Err(mismatch("a number")),
        (SqlType::Boolean, value @ SqlValue::Bool(_)) => Ok(value),
        (SqlType::Boolean, _) => Err(mismatch("true or false")),
        (SqlType::Array(inner), _) => coerce(path, raw, inner),
        (SqlType::Point | SqlType::Jsonb, _) => {
            Err(CmsError::query(format!("{} cannot be filtered", path)))
        }
    }
}

/// Escape LIKE metacharacters and map `*` to `%`; the result matches as a
/// substring.
pub fn match_pattern(raw: &str) -> String {
    let mut pattern = String::with_capacity(raw.len() + 2);
    pattern.push('%');
    for c in raw.chars() {
        match c {
            '%' | '_' | '\\' => {
                pattern.push('\\');
                pattern.push(c);
            }
            '*' => pattern.push('%'),
            other => pattern.push(other),
        }
    }
    pattern.push('%');
    pattern
}

/// Translates requests against one compiled schema and namespace.
pub struct QueryTranslator<'a> {
    schema: &'a CompiledSchema,
    space: &'a Space,
    namespace: &'a Ident,
}

impl<'a> QueryTranslator<'a> {
    pub fn new(schema: &'a CompiledSchema, space: &'a Space, namespace: &'a Ident) -> Self {
        Self {
            schema,
            space,
            namespace,
        }
    }

    pub fn translate(&self, request: &QueryRequest, target: QueryTarget) -> Result<ProcedureCall> {
        request.check_skip()?;
        let table = self
            .schema
            .tables
            .iter()
            .find(|t| t.content_type == request.content_type)
            .ok_or_else(|| CmsError::ContentTypeNotFound {
                id: request.content_type.clone(),
            })?;
        let locale = self.space.resolve_locale(request.locale.as_deref())?.code.clone();

        let filters = request
            .filters
            .iter()
            .map(|term| self.filter(table, term))
            .collect::<Result<Vec<_>>>()?;
        let order = request
            .order
            .iter()
            .map(|spec| self.order_term(table, spec))
            .collect::<Result<Vec<_>>>()?;

        let source = match target {
            QueryTarget::Function => QuerySource::Function(QualifiedName::new(
                self.namespace,
                &naming::function_name(&table.name),
            )),
            QueryTarget::View => QuerySource::View(QualifiedName::new(
                self.namespace,
                &naming::view_name(&table.name, &locale),
            )),
        };

        Ok(ProcedureCall {
            source,
            locale,
            filters,
            order,
            skip: request.skip,
            take: request.take(),
        })
    }

    /// Output column addressed by a path.
    fn column(&self, table: &GeneratedTable, path: &str) -> Result<ColumnRef> {
        if let Some((_, column, ty)) = SYS_PATHS.iter().find(|(p, _, _)| *p == path) {
            return Ok(ColumnRef::new(col(*column), ty.clone()));
        }
        if path.contains('.') {
            return Err(unsupported_path(path));
        }
        let layout = table.field(path).ok_or_else(|| unsupported_path(path))?;
        match &layout.storage {
            Storage::Column(ty) => Ok(ColumnRef::new(layout.column.clone(), ty.clone())),
            Storage::ConTable(_) => Err(unsupported_path(path)),
        }
    }

    fn filter(&self, table: &GeneratedTable, term: &FilterTerm) -> Result<Predicate> {
        let column = self.column(table, &term.path)?;
        let path = term.path.as_str();
        let first = term
            .values
            .first()
            .ok_or_else(|| CmsError::query(format!("{} has no value", path)))?;
        let values = || {
            term.values
                .iter()
                .map(|raw| coerce(path, raw, &column.ty))
                .collect::<Result<Vec<_>>>()
        };

        Ok(match term.comparator {
            Comparator::Eq if column.ty.is_array() => Predicate::AnyOf {
                values: vec![coerce(path, first, &column.ty)?],
                column,
            },
            Comparator::Ne if column.ty.is_array() => Predicate::NoneOf {
                values: vec![coerce(path, first, &column.ty)?],
                column,
            },
            Comparator::Eq => Predicate::Compare {
                value: coerce(path, first, &column.ty)?,
                op: CompareOp::Eq,
                column,
            },
            Comparator::Ne => Predicate::Compare {
                value: coerce(path, first, &column.ty)?,
                op: CompareOp::Ne,
                column,
            },
            Comparator::Exists => match first.as_str() {
                "true" => Predicate::IsNotNull(column),
                "false" => Predicate::IsNull(column),
                other => {
                    return Err(CmsError::query(format!(
                        "{}[exists] expects true or false, got {:?}",
                        path, other
                    )))
                }
            },
            Comparator::Lt | Comparator::Lte | Comparator::Gt | Comparator::Gte => {
                if !column.ty.is_orderable() {
                    return Err(CmsError::query(format!("{} cannot be compared by order", path)));
                }
                let op = match term.comparator {
                    Comparator::Lt => CompareOp::Lt,
                    Comparator::Lte => CompareOp::Lte,
                    Comparator::Gt => CompareOp::Gt,
                    _ => CompareOp::Gte,
                };
                Predicate::Compare {
                    value: coerce(path, first, &column.ty)?,
                    op,
                    column,
                }
            }
            Comparator::Match => {
                let texty = matches!(column.ty, SqlType::Text)
                    || column.ty == SqlType::Text.array_of();
                if !texty {
                    return Err(CmsError::query(format!("{}[match] needs a text field", path)));
                }
                Predicate::Matches {
                    pattern: match_pattern(first),
                    column,
                }
            }
            Comparator::All => {
                if !column.ty.is_array() {
                    return Err(CmsError::query(format!("{}[all] needs an array field", path)));
                }
                Predicate::ContainsAll {
                    values: values()?,
                    column,
                }
            }
            Comparator::In => Predicate::AnyOf {
                values: values()?,
                column,
            },
            Comparator::Nin => Predicate::NoneOf {
                values: values()?,
                column,
            },
        })
    }

    fn order_term(&self, table: &GeneratedTable, spec: &OrderSpec) -> Result<OrderTerm> {
        let column = self.column(table, &spec.path)?;
        if !column.ty.is_orderable() {
            return Err(CmsError::query(format!("cannot order by {}", spec.path)));
        }
        Ok(OrderTerm {
            column: column.name,
            descending: spec.descending,
        })
    }
}

/// Translates and invokes queries against a store.
pub struct QueryService<D: ?Sized> {
    db: Arc<D>,
    schema: Arc<CompiledSchema>,
    space: Space,
    namespace: Ident,
}

impl<D> QueryService<D>
where
    D: Database + ?Sized,
{
    pub fn new(db: Arc<D>, schema: Arc<CompiledSchema>, space: Space, namespace: Ident) -> Self {
        Self {
            db,
            schema,
            space,
            namespace,
        }
    }

    pub fn translator(&self) -> QueryTranslator<'_> {
        QueryTranslator::new(&self.schema, &self.space, &self.namespace)
    }

    /// Query through the content type's function.
    pub async fn query(&self, request: &QueryRequest) -> Result<QueryPage> {
        self.run(request, QueryTarget::Function).await
    }

    /// Query through the content type's materialized view for the locale.
    pub async fn query_view(&self, request: &QueryRequest) -> Result<QueryPage> {
        self.run(request, QueryTarget::View).await
    }

    async fn run(&self, request: &QueryRequest, target: QueryTarget) -> Result<QueryPage> {
        let start = Instant::now();
        let call = self.translator().translate(request, target)?;
        debug!(
            content_type = request.content_type.as_str(),
            locale = call.locale.as_str(),
            filters = call.filters.len(),
            "Translated query"
        );

        let page = self.db.call(&call).await?;

        info!(
            content_type = request.content_type.as_str(),
            count = page.count,
            returned = page.item_list().len(),
            latency_ms = start.elapsed().as_millis() as u64,
            "Query completed"
        );
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cms_core::fixtures::{
        brand, catalog_space, catalog_types, entry_link, product, tag, StaticSource, DE, EN, FR,
    };
    use cms_core::{Batch, Cancellation, SyncPage};
    use cms_schema::{ProcedureGenerator, SchemaCompiler};
    use cms_store::MemoryStore;
    use cms_sync::SyncEngine;
    use serde_json::json;

    fn ns() -> Ident {
        Ident::new("content").unwrap()
    }

    fn compiled() -> CompiledSchema {
        SchemaCompiler::new(&catalog_space())
            .unwrap()
            .compile(&catalog_types())
    }

    async fn service_with(pages: Vec<SyncPage>) -> (QueryService<MemoryStore>, Arc<StaticSource>, SyncEngine<StaticSource, MemoryStore>) {
        let space = catalog_space();
        let schema = Arc::new(compiled());
        let store = Arc::new(MemoryStore::new());
        let mut batch = Batch::from(schema.ddl(&ns(), &space).unwrap());
        batch.extend(ProcedureGenerator::default().statements(&schema, &ns()).unwrap());
        store.execute(batch).await.unwrap();

        let source = Arc::new(StaticSource::catalog());
        let mut engine = SyncEngine::new(source.clone(), store.clone(), schema.clone(), space.clone(), ns());
        for page in pages {
            source.push_page(page);
        }
        engine.run(&Cancellation::never()).await.unwrap();

        (QueryService::new(store, schema, space, ns()), source, engine)
    }

    async fn catalog_service() -> QueryService<MemoryStore> {
        let page = SyncPage::done("t1")
            .with_entry(product("p1", "Foo", 10).with_field("keywords", EN, json!(["red", "big"])))
            .with_entry(product("p2", "Bar", 20).with_field("keywords", EN, json!(["red"])))
            .with_entry(product("p3", "Zoo", 30));
        service_with(vec![page]).await.0
    }

    fn names(page: &QueryPage) -> Vec<String> {
        page.item_list()
            .iter()
            .map(|i| i["fields"]["name"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    async fn query(service: &QueryService<MemoryStore>, pairs: &[(&str, &str)]) -> QueryPage {
        let mut all = vec![("content_type", "product")];
        all.extend_from_slice(pairs);
        service
            .query(&QueryRequest::from_pairs(all).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_comparison_filters() {
        let service = catalog_service().await;

        let gt = query(&service, &[("price[gt]", "15"), ("order", "price")]).await;
        assert_eq!(gt.count, 2);
        assert_eq!(names(&gt), vec!["Bar", "Zoo"]);

        let within = query(&service, &[("price[in]", "10,30"), ("order", "price")]).await;
        assert_eq!(names(&within), vec!["Foo", "Zoo"]);

        let outside = query(&service, &[("price[nin]", "10,30")]).await;
        assert_eq!(names(&outside), vec!["Bar"]);

        let ne = query(&service, &[("price[ne]", "20"), ("order", "price")]).await;
        assert_eq!(names(&ne), vec!["Foo", "Zoo"]);
    }

    #[tokio::test]
    async fn test_match_is_case_insensitive() {
        let service = catalog_service().await;
        let page = query(&service, &[("name[match]", "OO"), ("order", "name")]).await;
        assert_eq!(names(&page), vec!["Foo", "Zoo"]);

        let wildcard = query(&service, &[("name[match]", "f*o")]).await;
        assert_eq!(names(&wildcard), vec!["Foo"]);
    }

    #[tokio::test]
    async fn test_order_and_pagination() {
        let service = catalog_service().await;
        let page = query(
            &service,
            &[("order", "-price"), ("skip", "1"), ("limit", "1")],
        )
        .await;
        assert_eq!(page.count, 3);
        assert_eq!(names(&page), vec!["Bar"]);
        assert_eq!(page.item_list()[0]["fields"]["price"], 20);
    }

    #[tokio::test]
    async fn test_array_and_existence_filters() {
        let service = catalog_service().await;

        let all = query(&service, &[("keywords[all]", "red,big")]).await;
        assert_eq!(names(&all), vec!["Foo"]);

        let contains = query(&service, &[("keywords", "red"), ("order", "price")]).await;
        assert_eq!(names(&contains), vec!["Foo", "Bar"]);

        let missing = query(&service, &[("keywords[exists]", "false")]).await;
        assert_eq!(names(&missing), vec!["Zoo"]);

        let by_id = query(&service, &[("sys.id", "p2")]).await;
        assert_eq!(names(&by_id), vec!["Bar"]);
    }

    #[tokio::test]
    async fn test_locale_fallback() {
        let page = SyncPage::done("t1")
            .with_entry(product("p1", "Foo", 10))
            .with_entry(
                product("p2", "Bar", 20)
                    .with_field("name", DE, json!("Balken")),
            );
        let (service, _, _) = service_with(vec![page]).await;

        for locale in [DE, FR] {
            let page = query(&service, &[("locale", locale), ("order", "price")]).await;
            // fr-FR falls back to de-DE, then the default
            assert_eq!(names(&page), vec!["Foo", "Balken"]);
            assert_eq!(page.item_list()[0]["sys"]["locale"], locale);
        }

        let default = query(&service, &[("locale", "default"), ("order", "price")]).await;
        assert_eq!(names(&default), vec!["Foo", "Bar"]);
    }

    #[tokio::test]
    async fn test_references_resolve_after_target_syncs() {
        let page = SyncPage::done("t1").with_entry(
            product("p1", "Foo", 10)
                .with_field("brand", EN, entry_link("b1"))
                .with_field("tags", EN, json!([entry_link("t1"), entry_link("t2")])),
        );
        let (service, source, mut engine) = service_with(vec![page]).await;

        let before = query(&service, &[]).await;
        let item = &before.item_list()[0];
        assert_eq!(item["fields"]["brand"], serde_json::Value::Null);
        assert_eq!(item["fields"]["tags"], json!([]));
        let brand_filter = query(&service, &[("brand", "b1")]).await;
        assert_eq!(brand_filter.count, 1);

        source.push_page(
            SyncPage::done("t2")
                .with_entry(brand("b1", "Acme"))
                .with_entry(tag("t2", "second")),
        );
        engine.run(&Cancellation::never()).await.unwrap();

        let after = query(&service, &[]).await;
        let item = &after.item_list()[0];
        assert_eq!(item["fields"]["brand"]["fields"]["name"], "Acme");
        assert_eq!(item["fields"]["brand"]["sys"]["contentType"]["sys"]["id"], "brand");
        let tags = item["fields"]["tags"].as_array().unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0]["fields"]["label"], "second");
    }

    #[test]
    fn test_translation_errors() {
        let schema = compiled();
        let space = catalog_space();
        let namespace = ns();
        let translator = QueryTranslator::new(&schema, &space, &namespace);
        let translate = |pairs: Vec<(&str, &str)>| {
            translator.translate(&QueryRequest::from_pairs(pairs).unwrap(), QueryTarget::Function)
        };

        let nested = translate(vec![("content_type", "product"), ("brand.name", "Acme")]);
        assert!(nested.unwrap_err().to_string().contains("unsupported filter path"));
        let unknown = translate(vec![("content_type", "product"), ("color", "red")]);
        assert!(unknown.unwrap_err().to_string().contains("unsupported filter path"));
        let edges = translate(vec![("content_type", "product"), ("tags", "t1")]);
        assert!(edges.is_err());
        let not_int = translate(vec![("content_type", "product"), ("price[gt]", "cheap")]);
        assert!(matches!(not_int, Err(CmsError::QueryTranslation { .. })));
        let scalar_all = translate(vec![("content_type", "product"), ("price[all]", "1,2")]);
        assert!(scalar_all.is_err());
        let no_type = translate(vec![("content_type", "video")]);
        assert!(matches!(no_type, Err(CmsError::ContentTypeNotFound { .. })));
        let bad_locale = translate(vec![("content_type", "product"), ("locale", "xx")]);
        assert!(matches!(bad_locale, Err(CmsError::LocaleNotFound { .. })));
        let far_page = translator.translate(&QueryRequest::new("product").with_page(u64::MAX, 10), QueryTarget::Function);
        assert!(matches!(far_page, Err(CmsError::QueryTranslation { .. })));
    }

    #[test]
    fn test_translate_targets_and_values() {
        let schema = compiled();
        let space = catalog_space();
        let namespace = ns();
        let translator = QueryTranslator::new(&schema, &space, &namespace);
        let request = QueryRequest::new("product")
            .with_locale("en")
            .with_filter("fields.price", Comparator::Gte, &["15"])
            .with_order("sys.createdAt", true);

        let call = translator.translate(&request, QueryTarget::View).unwrap();
        assert_eq!(call.locale, EN);
        assert_eq!(
            call.source,
            QuerySource::View(QualifiedName::new(&namespace, &Ident::new("mv_product__en_us").unwrap()))
        );
        assert_eq!(call.order[0].column.as_str(), "created_at");
        assert_eq!(call.take, 100);
        match &call.filters[0] {
            Predicate::Compare { value, op, .. } => {
                assert_eq!(value, &SqlValue::Int(15));
                assert_eq!(op, &CompareOp::Gte);
            }
            other => panic!("unexpected predicate {:?}", other),
        }
    }

    #[test]
    fn test_sniff_and_pattern() {
        assert_eq!(sniff("true"), SqlValue::Bool(true));
        assert_eq!(sniff("42"), SqlValue::Int(42));
        assert_eq!(sniff("4.5"), SqlValue::Float(4.5));
        assert_eq!(sniff("NaN"), SqlValue::text("NaN"));
        assert_eq!(sniff("abc"), SqlValue::text("abc"));
        assert_eq!(match_pattern("50%_off*"), "%50\\%\\_off%%");
    }
}
