//! PostgreSQL rendering of procedure plans.
//!
//! The rendered body is one SELECT over the root table at the default
//! locale. A `lc` row carries the requested, fallback and default locale
//! codes; localized values resolve as `COALESCE(requested, fallback,
//! default)` through two self joins, emitted only for nodes with
//! `has_localized`. Linked objects are correlated scalar subqueries, arrays
//! aggregate their ConTable rows by `position`.

use cms_core::{
    columns, quote_literal, FieldAccess, FieldPlan, JoinNode, LinkPlan, NodeKind, PlanVisitor,
    ProcedurePlan, QualifiedName, SqlType,
};

/// `jsonb_build_object` accepts at most 100 arguments.
const PAIRS_PER_OBJECT: usize = 40;

/// Renders a plan into a SQL function body.
#[derive(Debug, Default)]
pub struct PgPlanRenderer {
    next_alias: usize,
}

impl PgPlanRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    fn alias(&mut self, prefix: &str) -> String {
        let alias = format!("{}{}", prefix, self.next_alias);
        self.next_alias += 1;
        alias
    }

    /// `FROM`-less join clause adding the requested/fallback self joins.
    fn locale_joins(&self, node: &JoinNode, alias: &str) -> String {
        if !node.has_localized {
            return String::new();
        }
        let table = node.table.quoted();
        format!(
            " LEFT JOIN {table} {a}_r ON {a}_r.\"sys_id\" = {a}.\"sys_id\" AND {a}_r.\"locale\" = lc.req \
             LEFT JOIN {table} {a}_f ON {a}_f.\"sys_id\" = {a}.\"sys_id\" AND {a}_f.\"locale\" = lc.fb",
            table = table,
            a = alias
        )
    }

    /// Locale-resolved column expression.
    fn column_expr(&self, node: &JoinNode, alias: &str, field: &FieldPlan) -> String {
        let column = field.column.quoted();
        if node.has_localized && field.localized {
            format!(
                "COALESCE({a}_r.{c}, {a}_f.{c}, {a}.{c})",
                a = alias,
                c = column
            )
        } else {
            format!("{}.{}", alias, column)
        }
    }

    /// JSON form of a plain value column.
    fn value_json(&self, expr: &str, ty: &SqlType) -> String {
        match ty {
            SqlType::Point => format!(
                "CASE WHEN {e} IS NULL THEN NULL ELSE jsonb_build_object('lat', ({e})[1], 'lon', ({e})[0]) END",
                e = expr
            ),
            SqlType::Jsonb => expr.to_string(),
            _ => format!("to_jsonb({})", expr),
        }
    }

    fn stub_json(id_expr: &str) -> String {
        format!(
            "jsonb_build_object('sys', jsonb_build_object('id', {}))",
            id_expr
        )
    }

    /// Nested JSON document of a node.
    fn node_json(&mut self, node: &JoinNode, alias: &str) -> String {
        let mut sys = vec![
            ("id".to_string(), format!("{}.\"sys_id\"", alias)),
            (
                "type".to_string(),
                quote_literal(match node.kind {
                    NodeKind::Entry => "Entry",
                    NodeKind::Asset => "Asset",
                }),
            ),
        ];
        if node.kind == NodeKind::Entry {
            sys.push((
                "contentType".to_string(),
                format!(
                    "jsonb_build_object('sys', jsonb_build_object('id', {}))",
                    quote_literal(&node.content_type)
                ),
            ));
        }
        sys.push(("createdAt".to_string(), format!("{}.\"created_at\"", alias)));
        sys.push(("updatedAt".to_string(), format!("{}.\"updated_at\"", alias)));
        sys.push(("version".to_string(), format!("{}.\"version\"", alias)));
        sys.push(("locale".to_string(), "lc.req".to_string()));

        let mut fields = Vec::with_capacity(node.fields.len());
        for field in &node.fields {
            let value = match &field.access {
                FieldAccess::Value(ty) => self.value_json(&self.column_expr(node, alias, field), ty),
                FieldAccess::Link(link) => {
                    let id_expr = self.column_expr(node, alias, field);
                    self.link_json(link, &id_expr)
                }
                FieldAccess::Links { con_table, target } => {
                    self.links_json(alias, field, con_table, target)
                }
            };
            fields.push((field.field_id.clone(), value));
        }

        format!(
            "jsonb_build_object('sys', {}, 'fields', {})",
            build_object(&sys),
            build_object(&fields)
        )
    }

    fn link_json(&mut self, link: &LinkPlan, id_expr: &str) -> String {
        match link {
            LinkPlan::Stub => format!(
                "CASE WHEN {id} IS NULL THEN NULL ELSE {stub} END",
                id = id_expr,
                stub = Self::stub_json(id_expr)
            ),
            LinkPlan::Expand(child) => {
                let alias = self.alias("t");
                let json = self.node_json(child, &alias);
                format!(
                    "(SELECT {json} FROM {table} {a}{joins} WHERE {a}.\"sys_id\" = {id} AND {a}.\"locale\" = lc.def)",
                    json = json,
                    table = child.table.quoted(),
                    a = alias,
                    joins = self.locale_joins(child, &alias),
                    id = id_expr
                )
            }
        }
    }

    fn links_json(
        &mut self,
        owner_alias: &str,
        field: &FieldPlan,
        con_table: &QualifiedName,
        target: &LinkPlan,
    ) -> String {
        let con = self.alias("c");
        let table = con_table.quoted();
        let locale = if field.localized {
            let nearest = self.alias("c");
            format!(
                "(SELECT {p}.\"locale\" FROM {table} {p} WHERE {p}.\"owner_sys_id\" = {o}.\"sys_id\" \
                 AND {p}.\"locale\" IN (lc.req, lc.fb, lc.def) \
                 ORDER BY array_position(ARRAY[lc.req, lc.fb, lc.def], {p}.\"locale\") LIMIT 1)",
                p = nearest,
                table = table,
                o = owner_alias
            )
        } else {
            "lc.def".to_string()
        };

        match target {
            LinkPlan::Stub => format!(
                "(SELECT COALESCE(jsonb_agg({stub} ORDER BY {c}.\"position\"), '[]'::jsonb) FROM {table} {c} \
                 WHERE {c}.\"owner_sys_id\" = {o}.\"sys_id\" AND {c}.\"locale\" = {locale})",
                stub = Self::stub_json(&format!("{}.\"target_sys_id\"", con)),
                c = con,
                table = table,
                o = owner_alias,
                locale = locale
            ),
            LinkPlan::Expand(child) => {
                let alias = self.alias("t");
                let json = self.node_json(child, &alias);
                format!(
                    "(SELECT COALESCE(jsonb_agg({json} ORDER BY {c}.\"position\"), '[]'::jsonb) FROM {table} {c} \
                     JOIN {target} {a} ON {a}.\"sys_id\" = {c}.\"target_sys_id\" AND {a}.\"locale\" = lc.def{joins} \
                     WHERE {c}.\"owner_sys_id\" = {o}.\"sys_id\" AND {c}.\"locale\" = {locale})",
                    json = json,
                    c = con,
                    table = table,
                    target = child.table.quoted(),
                    a = alias,
                    joins = self.locale_joins(child, &alias),
                    o = owner_alias,
                    locale = locale
                )
            }
        }
    }
}

/// `jsonb_build_object` over key/value pairs, split into `||`-joined chunks.
fn build_object(pairs: &[(String, String)]) -> String {
    if pairs.is_empty() {
        return "'{}'::jsonb".to_string();
    }
    pairs
        .chunks(PAIRS_PER_OBJECT)
        .map(|chunk| {
            let args = chunk
                .iter()
                .map(|(k, v)| format!("{}, {}", quote_literal(k), v))
                .collect::<Vec<_>>()
                .join(", ");
            format!("jsonb_build_object({})", args)
        })
        .collect::<Vec<_>>()
        .join(" || ")
}

impl PlanVisitor for PgPlanRenderer {
    type Output = String;

    fn visit_plan(&mut self, plan: &ProcedurePlan) -> String {
        let root = &plan.root;
        let alias = self.alias("t");

        let mut select = vec![
            format!("{}.\"{}\"", alias, columns::SYS_ID),
            "lc.req".to_string(),
            format!("{}.\"{}\"", alias, columns::VERSION),
            format!("{}.\"{}\"", alias, columns::CREATED_AT),
            format!("{}.\"{}\"", alias, columns::UPDATED_AT),
        ];
        for field in &root.fields {
            match field.access {
                FieldAccess::Value(_) | FieldAccess::Link(_) => {
                    select.push(self.column_expr(root, &alias, field));
                }
                FieldAccess::Links { .. } => {}
            }
        }
        select.push(self.node_json(root, &alias));

        format!(
            "WITH lc AS (SELECT l.\"code\" AS req, COALESCE(l.\"fallback_code\", d.\"code\") AS fb, d.\"code\" AS def \
             FROM {locales} l CROSS JOIN {locales} d WHERE d.\"is_default\" AND l.\"code\" = _locale) \
             SELECT {select} FROM {table} {a} CROSS JOIN lc{joins} WHERE {a}.\"locale\" = lc.def",
            locales = plan.locales_table.quoted(),
            select = select.join(", "),
            table = root.table.quoted(),
            a = alias,
            joins = self.locale_joins(root, &alias)
        )
    }
}
