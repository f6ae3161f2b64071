//! Procedure generator: builds per-type join plans and their function DDL.

use std::sync::Arc;

use cms_core::{
    col, FieldAccess, FieldPlan, FunctionDef, Ident, JoinNode, LinkPlan, ProcedurePlan,
    QualifiedName, Result, CmsError, Statement, LOCALES_TABLE,
};
use tracing::debug;

use crate::compiler::{CompiledSchema, GeneratedTable, Storage};
use crate::links::{Classification, TargetRef};
use crate::naming;
use crate::render::PgPlanRenderer;

/// Default number of link levels expanded into nested objects.
pub const DEFAULT_MAX_INCLUDE_DEPTH: u8 = 3;

/// Builds [`ProcedurePlan`]s from a compiled schema.
#[derive(Debug, Clone)]
pub struct ProcedureGenerator {
    max_include_depth: u8,
}

impl Default for ProcedureGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_INCLUDE_DEPTH)
    }
}

impl ProcedureGenerator {
    pub fn new(max_include_depth: u8) -> Self {
        Self { max_include_depth }
    }

    pub fn max_include_depth(&self) -> u8 {
        self.max_include_depth
    }

    /// Plan of one content type under `namespace`.
    pub fn plan(&self, schema: &CompiledSchema, namespace: &Ident, content_type: &str) -> Result<ProcedurePlan> {
        let table = schema
            .tables
            .iter()
            .find(|t| t.content_type == content_type)
            .ok_or_else(|| CmsError::ContentTypeNotFound {
                id: content_type.to_string(),
            })?;

        let root = self.node(schema, namespace, table, 0);
        debug!(
            content_type = content_type,
            nodes = root.node_count(),
            depth = root.max_depth(),
            has_localized = root.has_localized,
            "Built procedure plan"
        );

        Ok(ProcedurePlan {
            content_type: content_type.to_string(),
            function: QualifiedName::new(namespace, &naming::function_name(&table.name)),
            locales_table: QualifiedName::new(namespace, &col(LOCALES_TABLE)),
            max_include_depth: self.max_include_depth,
            root,
        })
    }

    /// Plans of every compiled content type.
    pub fn plans(&self, schema: &CompiledSchema, namespace: &Ident) -> Result<Vec<ProcedurePlan>> {
        schema
            .content_type_ids()
            .map(|id| self.plan(schema, namespace, id))
            .collect()
    }

    /// Render a plan into a function definition.
    pub fn function(&self, plan: ProcedurePlan) -> FunctionDef {
        let body = plan.accept(&mut PgPlanRenderer::new());
        FunctionDef {
            name: plan.function.clone(),
            output: plan.output_columns(),
            body,
            plan: Arc::new(plan),
        }
    }

    /// `CreateFunction` statements for every compiled content type.
    pub fn statements(&self, schema: &CompiledSchema, namespace: &Ident) -> Result<Vec<Statement>> {
        Ok(self
            .plans(schema, namespace)?
            .into_iter()
            .map(|plan| Statement::CreateFunction(self.function(plan)))
            .collect())
    }

    fn node(&self, schema: &CompiledSchema, namespace: &Ident, table: &GeneratedTable, depth: u8) -> JoinNode {
        let mut fields = Vec::with_capacity(table.fields.len());

        for layout in &table.fields {
            let access = match (&layout.storage, &layout.classification) {
                (Storage::Column(ty), Classification::NoReference) => FieldAccess::Value(ty.clone()),
                (Storage::Column(_), Classification::OneToOne { target })
                | (Storage::Column(_), Classification::ManyToMany { target }) => {
                    FieldAccess::Link(self.link(schema, namespace, target, depth))
                }
                (Storage::ConTable(con), Classification::ManyToMany { target })
                | (Storage::ConTable(con), Classification::OneToOne { target }) => FieldAccess::Links {
                    con_table: QualifiedName::new(namespace, con),
                    target: self.link(schema, namespace, target, depth),
                },
                (Storage::ConTable(con), Classification::NoReference) => FieldAccess::Links {
                    con_table: QualifiedName::new(namespace, con),
                    target: LinkPlan::Stub,
                },
            };
            fields.push(FieldPlan {
                field_id: layout.field_id.clone(),
                column: layout.column.clone(),
                localized: layout.localized,
                access,
            });
        }

        let mut node = JoinNode {
            content_type: table.content_type.clone(),
            kind: table.kind,
            table: QualifiedName::new(namespace, &table.name),
            depth,
            has_localized: false,
            fields,
        };
        node.has_localized =
            table.has_localized() || node.children().any(|child| child.has_localized);
        node
    }

    fn link(&self, schema: &CompiledSchema, namespace: &Ident, target: &TargetRef, depth: u8) -> LinkPlan {
        if depth >= self.max_include_depth {
            return LinkPlan::Stub;
        }
        let table = match target {
            TargetRef::ContentType(id) => schema.tables.iter().find(|t| &t.content_type == id),
            TargetRef::Asset => Some(&schema.assets),
            TargetRef::Unresolved { .. } => None,
        };
        match table {
            Some(table) => LinkPlan::Expand(Box::new(self.node(schema, namespace, table, depth + 1))),
            None => LinkPlan::Stub,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cms_core::fixtures::{catalog_space, catalog_types, tag_type};
    use cms_core::{ContentType, Field, FieldType, NodeKind};

    use crate::compiler::SchemaCompiler;

    fn ns() -> Ident {
        Ident::new("content").unwrap()
    }

    fn compile(types: &[ContentType]) -> CompiledSchema {
        SchemaCompiler::new(&catalog_space()).unwrap().compile(types)
    }

    fn field<'a>(node: &'a JoinNode, id: &str) -> &'a FieldPlan {
        node.fields.iter().find(|f| f.field_id == id).unwrap()
    }

    #[test]
    fn test_product_plan_expands_links() {
        let schema = compile(&catalog_types());
        let plan = ProcedureGenerator::default()
            .plan(&schema, &ns(), "product")
            .unwrap();

        assert_eq!(plan.function.to_string(), "content.q_product");
        assert!(plan.root.has_localized);
        assert_eq!(plan.root.node_count(), 4);

        match &field(&plan.root, "brand").access {
            FieldAccess::Link(LinkPlan::Expand(node)) => {
                assert_eq!(node.content_type, "brand");
                assert_eq!(node.depth, 1);
                assert!(node.has_localized);
            }
            other => panic!("unexpected {:?}", other),
        }
        match &field(&plan.root, "tags").access {
            FieldAccess::Links { con_table, target: LinkPlan::Expand(node) } => {
                assert_eq!(con_table.name.as_str(), "con_product_tags");
                assert!(!node.has_localized);
            }
            other => panic!("unexpected {:?}", other),
        }
        match &field(&plan.root, "image").access {
            FieldAccess::Link(LinkPlan::Expand(node)) => assert_eq!(node.kind, NodeKind::Asset),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_depth_limit_degrades_to_stubs() {
        let schema = compile(&catalog_types());
        let plan = ProcedureGenerator::new(0)
            .plan(&schema, &ns(), "product")
            .unwrap();
        assert_eq!(plan.root.node_count(), 1);
        assert_eq!(
            field(&plan.root, "brand").access,
            FieldAccess::Link(LinkPlan::Stub)
        );
    }

    #[test]
    fn test_self_reference_is_bounded() {
        let category = ContentType::new(
            "category",
            vec![
                Field::new("title", FieldType::Symbol),
                Field::entry_link("parent", "category"),
            ],
        );
        let schema = compile(&[category]);
        let plan = ProcedureGenerator::new(3)
            .plan(&schema, &ns(), "category")
            .unwrap();
        assert_eq!(plan.root.max_depth(), 3);
        assert_eq!(plan.root.node_count(), 4);
    }

    #[test]
    fn test_has_localized_propagates_from_children() {
        let holder = ContentType::new(
            "holder",
            vec![
                Field::new("count", FieldType::Integer),
                Field::entry_link("product", "product"),
            ],
        );
        let mut types = catalog_types();
        types.push(holder);
        let schema = compile(&types);
        let generator = ProcedureGenerator::default();

        assert!(generator.plan(&schema, &ns(), "holder").unwrap().root.has_localized);
        assert!(!generator.plan(&schema, &ns(), "tag").unwrap().root.has_localized);

        let flat = compile(&[tag_type()]);
        assert!(!generator.plan(&flat, &ns(), "tag").unwrap().root.has_localized);
    }

    #[test]
    fn test_statements_cover_all_types() {
        let schema = compile(&catalog_types());
        let statements = ProcedureGenerator::default()
            .statements(&schema, &ns())
            .unwrap();
        assert_eq!(statements.len(), 4);
        assert!(statements
            .iter()
            .all(|s| matches!(s, Statement::CreateFunction(_))));
        assert!(matches!(
            ProcedureGenerator::default().plan(&schema, &ns(), "missing"),
            Err(CmsError::ContentTypeNotFound { .. })
        ));
    }
}
