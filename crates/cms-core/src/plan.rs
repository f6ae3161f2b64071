//! Join-plan AST for generated query procedures.
//!
//! A plan is built once per content type by the procedure generator and then
//! consumed by a [`PlanVisitor`]: the Postgres renderer turns it into a SQL
//! function body, the memory store evaluates it directly.

use crate::sql::{col, columns, ColumnDef, Ident, QualifiedName, SqlType};

/// Kind of record a join node reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Entry,
    Asset,
}

/// One table level of the plan.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinNode {
    /// Content type id (`_assets` for the asset table).
    pub content_type: String,
    pub kind: NodeKind,
    pub table: QualifiedName,
    /// Root is depth 0.
    pub depth: u8,
    /// Own fields localized, or any expanded child has localized fields.
    pub has_localized: bool,
    pub fields: Vec<FieldPlan>,
}

/// How one field is read.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldPlan {
    /// Field id used as the JSON key.
    pub field_id: String,
    /// Column in the node's table (unused for `Links`).
    pub column: Ident,
    pub localized: bool,
    pub access: FieldAccess,
}

/// Column access of a field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldAccess {
    /// Plain value column.
    Value(SqlType),
    /// Single link stored as the target `sys_id`.
    Link(LinkPlan),
    /// Array of links through a ConTable.
    Links {
        con_table: QualifiedName,
        target: LinkPlan,
    },
}

/// Resolution of a link target.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkPlan {
    /// Join the target table and embed the resolved object.
    Expand(Box<JoinNode>),
    /// Emit `{"sys": {"id": ...}}` only.
    Stub,
}

impl JoinNode {
    /// Expanded child nodes, in field order.
    pub fn children(&self) -> impl Iterator<Item = &JoinNode> {
        self.fields.iter().filter_map(|f| match &f.access {
            FieldAccess::Link(LinkPlan::Expand(node))
            | FieldAccess::Links {
                target: LinkPlan::Expand(node),
                ..
            } => Some(node.as_ref()),
            _ => None,
        })
    }

    /// Deepest expanded level below and including this node.
    pub fn max_depth(&self) -> u8 {
        self.children()
            .map(JoinNode::max_depth)
            .max()
            .unwrap_or(self.depth)
    }

    /// Number of join nodes in the subtree.
    pub fn node_count(&self) -> usize {
        1 + self.children().map(JoinNode::node_count).sum::<usize>()
    }
}

/// The full plan for one content type.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcedurePlan {
    pub content_type: String,
    pub function: QualifiedName,
    /// Locale table consulted for fallback resolution.
    pub locales_table: QualifiedName,
    pub max_include_depth: u8,
    pub root: JoinNode,
}

impl ProcedurePlan {
    /// Output columns of the generated function, in order.
    pub fn output_columns(&self) -> Vec<ColumnDef> {
        let mut out = vec![
            ColumnDef::new(col(columns::SYS_ID), SqlType::Text),
            ColumnDef::new(col(columns::LOCALE), SqlType::Text),
            ColumnDef::new(col(columns::VERSION), SqlType::Integer),
            ColumnDef::new(col(columns::CREATED_AT), SqlType::Date),
            ColumnDef::new(col(columns::UPDATED_AT), SqlType::Date),
        ];
        for field in &self.root.fields {
            match &field.access {
                FieldAccess::Value(ty) => out.push(ColumnDef::new(field.column.clone(), ty.clone())),
                FieldAccess::Link(_) => out.push(ColumnDef::new(field.column.clone(), SqlType::Text)),
                FieldAccess::Links { .. } => {}
            }
        }
        out.push(ColumnDef::new(col(columns::DATA), SqlType::Jsonb));
        out
    }

    /// Type of an output column, if the function returns it.
    pub fn output_type(&self, column: &str) -> Option<SqlType> {
        self.output_columns()
            .into_iter()
            .find(|c| c.name.as_str() == column)
            .map(|c| c.ty)
    }

    /// Dispatch to a visitor.
    pub fn accept<V: PlanVisitor>(&self, visitor: &mut V) -> V::Output {
        visitor.visit_plan(self)
    }
}

/// Consumer of a procedure plan.
pub trait PlanVisitor {
    type Output;

    fn visit_plan(&mut self, plan: &ProcedurePlan) -> Self::Output;
}
