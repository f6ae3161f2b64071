//! Link resolution: reference classification and the dependency graph.
//!
//! Links are matched purely by `sys_id` at sync time, so a link to a record
//! that has not been synced yet is never an error. At compile time a link
//! only needs a target table to join against; links without one are kept as
//! stubs and logged.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use cms_core::{ArrayItems, FieldShape, Ident, LinkTarget};
use tracing::warn;

use crate::naming::ASSETS_TABLE;

/// What a link field points at once resolved against the compiled set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetRef {
    /// Entries of one compiled content type.
    ContentType(String),
    /// The asset table.
    Asset,
    /// No single compiled target; rendered as stubs.
    Unresolved { reason: String },
}

impl TargetRef {
    /// Dependency graph node of the target, if any.
    pub fn node(&self) -> Option<&str> {
        match self {
            Self::ContentType(id) => Some(id),
            Self::Asset => Some(ASSETS_TABLE),
            Self::Unresolved { .. } => None,
        }
    }
}

/// Compile-time classification of a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    NoReference,
    /// Single link: a text column plus an owner → target dependency.
    OneToOne { target: TargetRef },
    /// Array of links: a ConTable plus two dependency edges.
    ManyToMany { target: TargetRef },
}

/// Classify a field shape against the set of compiled content type ids.
pub fn classify(owner: &str, field_id: &str, shape: &FieldShape, known: &HashSet<String>) -> Classification {
    match shape {
        FieldShape::Scalar(_) | FieldShape::Array(ArrayItems::Scalar(_)) => Classification::NoReference,
        FieldShape::Link(target) => Classification::OneToOne {
            target: resolve_target(owner, field_id, target, known),
        },
        FieldShape::Array(ArrayItems::Link(target)) => Classification::ManyToMany {
            target: resolve_target(owner, field_id, target, known),
        },
    }
}

fn resolve_target(owner: &str, field_id: &str, target: &LinkTarget, known: &HashSet<String>) -> TargetRef {
    let resolved = match target {
        LinkTarget::Asset => TargetRef::Asset,
        LinkTarget::Entry { content_types } => match content_types.as_slice() {
            [] => TargetRef::Unresolved {
                reason: "no linkContentType validation".to_string(),
            },
            [single] if known.contains(single) => TargetRef::ContentType(single.clone()),
            [single] => TargetRef::Unresolved {
                reason: format!("target content type {} is not compiled", single),
            },
            many => TargetRef::Unresolved {
                reason: format!("{} candidate content types", many.len()),
            },
        },
    };

    if let TargetRef::Unresolved { reason } = &resolved {
        warn!(
            content_type = owner,
            field = field_id,
            reason = reason.as_str(),
            "Link target unresolved, links will be returned as stubs"
        );
    }
    resolved
}

/// Kind of a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    OneToOne,
    ManyToMany,
}

/// A reference field of a compiled content type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub owner: String,
    pub field_id: String,
    pub kind: ReferenceKind,
    pub target: TargetRef,
    /// Link column (one-to-one) or ConTable (many-to-many).
    pub storage: Ident,
}

/// Directed edge: `from` depends on `to`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Dependency {
    pub from: String,
    pub to: String,
}

/// Structural dependency edges of a reference.
///
/// One-to-one: owner → target. Many-to-many: ConTable → owner and
/// ConTable → target.
pub fn dependencies_of(reference: &Reference) -> Vec<Dependency> {
    let Some(target) = reference.target.node() else {
        return Vec::new();
    };
    match reference.kind {
        ReferenceKind::OneToOne => vec![Dependency {
            from: reference.owner.clone(),
            to: target.to_string(),
        }],
        ReferenceKind::ManyToMany => vec![
            Dependency {
                from: reference.storage.to_string(),
                to: reference.owner.clone(),
            },
            Dependency {
                from: reference.storage.to_string(),
                to: target.to_string(),
            },
        ],
    }
}

/// Which content types read which, for view refresh propagation.
///
/// A type reads its link targets directly (one-to-one) or through a
/// ConTable (many-to-many); both make its views stale when a target changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    /// target -> types reading it
    readers: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    pub fn from_references(references: &[Reference]) -> Self {
        let mut readers: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for reference in references {
            if let Some(target) = reference.target.node() {
                readers
                    .entry(target.to_string())
                    .or_default()
                    .insert(reference.owner.clone());
            }
        }
        Self { readers }
    }

    /// Types reading `node` directly.
    pub fn readers_of(&self, node: &str) -> impl Iterator<Item = &String> {
        self.readers.get(node).into_iter().flatten()
    }

    /// `node` plus every type reading it within `max_depth` hops.
    pub fn dependents_closure(&self, node: &str, max_depth: u8) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        seen.insert(node.to_string());

        let mut queue = VecDeque::from([(node.to_string(), 0u8)]);
        while let Some((current, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            for reader in self.readers_of(&current) {
                if seen.insert(reader.clone()) {
                    queue.push_back((reader.clone(), depth + 1));
                }
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cms_core::{Field, FieldType, ScalarKind};

    fn known(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn reference(owner: &str, target: &str, kind: ReferenceKind) -> Reference {
        Reference {
            owner: owner.to_string(),
            field_id: "f".to_string(),
            kind,
            target: TargetRef::ContentType(target.to_string()),
            storage: Ident::sanitize(&format!("con_{}_f", owner)),
        }
    }

    #[test]
    fn test_classify() {
        let known = known(&["brand", "tag"]);
        let scalar = FieldShape::Scalar(ScalarKind::Text);
        assert_eq!(classify("product", "name", &scalar, &known), Classification::NoReference);

        let brand = Field::entry_link("brand", "brand").shape("product").unwrap();
        assert_eq!(
            classify("product", "brand", &brand, &known),
            Classification::OneToOne {
                target: TargetRef::ContentType("brand".to_string())
            }
        );

        let tags = Field::entry_links("tags", "tag").shape("product").unwrap();
        assert!(matches!(
            classify("product", "tags", &tags, &known),
            Classification::ManyToMany {
                target: TargetRef::ContentType(_)
            }
        ));

        let image = Field::asset_link("image").shape("product").unwrap();
        assert_eq!(
            classify("product", "image", &image, &known),
            Classification::OneToOne {
                target: TargetRef::Asset
            }
        );
    }

    #[test]
    fn test_unresolved_targets() {
        let known = known(&["brand"]);

        let missing = Field::entry_link("author", "person").shape("post").unwrap();
        assert!(matches!(
            classify("post", "author", &missing, &known),
            Classification::OneToOne {
                target: TargetRef::Unresolved { .. }
            }
        ));

        let mut open = Field::new("any", FieldType::Link);
        open.link_type = Some(cms_core::LinkType::Entry);
        let shape = open.shape("post").unwrap();
        assert!(matches!(
            classify("post", "any", &shape, &known),
            Classification::OneToOne {
                target: TargetRef::Unresolved { .. }
            }
        ));
    }

    #[test]
    fn test_dependency_edges() {
        let one = reference("product", "brand", ReferenceKind::OneToOne);
        assert_eq!(
            dependencies_of(&one),
            vec![Dependency {
                from: "product".to_string(),
                to: "brand".to_string()
            }]
        );

        let many = reference("product", "tag", ReferenceKind::ManyToMany);
        let edges = dependencies_of(&many);
        assert_eq!(edges.len(), 2);
        assert!(edges.iter().all(|e| e.from == "con_product_f"));
        assert_eq!(edges[0].to, "product");
        assert_eq!(edges[1].to, "tag");
    }

    #[test]
    fn test_dependents_closure_is_bounded() {
        // page -> product -> brand, article standalone
        let graph = DependencyGraph::from_references(&[
            reference("product", "brand", ReferenceKind::OneToOne),
            reference("page", "product", ReferenceKind::ManyToMany),
        ]);

        let all = graph.dependents_closure("brand", 3);
        assert_eq!(all, ["brand", "page", "product"].iter().map(|s| s.to_string()).collect());

        let near = graph.dependents_closure("brand", 1);
        assert_eq!(near, ["brand", "product"].iter().map(|s| s.to_string()).collect());

        let alone = graph.dependents_closure("article", 3);
        assert_eq!(alone.len(), 1);
    }

    #[test]
    fn test_cycles_terminate() {
        let graph = DependencyGraph::from_references(&[
            reference("a", "b", ReferenceKind::OneToOne),
            reference("b", "a", ReferenceKind::OneToOne),
        ]);
        assert_eq!(graph.dependents_closure("a", 10).len(), 2);
    }
}
