//! Versioned commodity hierarchy: trees, nodes and ancestor chains.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::code::CommodityCode;
use crate::error::ResolveError;

ulid_id!(
    /// Identifier of a dated nomenclature tree.
    TreeId
);
ulid_id!(
    /// Identifier of a node inside a nomenclature tree.
    NodeId
);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Region {
    Uk,
    Eu,
}

impl Region {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uk => "UK",
            Self::Eu => "EU",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "UK" => Some(Self::Uk),
            "EU" => Some(Self::Eu),
            _ => None,
        }
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A dated, region-scoped version of the nomenclature.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NomenclatureTree {
    pub id: TreeId,
    pub region: Region,
    #[serde(with = "time::serde::rfc3339")]
    pub start_date: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub end_date: Option<OffsetDateTime>,
}

impl NomenclatureTree {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.end_date.is_none()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Section,
    Chapter,
    Heading,
    SubHeading,
    Commodity,
}

impl NodeKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Section => "section",
            Self::Chapter => "chapter",
            Self::Heading => "heading",
            Self::SubHeading => "sub_heading",
            Self::Commodity => "commodity",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "section" => Some(Self::Section),
            "chapter" => Some(Self::Chapter),
            "heading" => Some(Self::Heading),
            "sub_heading" => Some(Self::SubHeading),
            "commodity" => Some(Self::Commodity),
            _ => None,
        }
    }

    /// Kinds a node of this kind may hang under. Sections are roots.
    #[must_use]
    pub fn allowed_parents(self) -> &'static [NodeKind] {
        match self {
            Self::Section => &[],
            Self::Chapter => &[Self::Section],
            Self::Heading => &[Self::Chapter],
            Self::SubHeading => &[Self::Heading, Self::SubHeading],
            Self::Commodity => &[Self::Heading, Self::SubHeading],
        }
    }

    /// The level rules can be linked at, if any.
    #[must_use]
    pub fn level(self) -> Option<HierarchyLevel> {
        match self {
            Self::Section => None,
            Self::Chapter => Some(HierarchyLevel::Chapter),
            Self::Heading => Some(HierarchyLevel::Heading),
            Self::SubHeading => Some(HierarchyLevel::SubHeading),
            Self::Commodity => Some(HierarchyLevel::Commodity),
        }
    }
}

/// Hierarchy levels rules can be linked to, ordered broad to specific.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HierarchyLevel {
    Chapter,
    Heading,
    SubHeading,
    Commodity,
}

impl HierarchyLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chapter => "chapter",
            Self::Heading => "heading",
            Self::SubHeading => "sub_heading",
            Self::Commodity => "commodity",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "chapter" => Some(Self::Chapter),
            "heading" => Some(Self::Heading),
            "sub_heading" => Some(Self::SubHeading),
            "commodity" => Some(Self::Commodity),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct HierarchyNode {
    pub id: NodeId,
    pub tree_id: TreeId,
    pub kind: NodeKind,
    pub code: CommodityCode,
    pub description: String,
    pub parent: Option<NodeId>,
}

impl HierarchyNode {
    /// Check the parent contract for this node's kind.
    ///
    /// # Errors
    /// Returns [`ResolveError::Validation`] when the parent is missing, of a
    /// kind this node cannot hang under, from another tree, or when the node's
    /// code does not extend the parent's code.
    pub fn validate_parent(&self, parent: Option<&HierarchyNode>) -> Result<(), ResolveError> {
        let allowed = self.kind.allowed_parents();
        match parent {
            None if allowed.is_empty() => Ok(()),
            None => Err(ResolveError::Validation(format!(
                "{} {} requires a parent",
                self.kind.as_str(),
                self.code
            ))),
            Some(parent) => {
                if allowed.is_empty() {
                    return Err(ResolveError::Validation(format!(
                        "section {} cannot have a parent",
                        self.code
                    )));
                }
                if !allowed.contains(&parent.kind) {
                    return Err(ResolveError::Validation(format!(
                        "{} {} cannot be placed under {} {}",
                        self.kind.as_str(),
                        self.code,
                        parent.kind.as_str(),
                        parent.code
                    )));
                }
                if parent.tree_id != self.tree_id {
                    return Err(ResolveError::Validation(format!(
                        "{} {} and its parent belong to different trees",
                        self.kind.as_str(),
                        self.code
                    )));
                }
                if parent.kind != NodeKind::Section && !parent.code.is_prefix_of(&self.code) {
                    return Err(ResolveError::Validation(format!(
                        "code {} does not extend parent code {}",
                        self.code, parent.code
                    )));
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AncestorEntry {
    pub kind: NodeKind,
    pub id: NodeId,
    pub code: CommodityCode,
    pub description: String,
}

impl From<&HierarchyNode> for AncestorEntry {
    fn from(node: &HierarchyNode) -> Self {
        Self {
            kind: node.kind,
            id: node.id,
            code: node.code.clone(),
            description: node.description.clone(),
        }
    }
}

/// Root-to-leaf path of a node, materialised once per query.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct AncestorChain {
    pub entries: Vec<AncestorEntry>,
}

impl AncestorChain {
    /// Build a chain from a leaf-to-root walk.
    #[must_use]
    pub fn from_leaf_first(mut entries: Vec<AncestorEntry>) -> Self {
        entries.reverse();
        Self { entries }
    }

    #[must_use]
    pub fn leaf(&self) -> Option<&AncestorEntry> {
        self.entries.last()
    }

    /// Ids of the chapter, heading, sub-heading and commodity on the path.
    ///
    /// With nested sub-headings the deepest one is used.
    ///
    /// # Errors
    /// Returns [`ResolveError::Validation`] when the chain has no chapter.
    pub fn context_ids(&self) -> Result<HierarchyContextIds, ResolveError> {
        let mut chapter_id = None;
        let mut heading_id = None;
        let mut subheading_id = None;
        let mut commodity_id = None;

        for entry in &self.entries {
            match entry.kind {
                NodeKind::Section => {}
                NodeKind::Chapter => chapter_id = Some(entry.id),
                NodeKind::Heading => heading_id = Some(entry.id),
                NodeKind::SubHeading => subheading_id = Some(entry.id),
                NodeKind::Commodity => commodity_id = Some(entry.id),
            }
        }

        let Some(chapter_id) = chapter_id else {
            let leaf = self
                .leaf()
                .map_or_else(|| "<empty>".to_string(), |entry| entry.code.to_string());
            return Err(ResolveError::Validation(format!(
                "ancestor chain of {leaf} has no chapter"
            )));
        };

        Ok(HierarchyContextIds {
            chapter_id,
            heading_id,
            subheading_id,
            commodity_id,
        })
    }
}

/// The hierarchy nodes a code sits under, one per linkable level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct HierarchyContextIds {
    pub chapter_id: NodeId,
    pub heading_id: Option<NodeId>,
    pub subheading_id: Option<NodeId>,
    pub commodity_id: Option<NodeId>,
}

impl HierarchyContextIds {
    #[must_use]
    pub fn node_at(&self, level: HierarchyLevel) -> Option<NodeId> {
        match level {
            HierarchyLevel::Chapter => Some(self.chapter_id),
            HierarchyLevel::Heading => self.heading_id,
            HierarchyLevel::SubHeading => self.subheading_id,
            HierarchyLevel::Commodity => self.commodity_id,
        }
    }

    /// Present `(level, node)` pairs, broad to specific.
    #[must_use]
    pub fn levels(&self) -> Vec<(HierarchyLevel, NodeId)> {
        [
            HierarchyLevel::Chapter,
            HierarchyLevel::Heading,
            HierarchyLevel::SubHeading,
            HierarchyLevel::Commodity,
        ]
        .into_iter()
        .filter_map(|level| self.node_at(level).map(|id| (level, id)))
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(tree_id: TreeId, kind: NodeKind, code: &str, parent: Option<NodeId>) -> HierarchyNode {
        let code = match CommodityCode::parse(code) {
            Ok(code) => code,
            Err(err) => panic!("bad code {code}: {err}"),
        };
        HierarchyNode {
            id: NodeId::new(),
            tree_id,
            kind,
            description: format!("{} {code}", kind.as_str()),
            code,
            parent,
        }
    }

    // Test IDs: HIER-001
    #[test]
    fn parent_contract_follows_node_kind() {
        let tree_id = TreeId::new();
        let section = node(tree_id, NodeKind::Section, "01", None);
        let chapter = node(tree_id, NodeKind::Chapter, "01", Some(section.id));
        let heading = node(tree_id, NodeKind::Heading, "0101", Some(chapter.id));
        let sub = node(tree_id, NodeKind::SubHeading, "010121", Some(heading.id));
        let nested = node(tree_id, NodeKind::SubHeading, "01012110", Some(sub.id));
        let leaf = node(tree_id, NodeKind::Commodity, "0101211000", Some(nested.id));

        assert!(section.validate_parent(None).is_ok());
        assert!(chapter.validate_parent(Some(&section)).is_ok());
        assert!(heading.validate_parent(Some(&chapter)).is_ok());
        assert!(sub.validate_parent(Some(&heading)).is_ok());
        assert!(nested.validate_parent(Some(&sub)).is_ok());
        assert!(leaf.validate_parent(Some(&nested)).is_ok());

        assert!(chapter.validate_parent(None).is_err());
        assert!(heading.validate_parent(Some(&section)).is_err());
        assert!(leaf.validate_parent(Some(&chapter)).is_err());
        assert!(section.validate_parent(Some(&chapter)).is_err());
    }

    #[test]
    fn parent_contract_rejects_inconsistent_codes_and_trees() {
        let tree_id = TreeId::new();
        let chapter = node(tree_id, NodeKind::Chapter, "01", None);
        let stray = node(tree_id, NodeKind::Heading, "0201", Some(chapter.id));
        assert!(stray.validate_parent(Some(&chapter)).is_err());

        let foreign = node(TreeId::new(), NodeKind::Heading, "0101", Some(chapter.id));
        assert!(foreign.validate_parent(Some(&chapter)).is_err());
    }

    // Test IDs: HIER-002
    #[test]
    fn context_ids_use_deepest_subheading() {
        let tree_id = TreeId::new();
        let chapter = node(tree_id, NodeKind::Chapter, "01", None);
        let heading = node(tree_id, NodeKind::Heading, "0101", Some(chapter.id));
        let outer = node(tree_id, NodeKind::SubHeading, "010121", Some(heading.id));
        let inner = node(tree_id, NodeKind::SubHeading, "01012110", Some(outer.id));
        let leaf = node(tree_id, NodeKind::Commodity, "0101211000", Some(inner.id));

        let chain = AncestorChain::from_leaf_first(
            [&leaf, &inner, &outer, &heading, &chapter]
                .into_iter()
                .map(AncestorEntry::from)
                .collect(),
        );
        let ids = match chain.context_ids() {
            Ok(ids) => ids,
            Err(err) => panic!("context ids failed: {err}"),
        };

        assert_eq!(ids.chapter_id, chapter.id);
        assert_eq!(ids.heading_id, Some(heading.id));
        assert_eq!(ids.subheading_id, Some(inner.id));
        assert_eq!(ids.commodity_id, Some(leaf.id));
        assert_eq!(ids.levels().len(), 4);
        assert_eq!(chain.leaf().map(|entry| entry.id), Some(leaf.id));
    }

    #[test]
    fn context_ids_for_heading_leave_lower_levels_empty() {
        let tree_id = TreeId::new();
        let chapter = node(tree_id, NodeKind::Chapter, "01", None);
        let heading = node(tree_id, NodeKind::Heading, "0101", Some(chapter.id));
        let chain = AncestorChain::from_leaf_first(vec![
            AncestorEntry::from(&heading),
            AncestorEntry::from(&chapter),
        ]);

        let ids = match chain.context_ids() {
            Ok(ids) => ids,
            Err(err) => panic!("context ids failed: {err}"),
        };
        assert_eq!(ids.subheading_id, None);
        assert_eq!(ids.commodity_id, None);
        assert_eq!(
            ids.levels(),
            vec![
                (HierarchyLevel::Chapter, chapter.id),
                (HierarchyLevel::Heading, heading.id)
            ]
        );
    }

    #[test]
    fn chain_without_chapter_is_rejected() {
        assert!(AncestorChain::default().context_ids().is_err());
    }

    #[test]
    fn levels_order_broad_to_specific() {
        assert!(HierarchyLevel::Chapter < HierarchyLevel::Heading);
        assert!(HierarchyLevel::Heading < HierarchyLevel::SubHeading);
        assert!(HierarchyLevel::SubHeading < HierarchyLevel::Commodity);
        assert_eq!(NodeKind::Section.level(), None);
        assert_eq!(
            HierarchyLevel::parse(HierarchyLevel::SubHeading.as_str()),
            Some(HierarchyLevel::SubHeading)
        );
        assert_eq!(Region::parse("uk"), Some(Region::Uk));
    }
}
