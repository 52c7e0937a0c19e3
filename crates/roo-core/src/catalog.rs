//! In-memory [`RulesSource`] for fixtures, tools and benchmarks.

use std::collections::BTreeMap;

use time::OffsetDateTime;

use crate::code::CommodityCode;
use crate::error::ResolveError;
use crate::hierarchy::{
    AncestorChain, AncestorEntry, HierarchyContextIds, HierarchyNode, NodeId, NomenclatureTree,
    Region, TreeId,
};
use crate::resolver::RulesSource;
use crate::rules::{Country, DocumentId, Footnote, LinkedRule, Rule, RuleId, RuleLink, RulesDocument};

#[derive(Debug, Clone, Default)]
pub struct RulesCatalog {
    trees: Vec<NomenclatureTree>,
    nodes: BTreeMap<NodeId, HierarchyNode>,
    countries: BTreeMap<String, Country>,
    documents: Vec<RulesDocument>,
    rules: Vec<Rule>,
    links: Vec<RuleLink>,
    footnotes: Vec<Footnote>,
}

impl RulesCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// Returns [`ResolveError::Validation`] when the tree would be a second
    /// active tree for its region.
    pub fn add_tree(&mut self, tree: NomenclatureTree) -> Result<(), ResolveError> {
        if tree.is_active()
            && self
                .trees
                .iter()
                .any(|existing| existing.region == tree.region && existing.is_active())
        {
            return Err(ResolveError::Validation(format!(
                "region {} already has an active nomenclature tree",
                tree.region
            )));
        }
        self.trees.push(tree);
        Ok(())
    }

    /// Make `tree_id` the active tree of its region, ending the current one.
    ///
    /// # Errors
    /// Returns [`ResolveError::Validation`] for an unknown tree.
    pub fn activate_tree(&mut self, tree_id: TreeId, at: OffsetDateTime) -> Result<(), ResolveError> {
        let Some(region) = self
            .trees
            .iter()
            .find(|tree| tree.id == tree_id)
            .map(|tree| tree.region)
        else {
            return Err(ResolveError::Validation(format!("unknown tree {tree_id}")));
        };
        for tree in &mut self.trees {
            if tree.id == tree_id {
                tree.end_date = None;
            } else if tree.region == region && tree.is_active() {
                tree.end_date = Some(at);
            }
        }
        Ok(())
    }

    /// # Errors
    /// Returns [`ResolveError::Validation`] when the tree or parent is unknown
    /// or the parent contract is violated.
    pub fn add_node(&mut self, node: HierarchyNode) -> Result<(), ResolveError> {
        if !self.trees.iter().any(|tree| tree.id == node.tree_id) {
            return Err(ResolveError::Validation(format!(
                "node {} references unknown tree {}",
                node.code, node.tree_id
            )));
        }
        let parent = match node.parent {
            Some(parent_id) => Some(self.nodes.get(&parent_id).ok_or_else(|| {
                ResolveError::Validation(format!(
                    "node {} references unknown parent {parent_id}",
                    node.code
                ))
            })?),
            None => None,
        };
        node.validate_parent(parent)?;
        self.nodes.insert(node.id, node);
        Ok(())
    }

    pub fn add_country(&mut self, country: Country) {
        self.countries.insert(country.country_code.clone(), country);
    }

    /// # Errors
    /// Returns [`ResolveError::Validation`] for unknown trees or countries and
    /// for a description already used in the same tree.
    pub fn add_document(&mut self, document: RulesDocument) -> Result<(), ResolveError> {
        if !self.trees.iter().any(|tree| tree.id == document.tree_id) {
            return Err(ResolveError::Validation(format!(
                "document `{}` references unknown tree {}",
                document.description, document.tree_id
            )));
        }
        if let Some(unknown) = document
            .country_codes
            .iter()
            .find(|code| !self.countries.contains_key(*code))
        {
            return Err(ResolveError::Validation(format!(
                "document `{}` references unknown country {unknown}",
                document.description
            )));
        }
        if self.documents.iter().any(|existing| {
            existing.tree_id == document.tree_id && existing.description == document.description
        }) {
            return Err(ResolveError::Validation(format!(
                "duplicate rules document description `{}`",
                document.description
            )));
        }
        self.documents.push(document);
        Ok(())
    }

    /// # Errors
    /// Returns [`ResolveError::Validation`] when the document is unknown.
    pub fn add_rule(&mut self, rule: Rule) -> Result<(), ResolveError> {
        self.require_document(rule.document_id)?;
        self.rules.push(rule);
        Ok(())
    }

    /// Link a rule to a hierarchy node; the level follows the node's kind.
    ///
    /// # Errors
    /// Returns [`ResolveError::Validation`] for unknown rules or nodes and for
    /// section nodes, which cannot carry rules.
    pub fn link_rule(&mut self, rule_id: RuleId, node_id: NodeId) -> Result<(), ResolveError> {
        if !self.rules.iter().any(|rule| rule.id == rule_id) {
            return Err(ResolveError::Validation(format!("unknown rule {rule_id}")));
        }
        let node = self
            .nodes
            .get(&node_id)
            .ok_or_else(|| ResolveError::Validation(format!("unknown node {node_id}")))?;
        let level = node.kind.level().ok_or_else(|| {
            ResolveError::Validation(format!("rules cannot be linked to section {}", node.code))
        })?;
        let link = RuleLink {
            rule_id,
            level,
            node_id,
        };
        if !self.links.contains(&link) {
            self.links.push(link);
        }
        Ok(())
    }

    /// # Errors
    /// Returns [`ResolveError::Validation`] when the document is unknown.
    pub fn add_footnote(&mut self, footnote: Footnote) -> Result<(), ResolveError> {
        self.require_document(footnote.document_id)?;
        self.footnotes.push(footnote);
        Ok(())
    }

    #[must_use]
    pub fn trees(&self) -> &[NomenclatureTree] {
        &self.trees
    }

    /// Node for `code`, preferring the exact code and the most specific kind,
    /// then falling back to the enclosing sub-heading, heading or chapter.
    #[must_use]
    pub fn find_node(&self, tree_id: TreeId, code: &CommodityCode) -> Option<&HierarchyNode> {
        code.lookup_candidates().into_iter().find_map(|candidate| {
            self.nodes
                .values()
                .filter(|node| {
                    node.tree_id == tree_id && node.kind.level().is_some() && node.code == candidate
                })
                .max_by_key(|node| node.kind)
        })
    }

    /// # Errors
    /// Returns [`ResolveError::Source`] when a parent link is dangling or loops.
    pub fn ancestor_chain_of(&self, node: &HierarchyNode) -> Result<AncestorChain, ResolveError> {
        let mut entries = vec![AncestorEntry::from(node)];
        let mut next = node.parent;
        while let Some(parent_id) = next {
            if entries.len() > self.nodes.len() {
                return Err(ResolveError::Source(format!(
                    "parent cycle above node {}",
                    node.code
                )));
            }
            let parent = self.nodes.get(&parent_id).ok_or_else(|| {
                ResolveError::Source(format!("dangling parent {parent_id} above {}", node.code))
            })?;
            entries.push(AncestorEntry::from(parent));
            next = parent.parent;
        }
        Ok(AncestorChain::from_leaf_first(entries))
    }

    fn require_document(&self, document_id: DocumentId) -> Result<(), ResolveError> {
        if self.documents.iter().any(|document| document.id == document_id) {
            Ok(())
        } else {
            Err(ResolveError::Validation(format!(
                "unknown rules document {document_id}"
            )))
        }
    }
}

impl RulesSource for RulesCatalog {
    fn active_tree(&self, region: Region) -> Result<Option<NomenclatureTree>, ResolveError> {
        Ok(self
            .trees
            .iter()
            .find(|tree| tree.region == region && tree.is_active())
            .cloned())
    }

    fn country(&self, country_code: &str) -> Result<Option<Country>, ResolveError> {
        Ok(self.countries.get(country_code).cloned())
    }

    fn ancestor_chain(
        &self,
        tree_id: TreeId,
        code: &CommodityCode,
    ) -> Result<Option<AncestorChain>, ResolveError> {
        self.find_node(tree_id, code)
            .map(|node| self.ancestor_chain_of(node))
            .transpose()
    }

    fn rules_documents(
        &self,
        tree_id: TreeId,
        country_code: &str,
    ) -> Result<Vec<RulesDocument>, ResolveError> {
        Ok(self
            .documents
            .iter()
            .filter(|document| document.tree_id == tree_id && document.applies_to(country_code))
            .cloned()
            .collect())
    }

    fn linked_rules(
        &self,
        document_id: DocumentId,
        context: &HierarchyContextIds,
    ) -> Result<Vec<LinkedRule>, ResolveError> {
        let mut linked = Vec::new();
        for (level, node_id) in context.levels() {
            for rule in self.rules.iter().filter(|rule| rule.document_id == document_id) {
                let is_linked = self.links.iter().any(|link| {
                    link.rule_id == rule.id && link.level == level && link.node_id == node_id
                });
                if is_linked {
                    linked.push(LinkedRule {
                        level,
                        rule: rule.clone(),
                    });
                }
            }
        }
        Ok(linked)
    }

    fn footnotes(&self, document_id: DocumentId) -> Result<Vec<Footnote>, ResolveError> {
        let mut footnotes: Vec<Footnote> = self
            .footnotes
            .iter()
            .filter(|footnote| footnote.document_id == document_id)
            .cloned()
            .collect();
        footnotes.sort_by_key(|footnote| footnote.number);
        Ok(footnotes)
    }
}
