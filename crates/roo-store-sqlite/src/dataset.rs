//! Normalised JSON dataset accepted by [`SqliteStore::import_dataset`].
//!
//! [`SqliteStore::import_dataset`]: crate::SqliteStore::import_dataset

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use roo_core::{
    CommodityCode, Country, DocumentId, Footnote, FootnoteId, HierarchyNode, HsRange, HsType,
    NodeId, NodeKind, NomenclatureTree, Region, ResolveError, Rule, RuleId, RuleLink,
    RulesDocument, SubRule, TreeId,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Dataset {
    pub region: Region,
    #[serde(with = "time::serde::rfc3339")]
    pub start_date: OffsetDateTime,
    #[serde(default)]
    pub countries: Vec<Country>,
    pub nodes: Vec<DatasetNode>,
    #[serde(default)]
    pub documents: Vec<DatasetDocument>,
}

/// A hierarchy node, identified inside the dataset by `ref`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatasetNode {
    #[serde(rename = "ref")]
    pub key: String,
    pub kind: NodeKind,
    pub code: String,
    pub description: String,
    #[serde(default)]
    pub parent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatasetDocument {
    pub description: String,
    #[serde(with = "time::serde::rfc3339")]
    pub start_date: OffsetDateTime,
    pub countries: Vec<String>,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub rules: Vec<DatasetRule>,
    #[serde(default)]
    pub footnotes: Vec<DatasetFootnote>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatasetRule {
    pub code: String,
    pub description: String,
    #[serde(default)]
    pub hs_from: Option<String>,
    #[serde(default)]
    pub hs_to: Option<String>,
    #[serde(default)]
    pub is_extract: bool,
    #[serde(default)]
    pub rule_text: Option<String>,
    #[serde(default)]
    pub alt_rule_text: Option<String>,
    #[serde(default)]
    pub subrules: Vec<DatasetSubRule>,
    /// Node refs to link to. When empty, links are derived from the range.
    #[serde(default)]
    pub links: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatasetSubRule {
    #[serde(default)]
    pub order: Option<u32>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub rule_text: Option<String>,
    #[serde(default)]
    pub alt_rule_text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatasetFootnote {
    pub identifier: String,
    #[serde(default)]
    pub number: Option<u32>,
    pub note: String,
}

/// A dataset turned into domain values for a fresh tree, ready to insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedDataset {
    pub tree: NomenclatureTree,
    pub countries: Vec<Country>,
    pub nodes: Vec<HierarchyNode>,
    pub documents: Vec<PreparedDocument>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedDocument {
    pub document: RulesDocument,
    pub rules: Vec<Rule>,
    pub links: Vec<RuleLink>,
    pub footnotes: Vec<Footnote>,
}

impl Dataset {
    /// # Errors
    /// Returns an error when the file cannot be read or is not a valid dataset.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read dataset {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse dataset {}", path.display()))
    }

    /// Validate the dataset and build the domain values of a new tree.
    ///
    /// Nodes must be listed after their parent. Country codes are checked
    /// against the dataset's own countries plus `known_countries`.
    ///
    /// # Errors
    /// Returns [`ResolveError`] describing the first problem found.
    pub fn prepare(&self, known_countries: &BTreeSet<String>) -> Result<PreparedDataset, ResolveError> {
        let tree = NomenclatureTree {
            id: TreeId::new(),
            region: self.region,
            start_date: self.start_date,
            end_date: None,
        };
        let nodes = self.prepare_nodes(tree.id)?;
        let node_ids: BTreeMap<&str, usize> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(index, node)| (node.key.as_str(), index))
            .collect();

        let mut countries: BTreeSet<String> = known_countries.clone();
        countries.extend(self.countries.iter().map(|country| country.country_code.clone()));

        let mut descriptions = BTreeSet::new();
        let mut documents = Vec::with_capacity(self.documents.len());
        for source in &self.documents {
            if !descriptions.insert(source.description.as_str()) {
                return Err(ResolveError::Validation(format!(
                    "duplicate rules document description `{}`",
                    source.description
                )));
            }
            documents.push(prepare_document(source, &tree, &nodes, &node_ids, &countries)?);
        }

        Ok(PreparedDataset {
            tree,
            countries: self.countries.clone(),
            nodes,
            documents,
        })
    }

    fn prepare_nodes(&self, tree_id: TreeId) -> Result<Vec<HierarchyNode>, ResolveError> {
        let mut by_key: BTreeMap<&str, usize> = BTreeMap::new();
        let mut nodes: Vec<HierarchyNode> = Vec::with_capacity(self.nodes.len());

        for source in &self.nodes {
            if by_key.contains_key(source.key.as_str()) {
                return Err(ResolveError::Validation(format!(
                    "duplicate node ref `{}`",
                    source.key
                )));
            }
            let parent_index = match &source.parent {
                Some(parent) => Some(*by_key.get(parent.as_str()).ok_or_else(|| {
                    ResolveError::Validation(format!(
                        "node `{}` references parent `{parent}` which is not listed before it",
                        source.key
                    ))
                })?),
                None => None,
            };
            let node = HierarchyNode {
                id: NodeId::new(),
                tree_id,
                kind: source.kind,
                code: CommodityCode::parse(&source.code)?,
                description: source.description.clone(),
                parent: parent_index.map(|index| nodes[index].id),
            };
            node.validate_parent(parent_index.map(|index| &nodes[index]))?;
            by_key.insert(source.key.as_str(), nodes.len());
            nodes.push(node);
        }

        Ok(nodes)
    }
}

fn prepare_document(
    source: &DatasetDocument,
    tree: &NomenclatureTree,
    nodes: &[HierarchyNode],
    node_ids: &BTreeMap<&str, usize>,
    countries: &BTreeSet<String>,
) -> Result<PreparedDocument, ResolveError> {
    if source.countries.is_empty() {
        return Err(ResolveError::Validation(format!(
            "rules document `{}` lists no countries",
            source.description
        )));
    }
    let missing: Vec<&str> = source
        .countries
        .iter()
        .filter(|code| !countries.contains(*code))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Err(ResolveError::Validation(format!(
            "rules document `{}` references unknown countries: {}",
            source.description,
            missing.join(", ")
        )));
    }

    let document = RulesDocument {
        id: DocumentId::new(),
        tree_id: tree.id,
        description: source.description.clone(),
        start_date: source.start_date,
        country_codes: source.countries.clone(),
        source_url: source.source_url.clone(),
    };

    let mut rules = Vec::with_capacity(source.rules.len());
    let mut links = Vec::new();
    for rule_source in &source.rules {
        let rule = prepare_rule(rule_source, document.id)?;
        if rule_source.links.is_empty() {
            links.extend(derive_links(&rule, nodes));
        } else {
            for key in &rule_source.links {
                let node = node_ids
                    .get(key.as_str())
                    .map(|index| &nodes[*index])
                    .ok_or_else(|| {
                        ResolveError::Validation(format!(
                            "rule `{}` links to unknown node `{key}`",
                            rule.code
                        ))
                    })?;
                let level = node.kind.level().ok_or_else(|| {
                    ResolveError::Validation(format!(
                        "rule `{}` cannot be linked to section `{key}`",
                        rule.code
                    ))
                })?;
                links.push(RuleLink {
                    rule_id: rule.id,
                    level,
                    node_id: node.id,
                });
            }
        }
        rules.push(rule);
    }

    let mut identifiers = BTreeSet::new();
    let mut footnotes = Vec::with_capacity(source.footnotes.len());
    for (position, note) in (1_u32..).zip(&source.footnotes) {
        if !identifiers.insert(note.identifier.as_str()) {
            return Err(ResolveError::Validation(format!(
                "rules document `{}` repeats footnote `{}`",
                source.description, note.identifier
            )));
        }
        footnotes.push(Footnote {
            id: FootnoteId::new(),
            document_id: document.id,
            identifier: note.identifier.clone(),
            number: note.number.unwrap_or(position),
            note: note.note.clone(),
        });
    }

    Ok(PreparedDocument {
        document,
        rules,
        links,
        footnotes,
    })
}

fn prepare_rule(source: &DatasetRule, document_id: DocumentId) -> Result<Rule, ResolveError> {
    let hs_range = match source.hs_from.as_deref().filter(|from| !from.trim().is_empty()) {
        Some(from) => Some(HsRange::new(from, source.hs_to.as_deref())?),
        None if source.hs_to.as_deref().is_some_and(|to| !to.trim().is_empty()) => {
            return Err(ResolveError::Validation(format!(
                "rule `{}` has hs_to without hs_from",
                source.code
            )));
        }
        None => None,
    };

    let subrules = (1_u32..)
        .zip(&source.subrules)
        .map(|(position, subrule)| SubRule {
            order: subrule.order.unwrap_or(position),
            description: subrule.description.clone(),
            rule_text: subrule.rule_text.clone(),
            alt_rule_text: subrule.alt_rule_text.clone(),
        })
        .collect();

    Ok(Rule {
        id: RuleId::new(),
        document_id,
        code: source.code.clone(),
        description: source.description.clone(),
        hs_range,
        is_extract: source.is_extract,
        rule_text: source.rule_text.clone(),
        alt_rule_text: source.alt_rule_text.clone(),
        subrules,
    })
}

/// Links implied by a rule's range: chapters for 2-digit ranges, headings for
/// 4-digit ranges, sub-headings and commodities for 6 and 8-digit ranges.
#[must_use]
pub fn derive_links(rule: &Rule, nodes: &[HierarchyNode]) -> Vec<RuleLink> {
    let Some(range) = &rule.hs_range else {
        tracing::warn!(rule = %rule.code, "rule has neither a code range nor explicit links");
        return Vec::new();
    };
    let kinds: &[NodeKind] = match range.hs_type {
        HsType::Chapter => &[NodeKind::Chapter],
        HsType::Heading => &[NodeKind::Heading],
        HsType::Subheading | HsType::Commodity => &[NodeKind::SubHeading, NodeKind::Commodity],
    };

    nodes
        .iter()
        .filter(|node| kinds.contains(&node.kind) && range.covers(&node.code))
        .filter_map(|node| {
            node.kind.level().map(|level| RuleLink {
                rule_id: rule.id,
                level,
                node_id: node.id,
            })
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use roo_core::HierarchyLevel;

    use super::*;

    pub(crate) const SAMPLE_DATASET: &str = r#"{
      "region": "UK",
      "start_date": "2021-01-01T00:00:00Z",
      "countries": [{"country_code": "KA", "name": "Kaland"}],
      "nodes": [
        {"ref": "I", "kind": "section", "code": "01", "description": "Live animals"},
        {"ref": "01", "kind": "chapter", "code": "01", "description": "Live animals", "parent": "I"},
        {"ref": "0101", "kind": "heading", "code": "0101", "description": "Horses", "parent": "01"},
        {"ref": "010121", "kind": "sub_heading", "code": "010121", "description": "Pure-bred", "parent": "0101"},
        {"ref": "0101210000", "kind": "commodity", "code": "0101210000", "description": "Pure-bred breeding", "parent": "010121"},
        {"ref": "0102", "kind": "heading", "code": "0102", "description": "Bovine", "parent": "01"}
      ],
      "documents": [{
        "description": "Rules for Kaland",
        "start_date": "2021-01-01T00:00:00Z",
        "countries": ["KA"],
        "rules": [
          {"code": "Chapter 01", "description": "Live animals", "hs_from": "01", "rule_text": "Wholly obtained [a]"},
          {"code": "ex 0101", "description": "Horses", "hs_from": "0101", "hs_to": "0102", "is_extract": true, "rule_text": "Manufacture"},
          {"code": "0101.21", "description": "Pure-bred", "hs_from": "010121", "subrules": [{"description": "Sub [001]"}]},
          {"code": "explicit", "description": "Linked", "links": ["0102"]}
        ],
        "footnotes": [
          {"identifier": "COMM", "note": "Introductory notes"},
          {"identifier": "001", "note": "See @{doc:COMM}[Introductory Note 3]"}
        ]
      }]
    }"#;

    fn sample() -> Result<Dataset> {
        serde_json::from_str(SAMPLE_DATASET).context("sample dataset should parse")
    }

    // Test IDs: DATA-001
    #[test]
    fn prepare_builds_tree_nodes_and_derived_links() -> Result<()> {
        let prepared = sample()?.prepare(&BTreeSet::new())?;

        assert_eq!(prepared.tree.region, Region::Uk);
        assert_eq!(prepared.nodes.len(), 6);
        assert!(prepared.nodes.iter().all(|node| node.tree_id == prepared.tree.id));

        let document = &prepared.documents[0];
        assert_eq!(document.rules.len(), 4);
        assert_eq!(document.footnotes[0].number, 1);
        assert_eq!(document.footnotes[1].number, 2);
        assert_eq!(document.rules[2].subrules[0].order, 1);

        let levels_for = |index: usize| -> Vec<HierarchyLevel> {
            document
                .links
                .iter()
                .filter(|link| link.rule_id == document.rules[index].id)
                .map(|link| link.level)
                .collect()
        };
        assert_eq!(levels_for(0), vec![HierarchyLevel::Chapter]);
        assert_eq!(levels_for(1), vec![HierarchyLevel::Heading, HierarchyLevel::Heading]);
        assert_eq!(
            levels_for(2),
            vec![HierarchyLevel::SubHeading, HierarchyLevel::Commodity]
        );
        assert_eq!(levels_for(3), vec![HierarchyLevel::Heading]);
        Ok(())
    }

    // Test IDs: DATA-002
    #[test]
    fn prepare_rejects_unknown_countries_and_duplicates() -> Result<()> {
        let mut dataset = sample()?;
        dataset.documents[0].countries.push("ZZ".to_string());
        assert!(dataset.prepare(&BTreeSet::new()).is_err());

        let known: BTreeSet<String> = ["ZZ".to_string()].into_iter().collect();
        assert!(dataset.prepare(&known).is_ok());

        let mut duplicated = sample()?;
        let copy = duplicated.documents[0].clone();
        duplicated.documents.push(copy);
        assert!(duplicated.prepare(&BTreeSet::new()).is_err());
        Ok(())
    }

    // Test IDs: DATA-003
    #[test]
    fn prepare_rejects_bad_ranges_and_links() -> Result<()> {
        let mut mismatched = sample()?;
        mismatched.documents[0].rules[1].hs_to = Some("010200".to_string());
        assert!(mismatched.prepare(&BTreeSet::new()).is_err());

        let mut unsupported = sample()?;
        unsupported.documents[0].rules[0].hs_from = Some("012".to_string());
        assert!(unsupported.prepare(&BTreeSet::new()).is_err());

        let mut dangling = sample()?;
        dangling.documents[0].rules[3].links = vec!["9999".to_string()];
        assert!(dangling.prepare(&BTreeSet::new()).is_err());

        let mut section_link = sample()?;
        section_link.documents[0].rules[3].links = vec!["I".to_string()];
        assert!(section_link.prepare(&BTreeSet::new()).is_err());
        Ok(())
    }

    #[test]
    fn prepare_requires_parents_before_children() -> Result<()> {
        let mut dataset = sample()?;
        dataset.nodes.swap(1, 2);
        assert!(dataset.prepare(&BTreeSet::new()).is_err());

        let mut wrong_kind = sample()?;
        wrong_kind.nodes[4].parent = Some("01".to_string());
        assert!(wrong_kind.prepare(&BTreeSet::new()).is_err());
        Ok(())
    }
}
