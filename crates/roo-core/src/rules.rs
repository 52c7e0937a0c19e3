//! Rules documents, their rules and footnotes.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::code::{CommodityCode, HsRange};
use crate::hierarchy::{HierarchyLevel, NodeId, TreeId};

ulid_id!(
    /// Identifier of a rules document.
    DocumentId
);
ulid_id!(
    /// Identifier of a single rule.
    RuleId
);
ulid_id!(
    /// Identifier of a stored footnote.
    FootnoteId
);

/// Footnote identifier reserved for a document's introductory notes.
pub const INTRODUCTORY_NOTES_IDENTIFIER: &str = "COMM";

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Country {
    pub country_code: String,
    pub name: String,
}

/// A trade agreement's rules of origin for one or more countries.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RulesDocument {
    pub id: DocumentId,
    pub tree_id: TreeId,
    pub description: String,
    #[serde(with = "time::serde::rfc3339")]
    pub start_date: OffsetDateTime,
    pub country_codes: Vec<String>,
    pub source_url: Option<String>,
}

impl RulesDocument {
    #[must_use]
    pub fn applies_to(&self, country_code: &str) -> bool {
        self.country_codes.iter().any(|code| code == country_code)
    }

    #[must_use]
    pub fn is_effective(&self, as_of: OffsetDateTime) -> bool {
        self.start_date <= as_of
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SubRule {
    pub order: u32,
    pub description: Option<String>,
    pub rule_text: Option<String>,
    pub alt_rule_text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Rule {
    pub id: RuleId,
    pub document_id: DocumentId,
    /// Code as printed in the source document, e.g. `ex 0101`.
    pub code: String,
    pub description: String,
    pub hs_range: Option<HsRange>,
    pub is_extract: bool,
    pub rule_text: Option<String>,
    pub alt_rule_text: Option<String>,
    pub subrules: Vec<SubRule>,
}

impl Rule {
    /// Whether the rule's code range includes `code`.
    ///
    /// Rules without a range apply wherever they are linked.
    #[must_use]
    pub fn covers(&self, code: &CommodityCode) -> bool {
        self.hs_range.as_ref().map_or(true, |range| range.covers(code))
    }

    /// A heading description without rule text of its own.
    #[must_use]
    pub fn is_leading(&self) -> bool {
        self.rule_text
            .as_deref()
            .map_or(true, |text| text.trim().is_empty())
            && self.subrules.is_empty()
    }
}

/// Association of a rule with the hierarchy node it was linked to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct RuleLink {
    pub rule_id: RuleId,
    pub level: HierarchyLevel,
    pub node_id: NodeId,
}

/// A candidate rule together with the level it was reached through.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LinkedRule {
    pub level: HierarchyLevel,
    pub rule: Rule,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Footnote {
    pub id: FootnoteId,
    pub document_id: DocumentId,
    pub identifier: String,
    pub number: u32,
    pub note: String,
}

impl Footnote {
    #[must_use]
    pub fn is_introductory_notes(&self) -> bool {
        self.identifier == INTRODUCTORY_NOTES_IDENTIFIER
    }
}
