//! Rules-of-origin resolution over a versioned commodity hierarchy.
//!
//! The crate is storage agnostic: [`resolve_rules_of_origin`] reads through
//! the [`RulesSource`] trait, implemented in memory by [`RulesCatalog`] and
//! on `SQLite` by the store crate.

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug,
            Clone,
            Copy,
            serde::Serialize,
            serde::Deserialize,
            Eq,
            PartialEq,
            Ord,
            PartialOrd,
            Hash,
        )]
        pub struct $name(pub ulid::Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(ulid::Ulid::new())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = ulid::DecodeError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                ulid::Ulid::from_string(value).map(Self)
            }
        }
    };
}

pub mod catalog;
pub mod code;
pub mod error;
pub mod footnotes;
pub mod hierarchy;
pub mod resolver;
pub mod rules;

pub use catalog::RulesCatalog;
pub use code::{CommodityCode, HsRange, HsType, COMMODITY_CODE_WIDTH};
pub use error::ResolveError;
pub use footnotes::{
    marker_identifier, process_footnotes, AnnotatedRule, AnnotatedSubRule, CitationStyle,
    FootnoteProcessor, MarkerPatterns, ProcessedFootnotes,
};
pub use hierarchy::{
    AncestorChain, AncestorEntry, HierarchyContextIds, HierarchyLevel, HierarchyNode, NodeId,
    NodeKind, NomenclatureTree, Region, TreeId,
};
pub use resolver::{
    resolve_rules_of_origin, select_applicable_rules, DocumentRulesOfOrigin, ResolveQuery,
    ResolverOptions, RulesOfOrigin, RulesSource,
};
pub use rules::{
    Country, DocumentId, Footnote, FootnoteId, LinkedRule, Rule, RuleId, RuleLink, RulesDocument,
    SubRule, INTRODUCTORY_NOTES_IDENTIFIER,
};
