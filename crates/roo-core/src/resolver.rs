//! Rules-of-origin resolution: which rules apply to a commodity for a country.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, error};

use crate::code::CommodityCode;
use crate::error::ResolveError;
use crate::footnotes::{process_footnotes, AnnotatedRule, CitationStyle, MarkerPatterns};
use crate::hierarchy::{AncestorChain, HierarchyContextIds, NomenclatureTree, Region, TreeId};
use crate::rules::{Country, DocumentId, Footnote, LinkedRule, RulesDocument};

/// Read access to a consistent snapshot of the rules dataset.
pub trait RulesSource {
    /// # Errors
    /// Returns [`ResolveError::Source`] when the backing store fails.
    fn active_tree(&self, region: Region) -> Result<Option<NomenclatureTree>, ResolveError>;

    /// # Errors
    /// Returns [`ResolveError::Source`] when the backing store fails.
    fn country(&self, country_code: &str) -> Result<Option<Country>, ResolveError>;

    /// Root-to-leaf chain of the node holding `code`, or of the nearest
    /// enclosing sub-heading, heading or chapter.
    ///
    /// # Errors
    /// Returns [`ResolveError::Source`] when the backing store fails.
    fn ancestor_chain(
        &self,
        tree_id: TreeId,
        code: &CommodityCode,
    ) -> Result<Option<AncestorChain>, ResolveError>;

    /// Documents of `tree_id` that list `country_code`, whatever their start date.
    ///
    /// # Errors
    /// Returns [`ResolveError::Source`] when the backing store fails.
    fn rules_documents(
        &self,
        tree_id: TreeId,
        country_code: &str,
    ) -> Result<Vec<RulesDocument>, ResolveError>;

    /// Rules of `document_id` linked to any node in `context`, one entry per
    /// matching link, in insertion order within each level.
    ///
    /// # Errors
    /// Returns [`ResolveError::Source`] when the backing store fails.
    fn linked_rules(
        &self,
        document_id: DocumentId,
        context: &HierarchyContextIds,
    ) -> Result<Vec<LinkedRule>, ResolveError>;

    /// # Errors
    /// Returns [`ResolveError::Source`] when the backing store fails.
    fn footnotes(&self, document_id: DocumentId) -> Result<Vec<Footnote>, ResolveError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ResolveQuery {
    pub country_code: String,
    pub commodity_code: CommodityCode,
    #[serde(with = "time::serde::rfc3339")]
    pub as_of: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct ResolverOptions {
    pub citation_style: CitationStyle,
    /// Fail instead of logging when a cited footnote does not exist.
    pub strict_footnotes: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DocumentRulesOfOrigin {
    pub document: RulesDocument,
    pub rules: Vec<AnnotatedRule>,
    pub footnotes: Vec<Footnote>,
    pub introductory_notes: Footnote,
    pub missing_footnotes: Vec<String>,
}

/// Applicable rules keyed by document description.
pub type RulesOfOrigin = BTreeMap<String, DocumentRulesOfOrigin>;

/// Resolve the rules of origin for one country and commodity in `tree`.
///
/// An empty map means no document has rules for the code.
///
/// # Errors
/// Returns [`ResolveError::CountryNotFound`] or
/// [`ResolveError::CommodityNotFound`] for unknown inputs,
/// [`ResolveError::MissingIntroductoryNotes`] when a document with applicable
/// rules has no `COMM` note, [`ResolveError::MissingFootnote`] in strict mode,
/// [`ResolveError::Validation`] when two documents share a description, and
/// any error raised by `source`.
pub fn resolve_rules_of_origin<S: RulesSource + ?Sized>(
    source: &S,
    tree: &NomenclatureTree,
    query: &ResolveQuery,
    options: ResolverOptions,
) -> Result<RulesOfOrigin, ResolveError> {
    let country = source
        .country(&query.country_code)?
        .ok_or_else(|| ResolveError::CountryNotFound(query.country_code.clone()))?;
    let chain = source
        .ancestor_chain(tree.id, &query.commodity_code)?
        .ok_or_else(|| ResolveError::CommodityNotFound {
            code: query.commodity_code.to_string(),
            tree_id: tree.id,
        })?;
    let context = chain.context_ids()?;
    let patterns = MarkerPatterns::shared()?;

    let mut resolved = RulesOfOrigin::new();
    for document in source.rules_documents(tree.id, &country.country_code)? {
        if document.tree_id != tree.id || !document.applies_to(&country.country_code) {
            continue;
        }
        if !document.is_effective(query.as_of) {
            debug!(
                document = %document.description,
                start_date = %document.start_date,
                "skipping rules document not yet in force"
            );
            continue;
        }

        let candidates = source.linked_rules(document.id, &context)?;
        let rules = select_applicable_rules(candidates, &query.commodity_code);
        if rules.is_empty() {
            debug!(
                document = %document.description,
                commodity = %query.commodity_code,
                "no applicable rules in document"
            );
            continue;
        }

        let available = source.footnotes(document.id)?;
        let introductory_notes = available
            .iter()
            .find(|footnote| footnote.is_introductory_notes())
            .cloned()
            .ok_or_else(|| ResolveError::MissingIntroductoryNotes {
                document: document.description.clone(),
                country: country.country_code.clone(),
            })?;

        let processed = process_footnotes(patterns, options.citation_style, &rules, &available);
        if !processed.missing_identifiers.is_empty() {
            let identifiers = processed.missing_identifiers.join(", ");
            error!(
                country = %country.country_code,
                commodity = %query.commodity_code,
                document = %document.description,
                identifiers = %identifiers,
                "rules reference footnotes missing from their document"
            );
            if options.strict_footnotes {
                return Err(ResolveError::MissingFootnote {
                    document: document.description.clone(),
                    country: country.country_code.clone(),
                    commodity_code: query.commodity_code.to_string(),
                    identifiers,
                });
            }
        }

        debug!(
            document = %document.description,
            rules = processed.rules.len(),
            footnotes = processed.footnotes.len(),
            "resolved rules document"
        );
        let description = document.description.clone();
        if resolved.contains_key(&description) {
            return Err(ResolveError::Validation(format!(
                "more than one rules document described as `{description}`"
            )));
        }
        resolved.insert(
            description,
            DocumentRulesOfOrigin {
                document,
                rules: processed.rules,
                footnotes: processed.footnotes,
                introductory_notes,
                missing_footnotes: processed.missing_identifiers,
            },
        );
    }

    Ok(resolved)
}

/// Precedence over the candidate rules of one document.
///
/// Candidates outside their code range are dropped, the rest are ordered
/// chapter to commodity and de-duplicated keeping the first occurrence. An
/// extract rule is dropped when a non-extract rule applies at a more specific
/// level.
#[must_use]
pub fn select_applicable_rules(linked: Vec<LinkedRule>, code: &CommodityCode) -> Vec<LinkedRule> {
    let mut rules: Vec<LinkedRule> = linked
        .into_iter()
        .filter(|candidate| candidate.rule.covers(code))
        .collect();
    rules.sort_by_key(|candidate| candidate.level);

    let mut seen = BTreeSet::new();
    rules.retain(|candidate| seen.insert(candidate.rule.id));

    let deepest_full_rule = rules
        .iter()
        .filter(|candidate| !candidate.rule.is_extract)
        .map(|candidate| candidate.level)
        .max();
    if let Some(deepest) = deepest_full_rule {
        rules.retain(|candidate| !(candidate.rule.is_extract && candidate.level < deepest));
    }
    rules
}
