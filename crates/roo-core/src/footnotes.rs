//! Footnote markers in rule text: numbering, citation rendering and lookup.
//!
//! Rule texts reference document footnotes with bracketed markers such as
//! `[001]` or `[a]`. Each distinct identifier gets a display number in the
//! order it is first seen across the rules of one document, and every
//! occurrence is replaced by a citation carrying that number.

use std::collections::{BTreeMap, BTreeSet};

use once_cell::sync::OnceCell;
use regex_lite::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::error::ResolveError;
use crate::hierarchy::HierarchyLevel;
use crate::rules::{Footnote, LinkedRule, Rule, SubRule};

const NOTE_REFERENCE_PATTERN: &str = r"\[[A-Za-z0-9.]+\]";
const INTRODUCTORY_NOTE_REFERENCE_PATTERN: &str = r"@\{doc:COMM\}\[([A-Za-z0-9\s]+)\]";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CitationStyle {
    /// `<sup>1)</sup>`
    #[default]
    Plain,
    /// `<sup><a href="#roo_note_1" class="govuk-link">1)</a></sup>`
    Linked,
}

impl CitationStyle {
    #[must_use]
    pub fn render(self, number: u32) -> String {
        match self {
            Self::Plain => format!("<sup>{number})</sup>"),
            Self::Linked => format!(
                "<sup><a href=\"#roo_note_{number}\" class=\"govuk-link\">{number})</a></sup>"
            ),
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Linked => "linked",
        }
    }
}

static SHARED_PATTERNS: OnceCell<MarkerPatterns> = OnceCell::new();

/// Compiled marker patterns, shared by every processor of a request.
#[derive(Debug, Clone)]
pub struct MarkerPatterns {
    note_reference: Regex,
    introductory_note_reference: Regex,
}

impl MarkerPatterns {
    /// # Errors
    /// Returns [`ResolveError::Validation`] if a pattern fails to compile.
    pub fn compile() -> Result<Self, ResolveError> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|err| {
                ResolveError::Validation(format!("invalid marker pattern {pattern}: {err}"))
            })
        };
        Ok(Self {
            note_reference: compile(NOTE_REFERENCE_PATTERN)?,
            introductory_note_reference: compile(INTRODUCTORY_NOTE_REFERENCE_PATTERN)?,
        })
    }

    /// Process-wide patterns, compiled on first use.
    ///
    /// # Errors
    /// Returns [`ResolveError::Validation`] if a pattern fails to compile.
    pub fn shared() -> Result<&'static Self, ResolveError> {
        SHARED_PATTERNS.get_or_try_init(Self::compile)
    }
}

/// Footnote identifier a marker refers to.
///
/// A single lowercase letter stands for its alphabet position padded to three
/// digits (`a` is `001`); any other marker is the identifier itself.
#[must_use]
pub fn marker_identifier(marker: &str) -> String {
    let mut chars = marker.chars();
    match (chars.next(), chars.next()) {
        (Some(letter), None) if letter.is_ascii_lowercase() => {
            format!("{:03}", u32::from(letter) - u32::from('a') + 1)
        }
        _ => marker.to_string(),
    }
}

/// Markers are read from `description`, `rule_text` and `alt_rule_text`, in that order.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AnnotatedSubRule {
    pub order: u32,
    pub description: Option<String>,
    pub rule_text: Option<String>,
    pub alt_rule_text: Option<String>,
}

/// A rule with its texts rewritten for display. The stored rule is untouched.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AnnotatedRule {
    pub level: HierarchyLevel,
    pub rule: Rule,
    pub rule_text: Option<String>,
    pub alt_rule_text: Option<String>,
    pub subrules: Vec<AnnotatedSubRule>,
    /// Heading-only rule with no working requirement of its own.
    pub is_leading: bool,
    /// Display numbers of the footnotes this rule cites, by identifier.
    pub footnote_numbers: BTreeMap<String, u32>,
}

/// Request-scoped numbering state for the rules of one document.
#[derive(Debug)]
pub struct FootnoteProcessor<'p> {
    patterns: &'p MarkerPatterns,
    style: CitationStyle,
    found_note_ids: Vec<String>,
    note_number_by_id: BTreeMap<String, u32>,
    cited_by_current: BTreeMap<String, u32>,
}

impl<'p> FootnoteProcessor<'p> {
    #[must_use]
    pub fn new(patterns: &'p MarkerPatterns, style: CitationStyle) -> Self {
        Self {
            patterns,
            style,
            found_note_ids: Vec::new(),
            note_number_by_id: BTreeMap::new(),
            cited_by_current: BTreeMap::new(),
        }
    }

    /// Every identifier encountered so far, repeats included, in text order.
    #[must_use]
    pub fn found_note_ids(&self) -> &[String] {
        &self.found_note_ids
    }

    #[must_use]
    pub fn note_number_by_id(&self) -> &BTreeMap<String, u32> {
        &self.note_number_by_id
    }

    /// Replace every marker in `text` with its numbered citation.
    pub fn replace_note_references(&mut self, text: &str) -> String {
        let patterns = self.patterns;
        patterns
            .note_reference
            .replace_all(text, |caps: &Captures<'_>| {
                let marker = caps
                    .get(0)
                    .map_or("", |found| found.as_str())
                    .trim_matches(|ch: char| ch == '[' || ch == ']');
                let number = self.number_for(&marker_identifier(marker));
                self.style.render(number)
            })
            .into_owned()
    }

    /// Rewrite `@{doc:COMM}[Introductory Note 6]` as `Introductory Note 6 (below)`.
    #[must_use]
    pub fn replace_introductory_note_references(&self, text: &str) -> String {
        self.patterns
            .introductory_note_reference
            .replace_all(text, |caps: &Captures<'_>| {
                let reference = caps.get(1).map_or("", |found| found.as_str());
                format!("{reference} (below)")
            })
            .into_owned()
    }

    /// Rewrite the texts of one rule and its subrules, in document order.
    pub fn annotate(&mut self, linked: &LinkedRule) -> AnnotatedRule {
        self.cited_by_current.clear();
        let rule = &linked.rule;
        let rule_text = self.replace_optional(rule.rule_text.as_deref());
        let alt_rule_text = self.replace_optional(rule.alt_rule_text.as_deref());
        let subrules = rule
            .subrules
            .iter()
            .map(|subrule| self.annotate_subrule(subrule))
            .collect();

        AnnotatedRule {
            level: linked.level,
            rule: rule.clone(),
            rule_text,
            alt_rule_text,
            subrules,
            is_leading: rule.is_leading(),
            footnote_numbers: std::mem::take(&mut self.cited_by_current),
        }
    }

    /// Pick the referenced footnotes out of `available`, renumbered for display.
    ///
    /// Returned footnotes follow display order. Identifiers with no footnote in
    /// `available` are returned separately, in first-seen order.
    #[must_use]
    pub fn collect_footnotes(&self, available: &[Footnote]) -> (Vec<Footnote>, Vec<String>) {
        let mut by_number: Vec<(u32, &str)> = self
            .note_number_by_id
            .iter()
            .map(|(identifier, number)| (*number, identifier.as_str()))
            .collect();
        by_number.sort_unstable();

        let mut footnotes = Vec::with_capacity(by_number.len());
        let mut missing = Vec::new();
        for (number, identifier) in by_number {
            match available
                .iter()
                .find(|footnote| footnote.identifier == identifier)
            {
                Some(footnote) => footnotes.push(Footnote {
                    number,
                    note: self.replace_introductory_note_references(&footnote.note),
                    ..footnote.clone()
                }),
                None => missing.push(identifier.to_string()),
            }
        }
        (footnotes, missing)
    }

    fn annotate_subrule(&mut self, subrule: &SubRule) -> AnnotatedSubRule {
        AnnotatedSubRule {
            order: subrule.order,
            description: self.replace_optional(subrule.description.as_deref()),
            rule_text: self.replace_optional(subrule.rule_text.as_deref()),
            alt_rule_text: self.replace_optional(subrule.alt_rule_text.as_deref()),
        }
    }

    fn replace_optional(&mut self, text: Option<&str>) -> Option<String> {
        text.map(|text| self.replace_note_references(text))
    }

    fn number_for(&mut self, identifier: &str) -> u32 {
        self.found_note_ids.push(identifier.to_string());
        let next = u32::try_from(self.note_number_by_id.len())
            .unwrap_or(u32::MAX)
            .saturating_add(1);
        let number = *self
            .note_number_by_id
            .entry(identifier.to_string())
            .or_insert(next);
        self.cited_by_current.insert(identifier.to_string(), number);
        number
    }
}

/// Output of [`process_footnotes`] for one document.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ProcessedFootnotes {
    pub rules: Vec<AnnotatedRule>,
    pub footnotes: Vec<Footnote>,
    pub missing_identifiers: Vec<String>,
}

/// Number the markers of `rules` and gather the footnotes they cite.
#[must_use]
pub fn process_footnotes(
    patterns: &MarkerPatterns,
    style: CitationStyle,
    rules: &[LinkedRule],
    available: &[Footnote],
) -> ProcessedFootnotes {
    let mut processor = FootnoteProcessor::new(patterns, style);
    let rules: Vec<AnnotatedRule> = rules.iter().map(|rule| processor.annotate(rule)).collect();
    let (footnotes, missing_identifiers) = processor.collect_footnotes(available);

    debug_assert_eq!(
        processor.found_note_ids().iter().collect::<BTreeSet<_>>().len(),
        processor.note_number_by_id().len()
    );

    ProcessedFootnotes {
        rules,
        footnotes,
        missing_identifiers,
    }
}
