//! Commodity codes and the code ranges rules are expressed over.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::error::ResolveError;

/// Digits in a fully specified commodity code.
pub const COMMODITY_CODE_WIDTH: usize = 10;

/// A 10-digit commodity code built from nested 2-digit groups.
///
/// Trailing `00` groups mean "unspecified at this level", so `0101000000`
/// is heading 0101 and `0100000000` is chapter 01.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CommodityCode(String);

impl CommodityCode {
    /// Normalise a user supplied code.
    ///
    /// Dots and whitespace are ignored; the remaining digits must have an
    /// even length between 2 and 10 and are right-padded with zeros.
    ///
    /// # Errors
    /// Returns [`ResolveError::InvalidCommodityCode`] when the input has
    /// non-digit characters or an unsupported length.
    pub fn parse(raw: &str) -> Result<Self, ResolveError> {
        let digits: String = normalise_digits(raw);
        let invalid = |reason: &str| ResolveError::InvalidCommodityCode {
            code: raw.to_string(),
            reason: reason.to_string(),
        };

        if digits.is_empty() {
            return Err(invalid("code is empty"));
        }
        if !digits.chars().all(|ch| ch.is_ascii_digit()) {
            return Err(invalid("code must contain digits only"));
        }
        if digits.len() > COMMODITY_CODE_WIDTH || digits.len() % 2 != 0 {
            return Err(invalid("code must have an even number of digits between 2 and 10"));
        }

        Ok(Self(format!("{digits:0<width$}", width = COMMODITY_CODE_WIDTH)))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The leading `width` digits of the code.
    #[must_use]
    pub fn truncated(&self, width: usize) -> &str {
        &self.0[..width.min(COMMODITY_CODE_WIDTH)]
    }

    /// Number of digits left once trailing `00` groups are removed.
    #[must_use]
    pub fn significant_len(&self) -> usize {
        let mut len = COMMODITY_CODE_WIDTH;
        while len > 2 && &self.0[len - 2..len] == "00" {
            len -= 2;
        }
        len
    }

    /// Whether `other` lies below this code in the nomenclature.
    #[must_use]
    pub fn is_prefix_of(&self, other: &CommodityCode) -> bool {
        let len = self.significant_len();
        self.truncated(len) == other.truncated(len)
    }

    /// Codes to try, most specific first, when the exact code has no node.
    #[must_use]
    pub fn lookup_candidates(&self) -> Vec<CommodityCode> {
        let mut candidates: Vec<CommodityCode> = Vec::with_capacity(5);
        for width in [10, 8, 6, 4, 2] {
            let candidate = Self(format!(
                "{:0<pad$}",
                self.truncated(width),
                pad = COMMODITY_CODE_WIDTH
            ));
            if candidates.last() != Some(&candidate) {
                candidates.push(candidate);
            }
        }
        candidates
    }
}

impl Display for CommodityCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for CommodityCode {
    type Error = ResolveError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CommodityCode> for String {
    fn from(value: CommodityCode) -> Self {
        value.0
    }
}

/// Granularity a rule's code range is expressed at.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HsType {
    Chapter,
    Heading,
    Subheading,
    Commodity,
}

impl HsType {
    #[must_use]
    pub fn width(self) -> usize {
        match self {
            Self::Chapter => 2,
            Self::Heading => 4,
            Self::Subheading => 6,
            Self::Commodity => 8,
        }
    }

    #[must_use]
    pub fn from_width(width: usize) -> Option<Self> {
        match width {
            2 => Some(Self::Chapter),
            4 => Some(Self::Heading),
            6 => Some(Self::Subheading),
            8 => Some(Self::Commodity),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chapter => "chapter",
            Self::Heading => "heading",
            Self::Subheading => "subheading",
            Self::Commodity => "commodity",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "chapter" => Some(Self::Chapter),
            "heading" => Some(Self::Heading),
            "subheading" => Some(Self::Subheading),
            "commodity" => Some(Self::Commodity),
            _ => None,
        }
    }
}

/// Inclusive code range `[hs_from, hs_to]` at a fixed granularity.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct HsRange {
    pub hs_type: HsType,
    pub hs_from: String,
    pub hs_to: Option<String>,
}

impl HsRange {
    /// Build a range from raw endpoints, inferring the granularity from the
    /// length of `hs_from`.
    ///
    /// # Errors
    /// Returns [`ResolveError::Validation`] when an endpoint is not numeric,
    /// the endpoints differ in length or the length is not 2, 4, 6 or 8.
    pub fn new(hs_from: &str, hs_to: Option<&str>) -> Result<Self, ResolveError> {
        let from = normalise_digits(hs_from);
        let to = hs_to.map(normalise_digits).filter(|value| !value.is_empty());

        if from.is_empty() || !from.chars().all(|ch| ch.is_ascii_digit()) {
            return Err(ResolveError::Validation(format!(
                "hs_from `{hs_from}` must be numeric"
            )));
        }
        let Some(hs_type) = HsType::from_width(from.len()) else {
            return Err(ResolveError::Validation(format!(
                "unsupported hs range width {} for `{hs_from}`",
                from.len()
            )));
        };
        if let Some(to) = &to {
            if to.len() != from.len() {
                return Err(ResolveError::Validation(format!(
                    "hs_from `{from}` and hs_to `{to}` must have the same length"
                )));
            }
            if !to.chars().all(|ch| ch.is_ascii_digit()) {
                return Err(ResolveError::Validation(format!("hs_to `{to}` must be numeric")));
            }
            if to < &from {
                return Err(ResolveError::Validation(format!(
                    "hs_to `{to}` sorts before hs_from `{from}`"
                )));
            }
        }

        Ok(Self {
            hs_type,
            hs_from: from,
            hs_to: to,
        })
    }

    /// Whether `code` falls inside the range at the range's granularity.
    #[must_use]
    pub fn covers(&self, code: &CommodityCode) -> bool {
        let width = self.hs_type.width();
        let target = code.truncated(width);
        let from = fit_to_width(&self.hs_from, width);
        match &self.hs_to {
            None => target == from,
            Some(to) => from.as_str() <= target && target <= fit_to_width(to, width).as_str(),
        }
    }
}

fn normalise_digits(raw: &str) -> String {
    raw.chars()
        .filter(|ch| !ch.is_whitespace() && *ch != '.')
        .collect()
}

fn fit_to_width(code: &str, width: usize) -> String {
    if code.len() >= width {
        code[..width].to_string()
    } else {
        format!("{code:0<width$}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(raw: &str) -> CommodityCode {
        match CommodityCode::parse(raw) {
            Ok(code) => code,
            Err(err) => panic!("failed to parse {raw}: {err}"),
        }
    }

    fn range(from: &str, to: Option<&str>) -> HsRange {
        match HsRange::new(from, to) {
            Ok(range) => range,
            Err(err) => panic!("failed to build range {from}-{to:?}: {err}"),
        }
    }

    // Test IDs: CODE-001
    #[test]
    fn parse_pads_and_strips_separators() {
        assert_eq!(code("0101").as_str(), "0101000000");
        assert_eq!(code("0101.21 00").as_str(), "0101210000");
        assert_eq!(code("0123456789").as_str(), "0123456789");
    }

    // Test IDs: CODE-002
    #[test]
    fn parse_rejects_malformed_codes() {
        for raw in ["", "1", "012", "01234567890", "01a2", "  "] {
            assert!(
                matches!(
                    CommodityCode::parse(raw),
                    Err(ResolveError::InvalidCommodityCode { .. })
                ),
                "expected {raw:?} to be rejected"
            );
        }
    }

    #[test]
    fn significant_length_ignores_trailing_groups() {
        assert_eq!(code("01").significant_len(), 2);
        assert_eq!(code("0101").significant_len(), 4);
        assert_eq!(code("0101210000").significant_len(), 6);
        assert_eq!(code("0101210010").significant_len(), 10);
        assert_eq!(code("0000000000").significant_len(), 2);
    }

    #[test]
    fn prefix_relation_follows_nesting() {
        assert!(code("01").is_prefix_of(&code("0101210000")));
        assert!(code("0101").is_prefix_of(&code("0101210000")));
        assert!(!code("0102").is_prefix_of(&code("0101210000")));
    }

    #[test]
    fn lookup_candidates_walk_up_without_duplicates() {
        let candidates: Vec<String> = code("0101219900")
            .lookup_candidates()
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(
            candidates,
            vec!["0101219900", "0101210000", "0101000000", "0100000000"]
        );
    }

    // Test IDs: RANGE-001
    #[test]
    fn exact_range_matches_only_its_prefix() {
        let chapter = range("01", None);
        assert_eq!(chapter.hs_type, HsType::Chapter);
        assert!(chapter.covers(&code("0123456789")));
        assert!(!chapter.covers(&code("0223456789")));
    }

    // Test IDs: RANGE-002
    #[test]
    fn inclusive_range_matches_both_endpoints() {
        let ranged = range("012345", Some("012350"));
        assert_eq!(ranged.hs_type, HsType::Subheading);
        assert!(ranged.covers(&code("0123450000")));
        assert!(ranged.covers(&code("0123479999")));
        assert!(ranged.covers(&code("0123509999")));
        assert!(!ranged.covers(&code("0123440000")));
        assert!(!ranged.covers(&code("0123510000")));
    }

    #[test]
    fn range_accepts_dotted_endpoints() {
        let dotted = range("0101.21", Some("0101.29"));
        assert_eq!(dotted.hs_from, "010121");
        assert_eq!(dotted.hs_to.as_deref(), Some("010129"));
    }

    // Test IDs: RANGE-003
    #[test]
    fn range_validation_rejects_bad_endpoints() {
        assert!(HsRange::new("0123", Some("012345")).is_err());
        assert!(HsRange::new("012", None).is_err());
        assert!(HsRange::new("0123456789", None).is_err());
        assert!(HsRange::new("01x3", None).is_err());
        assert!(HsRange::new("0150", Some("0140")).is_err());
    }

    #[test]
    fn empty_upper_bound_is_treated_as_exact() {
        let exact = range("0101", Some(""));
        assert_eq!(exact.hs_to, None);
        assert!(exact.covers(&code("0101290000")));
        assert!(!exact.covers(&code("0102290000")));
    }
}
