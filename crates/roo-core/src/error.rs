use crate::hierarchy::{Region, TreeId};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ResolveError {
    #[error("invalid commodity code `{code}`: {reason}")]
    InvalidCommodityCode { code: String, reason: String },
    #[error("country not found: {0}")]
    CountryNotFound(String),
    #[error("commodity code {code} not found in nomenclature tree {tree_id}")]
    CommodityNotFound { code: String, tree_id: TreeId },
    #[error("no active nomenclature tree for region {0}")]
    NoActiveTree(Region),
    #[error("missing introductory notes (COMM) in rules document `{document}` for country {country}")]
    MissingIntroductoryNotes { document: String, country: String },
    #[error(
        "rules document `{document}` references missing footnotes [{identifiers}] \
         (country {country}, commodity {commodity_code})"
    )]
    MissingFootnote {
        document: String,
        country: String,
        commodity_code: String,
        identifiers: String,
    },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("rules source error: {0}")]
    Source(String),
}

impl ResolveError {
    /// Lookup failures: the caller asked for something the dataset does not hold.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::CountryNotFound(_) | Self::CommodityNotFound { .. } | Self::NoActiveTree(_)
        )
    }

    /// The dataset itself is inconsistent.
    #[must_use]
    pub fn is_data_integrity(&self) -> bool {
        matches!(
            self,
            Self::MissingIntroductoryNotes { .. } | Self::MissingFootnote { .. } | Self::Source(_)
        )
    }
}
