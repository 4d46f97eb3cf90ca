//! Canonical concession records and the dedup key

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Classification distinguishing otherwise-identical source identifiers
/// reported by different government endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RegimeTag {
    Ordinary,
    Minimis,
    StateAid,
    PoliticalParty,
    LargeBeneficiary,
    Unknown,
}

impl RegimeTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegimeTag::Ordinary => "ordinary",
            RegimeTag::Minimis => "minimis",
            RegimeTag::StateAid => "state-aid",
            RegimeTag::PoliticalParty => "political-party",
            RegimeTag::LargeBeneficiary => "large-beneficiary",
            RegimeTag::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for RegimeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Composite natural key enforced unique at the storage layer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DedupKey {
    pub source_id: String,
    pub grant_date: NaiveDate,
    pub regime: RegimeTag,
}

/// The deduplicated transactional entity ("concession")
///
/// Append/upsert-only: rows are never updated or deleted by the core. The
/// same underlying grant may legitimately appear once per regime tag when
/// distinct sources report it under different regimes, but never twice under
/// the same tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    /// Identifier assigned by the upstream source
    pub source_id: String,
    pub grant_date: NaiveDate,
    pub regime: RegimeTag,
    pub beneficiary: String,
    /// Reference to the call for proposals the grant was awarded under
    pub call_reference: Option<String>,
    pub amount: f64,
    pub instrument: Option<String>,
}

impl CanonicalRecord {
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            source_id: self.source_id.clone(),
            grant_date: self.grant_date,
            regime: self.regime,
        }
    }
}

/// One page returned by a paginated government endpoint
///
/// `total_elements` is reported by the source and governs extraction loop
/// termination together with short pages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourcePage {
    #[serde(default)]
    pub content: Vec<serde_json::Value>,
    #[serde(rename = "totalElements", default)]
    pub total_elements: u64,
}
