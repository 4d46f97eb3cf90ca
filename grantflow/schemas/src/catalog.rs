//! Reference ("catalog") table types
//!
//! Catalog rows back the foreign keys of the transactional concession table.
//! They grow monotonically: codes are only ever inserted, an existing code's
//! description may be refreshed but its identity is never removed.

use serde::{Deserialize, Serialize};

/// The fixed set of reference tables synchronized from the upstream API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogTable {
    GrantingBodies,
    Regions,
    Instruments,
    BeneficiaryTypes,
    ProductSectors,
    Purposes,
    Objectives,
    Regulations,
}

impl CatalogTable {
    pub const ALL: [CatalogTable; 8] = [
        CatalogTable::GrantingBodies,
        CatalogTable::Regions,
        CatalogTable::Instruments,
        CatalogTable::BeneficiaryTypes,
        CatalogTable::ProductSectors,
        CatalogTable::Purposes,
        CatalogTable::Objectives,
        CatalogTable::Regulations,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CatalogTable::GrantingBodies => "granting_bodies",
            CatalogTable::Regions => "regions",
            CatalogTable::Instruments => "instruments",
            CatalogTable::BeneficiaryTypes => "beneficiary_types",
            CatalogTable::ProductSectors => "product_sectors",
            CatalogTable::Purposes => "purposes",
            CatalogTable::Objectives => "objectives",
            CatalogTable::Regulations => "regulations",
        }
    }
}

impl std::fmt::Display for CatalogTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One reference/lookup row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Natural code, unique within its table
    pub code: String,
    pub description: String,
    /// Parent code or category for hierarchical catalogs
    pub parent: Option<String>,
}

impl CatalogEntry {
    pub fn new(code: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            description: description.into(),
            parent: None,
        }
    }
}
