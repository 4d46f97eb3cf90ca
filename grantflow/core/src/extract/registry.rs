//! Source registry
//!
//! The set of government sources is closed: each entity maps to a fixed list
//! of tagged source variants carrying their endpoint path and regime tag.
//! The registry is an explicit object handed to the orchestrator at
//! construction; nothing here is ambient state.

use std::collections::HashMap;

use grantflow_schemas::{ExecutionType, RegimeTag};
use url::Url;

/// The closed set of concession sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// Standard concessions endpoint
    Ordinary,
    /// De-minimis aid (10 year retention upstream)
    Minimis,
    /// State aid (10 year retention upstream)
    StateAid,
    /// Grants to political parties (special transparency regime)
    PoliticalParties,
    /// Beneficiaries above the large-grant reporting threshold
    LargeBeneficiaries,
}

impl SourceKind {
    pub const ALL: [SourceKind; 5] = [
        SourceKind::Ordinary,
        SourceKind::Minimis,
        SourceKind::StateAid,
        SourceKind::PoliticalParties,
        SourceKind::LargeBeneficiaries,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SourceKind::Ordinary => "ordinary",
            SourceKind::Minimis => "minimis",
            SourceKind::StateAid => "state_aid",
            SourceKind::PoliticalParties => "political_parties",
            SourceKind::LargeBeneficiaries => "large_beneficiaries",
        }
    }

    /// Fixed regime tag applied to every record this source yields
    pub fn regime(&self) -> RegimeTag {
        match self {
            SourceKind::Ordinary => RegimeTag::Ordinary,
            SourceKind::Minimis => RegimeTag::Minimis,
            SourceKind::StateAid => RegimeTag::StateAid,
            SourceKind::PoliticalParties => RegimeTag::PoliticalParty,
            SourceKind::LargeBeneficiaries => RegimeTag::LargeBeneficiary,
        }
    }

    /// Path of the search endpoint, relative to the API base URL
    pub fn endpoint_path(&self) -> &'static str {
        match self {
            SourceKind::Ordinary => "concessions/search",
            SourceKind::Minimis => "minimis/search",
            SourceKind::StateAid => "stateaid/search",
            SourceKind::PoliticalParties => "politicalparties/search",
            SourceKind::LargeBeneficiaries => "largebeneficiaries/search",
        }
    }

    pub fn endpoint(&self, base: &Url) -> Result<Url, url::ParseError> {
        base.join(self.endpoint_path())
    }

    pub fn from_name(name: &str) -> Option<SourceKind> {
        SourceKind::ALL.iter().copied().find(|k| k.name() == name)
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A completed execution another entity's run depends on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prerequisite {
    pub entity: String,
    pub execution_type: ExecutionType,
}

/// Registry entry for one loadable entity
#[derive(Debug, Clone)]
pub struct EntitySpec {
    pub entity: String,
    pub sources: Vec<SourceKind>,
    /// Entity whose seeding must have completed for the same year before
    /// this one may run
    pub prerequisite: Option<Prerequisite>,
}

/// Explicit registry of loadable entities, keyed by entity identifier
#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    entities: HashMap<String, EntitySpec>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard registry: the concession entity fed by all five sources
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(EntitySpec {
            entity: "concessions".to_string(),
            sources: SourceKind::ALL.to_vec(),
            prerequisite: None,
        });
        registry
    }

    pub fn register(&mut self, spec: EntitySpec) {
        self.entities.insert(spec.entity.clone(), spec);
    }

    pub fn get(&self, entity: &str) -> Option<&EntitySpec> {
        self.entities.get(entity)
    }

    /// Resolve the requested source names for an entity; an empty request
    /// selects every registered source. Returns Err with the offending name
    /// when a request names a source the entity does not have.
    pub fn select_sources(
        &self,
        entity: &str,
        requested: &[String],
    ) -> Option<Result<Vec<SourceKind>, String>> {
        let spec = self.get(entity)?;

        if requested.is_empty() {
            return Some(Ok(spec.sources.clone()));
        }

        let mut selected = Vec::with_capacity(requested.len());
        for name in requested {
            match SourceKind::from_name(name) {
                Some(kind) if spec.sources.contains(&kind) => selected.push(kind),
                _ => return Some(Err(name.clone())),
            }
        }
        Some(Ok(selected))
    }
}
