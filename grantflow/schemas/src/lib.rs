//! # Grantflow Schemas
//!
//! This crate contains the schema definitions shared throughout the grantflow
//! ecosystem: execution tracking types, canonical concession records, catalog
//! entries, progress events and run options. Centralizing these types here
//! avoids circular dependencies between the core, storage and protocol crates.

pub mod catalog;
pub mod execution;
pub mod options;
pub mod progress;
pub mod records;

// Re-export the main types for convenience
pub use catalog::{CatalogEntry, CatalogTable};
pub use execution::{
    Execution, ExecutionPhase, ExecutionStatus, ExecutionType, RecordCounts, CATALOG_ENTITY,
};
pub use options::RunOptions;
pub use progress::{ExecutionEvent, ExecutionEventKind, ExecutionSnapshot};
pub use records::{CanonicalRecord, DedupKey, RegimeTag, SourcePage};
