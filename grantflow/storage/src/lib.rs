//! Storage contract and backends for Grantflow
//!
//! This crate defines the [`Store`] trait implemented by every storage
//! backend, plus the backends themselves:
//!
//! - In-memory (always available, used by tests and embedded runs)
//! - PostgreSQL (with the 'postgres' feature)
//!
//! The contract mirrors the invariants the engine relies on:
//!
//! - Canonical concession rows are unique on (source id, grant date, regime
//!   tag) and inserted with ignore-on-conflict semantics
//! - Catalog tables grow monotonically: codes are inserted or refreshed,
//!   never removed
//! - Execution rows carry the full state machine fields and support
//!   active-run lookup, orphan reclamation and statistics aggregation

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use grantflow_schemas::{
    CanonicalRecord, CatalogEntry, CatalogTable, Execution, ExecutionStatus, ExecutionType,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod error;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

/// Prelude module with commonly used types and functions
pub mod prelude;

pub use error::Error;
pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

pub type Result<T> = core::result::Result<T, Error>;

/// Filter for execution listings, newest first
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionFilter {
    pub status: Option<ExecutionStatus>,
    pub execution_type: Option<ExecutionType>,
    pub entity: Option<String>,
    pub limit: Option<usize>,
}

/// Aggregate view over execution history and table sizes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub total_executions: u64,
    pub seeding_executions: u64,
    pub sync_executions: u64,
    pub catalog_sync_executions: u64,
    pub completed: u64,
    pub failed: u64,
    pub active: u64,
    pub last_successful_seeding: Option<DateTime<Utc>>,
    pub last_successful_sync: Option<DateTime<Utc>>,
    pub last_successful_catalog_sync: Option<DateTime<Utc>>,
    pub concession_count: u64,
    pub catalog_counts: HashMap<String, u64>,
}

/// Storage contract used by the orchestration engine
///
/// Implementations must be safe for concurrent use: parallel source workers
/// commit batches independently while sharing one execution row.
#[async_trait]
pub trait Store: Send + Sync {
    // -- Executions

    /// Persist a freshly created execution
    async fn insert_execution(&self, execution: &Execution) -> Result<()>;

    /// Persist the current state of an existing execution, keyed by id
    async fn update_execution(&self, execution: &Execution) -> Result<()>;

    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>>;

    /// List executions matching the filter, ordered by start time descending
    async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<Execution>>;

    /// Remove a terminal execution from history. Returns false when the id
    /// is unknown. Implementations must refuse to delete a running one.
    async fn delete_execution(&self, id: Uuid) -> Result<bool>;

    /// Find an execution that blocks a new run for the same entity/year.
    /// When `year` is None the entity is atemporal and any active execution
    /// for it matches.
    async fn find_active_execution(
        &self,
        entity: &str,
        year: Option<i32>,
    ) -> Result<Option<Execution>>;

    /// Most recent successful execution of the given type, optionally
    /// restricted to one entity
    async fn last_successful_execution(
        &self,
        execution_type: ExecutionType,
        entity: Option<&str>,
    ) -> Result<Option<Execution>>;

    /// Whether a completed execution exists for the (type, entity, year)
    /// triple. Used for prerequisite checks between entities.
    async fn has_completed_execution(
        &self,
        execution_type: ExecutionType,
        entity: &str,
        year: i32,
    ) -> Result<bool>;

    /// Reclassify every execution still marked running as interrupted.
    /// Called once on service startup; returns the number reclaimed.
    async fn reclaim_running_as_interrupted(&self, error_message: &str) -> Result<u64>;

    /// Remove terminal executions for the (entity, year) pair, keeping
    /// active ones. Returns the number removed.
    async fn prune_terminal_executions(&self, entity: &str, year: Option<i32>) -> Result<u64>;

    async fn statistics(&self) -> Result<Statistics>;

    // -- Canonical records

    /// Bulk insert with ignore-on-conflict semantics on the dedup key.
    /// Returns the number of rows actually written.
    async fn insert_ignore_concessions(&self, records: &[CanonicalRecord]) -> Result<u64>;

    async fn concession_count(&self) -> Result<u64>;

    // -- Catalogs

    /// Insert-if-absent upsert keyed by the table's natural code. An
    /// existing code's description is refreshed in place; codes are never
    /// deleted. Returns the number of new codes.
    async fn upsert_catalog_entries(
        &self,
        table: CatalogTable,
        entries: &[CatalogEntry],
    ) -> Result<u64>;

    async fn catalog_count(&self, table: CatalogTable) -> Result<u64>;
}
