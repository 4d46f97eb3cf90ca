//! Grantflow - ETL orchestration engine for public-subsidy data
//!
//! This crate is a meta-package that re-exports the most commonly used
//! types and functions from the Grantflow ecosystem. It provides a
//! convenient way to include all the necessary functionality in your
//! project.
//!
//! # Features
//!
//! - **core**: Orchestration engine (enabled by default)
//! - **storage**: Storage contract and backends (enabled by default)
//! - **postgres**: PostgreSQL storage backend
//! - **protocol**: Live-update protocol definitions
//! - **full**: All features
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use grantflow::prelude::*;
//!
//! # async fn run() {
//! let store = Arc::new(MemoryStore::new());
//! let tracker = Arc::new(ExecutionTracker::new(store.clone()));
//! let _ = tracker.reclaim_interrupted().await;
//! # }
//! ```

// Re-exports from core
#[cfg(feature = "core")]
pub use grantflow_core::{self as core, prelude as core_prelude};

#[cfg(feature = "core")]
pub use grantflow_core::{
    broadcast, catalog, error, extract, load, orchestrate, tracker, transform, Error,
    ExecutionTracker, OrchestrateError, Orchestrator, Result, RunRequest,
};

// Re-exports from schemas
pub use grantflow_schemas as schemas;
pub use grantflow_schemas::{
    CanonicalRecord, CatalogEntry, CatalogTable, Execution, ExecutionEvent, ExecutionEventKind,
    ExecutionPhase, ExecutionSnapshot, ExecutionStatus, ExecutionType, RecordCounts, RegimeTag,
    RunOptions, SourcePage,
};

// Re-exports from storage
#[cfg(feature = "storage")]
pub use grantflow_storage::{self as storage, prelude as storage_prelude};

// Re-exports from protocol
#[cfg(feature = "protocol")]
pub use grantflow_protocol::{self as protocol, prelude as protocol_prelude};

/// Prelude module that exports commonly used types and functions.
pub mod prelude {
    #[cfg(feature = "core")]
    pub use grantflow_core::prelude::*;

    #[cfg(feature = "storage")]
    pub use grantflow_storage::prelude::*;

    #[cfg(feature = "protocol")]
    pub use grantflow_protocol::prelude::*;
}
