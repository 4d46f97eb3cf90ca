//! # Grantflow Core
//!
//! ETL orchestration and catalog-consistency engine for public-subsidy
//! data. The engine ingests concession records from several independently
//! versioned government REST sources, deduplicates them on a shared natural
//! key, and loads them idempotently while tracking every run in a
//! crash-tolerant execution state machine.
//!
//! The main components are:
//!
//! - [`extract`]: paginated source extraction with bounded retries and a
//!   closed registry of tagged source variants
//! - [`transform`] / [`load`]: raw-record mapping and idempotent dedup
//!   loading against the storage contract
//! - [`catalog`]: reference-table synchronization and the freshness gate
//!   that protects foreign-key integrity
//! - [`tracker`]: the execution state machine, sole writer of execution
//!   records and emitter of state-change events
//! - [`broadcast`]: best-effort fan-out of tracker events to subscribers
//! - [`orchestrate`]: composition of all of the above into tracked runs
//!
//! # Concurrency
//!
//! Everything runs on Tokio. Parallel source workers are bounded by the
//! configured worker count and share one execution record through the
//! tracker, which serializes counter updates. Cancellation is cooperative
//! via `CancellationToken`, observed between pages and between batches.

pub mod broadcast;
pub mod catalog;
pub mod error;
pub mod extract;
pub mod load;
pub mod orchestrate;
pub mod tracker;
pub mod transform;

/// Prelude to import all relevant models and functions
pub mod prelude {
    pub use crate::broadcast::ProgressBroadcaster;
    pub use crate::catalog::{
        CatalogError, CatalogSource, CatalogSyncEngine, CatalogSyncReport, CatalogValidator,
        HttpCatalogSource,
    };
    pub use crate::extract::{
        extract_pages, ExtractError, ExtractQuery, ExtractedPage, FetchError, HttpPageFetcher,
        PageFetcher, PageRequest, RetryPolicy, SourceKind, SourceRegistry,
    };
    pub use crate::load::{DedupLoader, LoadError, LoadOutcome};
    pub use crate::orchestrate::{OrchestrateError, Orchestrator, RunRequest};
    pub use crate::tracker::{ExecutionTracker, TrackerError};
    pub use crate::transform::{transform_record, TransformError};
    pub use crate::{Error, Result};

    pub use grantflow_schemas::{
        CanonicalRecord, CatalogEntry, CatalogTable, Execution, ExecutionEvent,
        ExecutionEventKind, ExecutionPhase, ExecutionSnapshot, ExecutionStatus, ExecutionType,
        RecordCounts, RegimeTag, RunOptions, SourcePage,
    };
}

pub use error::{Error, Result};
pub use orchestrate::{OrchestrateError, Orchestrator, RunRequest};
pub use tracker::ExecutionTracker;
