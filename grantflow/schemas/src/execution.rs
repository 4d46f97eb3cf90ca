//! Execution tracking types
//!
//! An [`Execution`] is one tracked run of a seeding, sync or catalog-sync
//! operation. Executions are created once, mutated only through the tracker
//! in `grantflow-core`, and terminated exactly once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::progress::ExecutionSnapshot;

/// Entity name used for catalog-sync executions, which are atemporal
pub const CATALOG_ENTITY: &str = "catalogs";

/// The kind of run an execution represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionType {
    /// Initial bulk load of one (entity, year) pair
    Seeding,
    /// Incremental update over a recent date window
    Sync,
    /// Refresh of the reference catalog tables
    SyncCatalogs,
}

impl ExecutionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionType::Seeding => "seeding",
            ExecutionType::Sync => "sync",
            ExecutionType::SyncCatalogs => "sync_catalogs",
        }
    }
}

/// Lifecycle states of an execution
///
/// Valid transitions: `pending → running → {completed, failed, cancelled,
/// interrupted}`. Terminal executions can additionally be relabeled
/// `replaced` when a retry supersedes them; `replaced` itself is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    /// Detected orphan: the owning process died while the execution was
    /// still marked running
    Interrupted,
    /// Superseded by a newer execution that references this one as its
    /// predecessor
    Replaced,
}

impl ExecutionStatus {
    /// Whether this status ends the lifecycle of the execution
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Cancelled
                | ExecutionStatus::Interrupted
                | ExecutionStatus::Replaced
        )
    }

    /// Whether an execution in this status blocks a new run for the same
    /// (entity, year) pair
    pub fn is_active(&self) -> bool {
        matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
    }

    /// Validity of a state machine transition
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        match (self, next) {
            (Pending, Running) => true,
            (Running, Completed) | (Running, Failed) | (Running, Cancelled) => true,
            (Running, Interrupted) => true,
            // retry relabels any terminal state except replaced itself
            (Completed, Replaced)
            | (Failed, Replaced)
            | (Cancelled, Replaced)
            | (Interrupted, Replaced) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::Interrupted => "interrupted",
            ExecutionStatus::Replaced => "replaced",
        }
    }
}

/// Coarse phase of a running execution, surfaced to observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    Extracting,
    Transforming,
    Loading,
    Validating,
}

impl ExecutionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionPhase::Extracting => "extracting",
            ExecutionPhase::Transforming => "transforming",
            ExecutionPhase::Loading => "loading",
            ExecutionPhase::Validating => "validating",
        }
    }
}

/// Record counters accumulated over the lifetime of an execution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordCounts {
    pub processed: u64,
    pub inserted: u64,
    pub updated: u64,
    pub failed: u64,
}

impl RecordCounts {
    /// Add another set of counters onto this one
    pub fn merge(&mut self, other: &RecordCounts) {
        self.processed += other.processed;
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.failed += other.failed;
    }
}

/// One tracked run of a seeding, sync or catalog-sync operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub execution_type: ExecutionType,
    pub entity: String,
    /// None for atemporal entities such as the catalogs
    pub year: Option<i32>,
    pub status: ExecutionStatus,
    pub current_phase: Option<ExecutionPhase>,
    /// 0-100, monotone while running, pinned at 100 only on completion
    pub progress_percentage: u8,
    pub counts: RecordCounts,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Label of the code path that drives this run
    pub entrypoint: String,
    /// Free-text description of the operation in flight
    pub current_operation: Option<String>,
    pub error_message: Option<String>,
    /// Previous execution this run supersedes (set on retries)
    pub predecessor: Option<Uuid>,
}

impl Execution {
    /// Create a fresh pending execution
    pub fn new(execution_type: ExecutionType, entity: impl Into<String>, year: Option<i32>) -> Self {
        Self {
            id: Uuid::new_v4(),
            execution_type,
            entity: entity.into(),
            year,
            status: ExecutionStatus::Pending,
            current_phase: None,
            progress_percentage: 0,
            counts: RecordCounts::default(),
            started_at: Utc::now(),
            finished_at: None,
            entrypoint: String::new(),
            current_operation: None,
            error_message: None,
            predecessor: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Seconds since start, up to `finished_at` for terminal executions
    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> i64 {
        let end = self.finished_at.unwrap_or(now);
        (end - self.started_at).num_seconds().max(0)
    }

    /// Point-in-time view for observers
    pub fn snapshot(&self) -> ExecutionSnapshot {
        ExecutionSnapshot {
            execution_id: self.id,
            execution_type: self.execution_type,
            entity: self.entity.clone(),
            year: self.year,
            status: self.status,
            current_phase: self.current_phase,
            progress: self.progress_percentage,
            counts: self.counts,
            started_at: self.started_at,
            finished_at: self.finished_at,
            elapsed_seconds: self.elapsed_seconds(Utc::now()),
            current_operation: self.current_operation.clone(),
            error_message: self.error_message.clone(),
        }
    }
}
