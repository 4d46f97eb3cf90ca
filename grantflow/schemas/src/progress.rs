//! Progress event types emitted by the execution tracker

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::execution::{ExecutionPhase, ExecutionStatus, ExecutionType, RecordCounts};

/// Point-in-time view of an execution, safe to hand to observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub execution_id: Uuid,
    pub execution_type: ExecutionType,
    pub entity: String,
    pub year: Option<i32>,
    pub status: ExecutionStatus,
    pub current_phase: Option<ExecutionPhase>,
    /// Progress percentage (0-100)
    pub progress: u8,
    pub counts: RecordCounts,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub elapsed_seconds: i64,
    pub current_operation: Option<String>,
    pub error_message: Option<String>,
}

/// Kind of state change an [`ExecutionEvent`] reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionEventKind {
    ProcessStarted,
    ProcessUpdate,
    ProcessCompleted,
    ProcessFailed,
    ProcessCancelled,
    StatsUpdate,
}

/// State-change message fanned out to live subscribers
///
/// Delivery is best-effort: the persisted execution record is the sole
/// source of truth and a subscriber may always request a full resync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub kind: ExecutionEventKind,
    pub snapshot: ExecutionSnapshot,
}

impl ExecutionEvent {
    pub fn new(kind: ExecutionEventKind, snapshot: ExecutionSnapshot) -> Self {
        Self { kind, snapshot }
    }
}
