//! Execution tracker
//!
//! Owns every mutation of execution records. All writers go through one
//! tracker instance, which serializes read-modify-write cycles so that
//! parallel source workers sharing an execution never lose updates, keeps
//! progress monotone while running, and emits a state-change event for every
//! mutation.

use std::sync::Arc;

use chrono::Utc;
use grantflow_schemas::{
    Execution, ExecutionEvent, ExecutionEventKind, ExecutionPhase, ExecutionStatus, ExecutionType,
    RecordCounts,
};
use grantflow_storage::Store;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, instrument};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("execution not found: {0}")]
    NotFound(Uuid),

    #[error("invalid transition {from:?} -> {to:?} for execution {id}")]
    InvalidTransition {
        id: Uuid,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error(transparent)]
    Storage(#[from] grantflow_storage::Error),
}

/// Persists and mutates the state of executions, broadcasting each change
pub struct ExecutionTracker {
    store: Arc<dyn Store>,
    events: broadcast::Sender<ExecutionEvent>,
    // serializes read-modify-write cycles across concurrent workers
    update_lock: Mutex<()>,
}

impl ExecutionTracker {
    pub fn new(store: Arc<dyn Store>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            store,
            events,
            update_lock: Mutex::new(()),
        }
    }

    /// Subscribe to state-change events. Best-effort: lagging receivers drop
    /// messages and should resync from storage.
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, kind: ExecutionEventKind, execution: &Execution) {
        let _ = self
            .events
            .send(ExecutionEvent::new(kind, execution.snapshot()));
    }

    async fn load(&self, id: Uuid) -> Result<Execution, TrackerError> {
        self.store
            .get_execution(id)
            .await?
            .ok_or(TrackerError::NotFound(id))
    }

    /// Create a fresh pending execution
    #[instrument(skip(self))]
    pub async fn create(
        &self,
        execution_type: ExecutionType,
        entity: &str,
        year: Option<i32>,
        entrypoint: &str,
    ) -> Result<Execution, TrackerError> {
        let mut execution = Execution::new(execution_type, entity, year);
        execution.entrypoint = entrypoint.to_string();
        self.store.insert_execution(&execution).await?;
        debug!(execution_id = %execution.id, "Created execution");
        Ok(execution)
    }

    /// Transition pending -> running
    #[instrument(skip(self))]
    pub async fn begin(&self, id: Uuid) -> Result<Execution, TrackerError> {
        let _guard = self.update_lock.lock().await;
        let mut execution = self.load(id).await?;

        if !execution.status.can_transition_to(ExecutionStatus::Running) {
            return Err(TrackerError::InvalidTransition {
                id,
                from: execution.status,
                to: ExecutionStatus::Running,
            });
        }

        execution.status = ExecutionStatus::Running;
        execution.started_at = Utc::now();
        self.store.update_execution(&execution).await?;

        info!(execution_id = %id, entity = %execution.entity, "Execution started");
        self.emit(ExecutionEventKind::ProcessStarted, &execution);
        Ok(execution)
    }

    /// Set the coarse phase and optionally the operation text.
    /// A no-op when the execution already left the running state.
    pub async fn set_phase(
        &self,
        id: Uuid,
        phase: ExecutionPhase,
        operation: Option<&str>,
    ) -> Result<(), TrackerError> {
        let _guard = self.update_lock.lock().await;
        let mut execution = self.load(id).await?;
        if execution.status != ExecutionStatus::Running {
            return Ok(());
        }

        execution.current_phase = Some(phase);
        if let Some(operation) = operation {
            execution.current_operation = Some(operation.to_string());
        }
        self.store.update_execution(&execution).await?;
        self.emit(ExecutionEventKind::ProcessUpdate, &execution);
        Ok(())
    }

    /// Accumulate record counters and advance progress.
    ///
    /// Progress is clamped monotone and capped at 99 while running; only
    /// completion pins it to 100. A no-op on non-running executions, so late
    /// updates racing a cancellation are discarded rather than resurrected.
    pub async fn record_progress(
        &self,
        id: Uuid,
        counts_delta: RecordCounts,
        progress: Option<u8>,
        operation: Option<&str>,
    ) -> Result<(), TrackerError> {
        let _guard = self.update_lock.lock().await;
        let mut execution = self.load(id).await?;
        if execution.status != ExecutionStatus::Running {
            return Ok(());
        }

        execution.counts.merge(&counts_delta);
        if let Some(progress) = progress {
            execution.progress_percentage = execution.progress_percentage.max(progress.min(99));
        }
        if let Some(operation) = operation {
            execution.current_operation = Some(operation.to_string());
        }
        self.store.update_execution(&execution).await?;
        self.emit(ExecutionEventKind::ProcessUpdate, &execution);
        Ok(())
    }

    async fn finish(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        error_message: Option<String>,
        kind: ExecutionEventKind,
    ) -> Result<Execution, TrackerError> {
        let _guard = self.update_lock.lock().await;
        let mut execution = self.load(id).await?;

        if !execution.status.can_transition_to(status) {
            return Err(TrackerError::InvalidTransition {
                id,
                from: execution.status,
                to: status,
            });
        }

        execution.status = status;
        execution.finished_at = Some(Utc::now());
        execution.error_message = error_message;
        if status == ExecutionStatus::Completed {
            execution.progress_percentage = 100;
        }
        self.store.update_execution(&execution).await?;

        info!(execution_id = %id, status = status.as_str(), "Execution finished");
        self.emit(kind, &execution);
        self.emit(ExecutionEventKind::StatsUpdate, &execution);
        Ok(execution)
    }

    /// Transition running -> completed, pinning progress to 100
    pub async fn complete(&self, id: Uuid) -> Result<Execution, TrackerError> {
        self.finish(
            id,
            ExecutionStatus::Completed,
            None,
            ExecutionEventKind::ProcessCompleted,
        )
        .await
    }

    /// Transition running -> failed with the recorded error text
    pub async fn fail(&self, id: Uuid, error_message: &str) -> Result<Execution, TrackerError> {
        self.finish(
            id,
            ExecutionStatus::Failed,
            Some(error_message.to_string()),
            ExecutionEventKind::ProcessFailed,
        )
        .await
    }

    /// Transition running -> cancelled; partial data stays committed
    pub async fn cancel(&self, id: Uuid) -> Result<Execution, TrackerError> {
        self.finish(
            id,
            ExecutionStatus::Cancelled,
            None,
            ExecutionEventKind::ProcessCancelled,
        )
        .await
    }

    /// Create the successor of a terminal execution: the old one is
    /// relabeled replaced, the new one starts pending with a predecessor
    /// link. History is never mutated beyond the relabel.
    #[instrument(skip(self))]
    pub async fn begin_retry(&self, predecessor_id: Uuid) -> Result<Execution, TrackerError> {
        let _guard = self.update_lock.lock().await;
        let mut old = self.load(predecessor_id).await?;

        if !old.status.can_transition_to(ExecutionStatus::Replaced) {
            return Err(TrackerError::InvalidTransition {
                id: predecessor_id,
                from: old.status,
                to: ExecutionStatus::Replaced,
            });
        }

        old.status = ExecutionStatus::Replaced;
        self.store.update_execution(&old).await?;

        let mut successor = Execution::new(old.execution_type, old.entity.clone(), old.year);
        successor.entrypoint = old.entrypoint.clone();
        successor.predecessor = Some(old.id);
        self.store.insert_execution(&successor).await?;

        info!(
            execution_id = %successor.id,
            predecessor = %old.id,
            "Created retry execution"
        );
        self.emit(ExecutionEventKind::StatsUpdate, &successor);
        Ok(successor)
    }

    /// Reclassify orphaned running executions after a restart
    pub async fn reclaim_interrupted(&self) -> Result<u64, TrackerError> {
        let reclaimed = self
            .store
            .reclaim_running_as_interrupted("interrupted by service restart")
            .await?;
        if reclaimed > 0 {
            info!(reclaimed, "Marked orphaned executions as interrupted");
        }
        Ok(reclaimed)
    }

    pub async fn get(&self, id: Uuid) -> Result<Execution, TrackerError> {
        self.load(id).await
    }
}
