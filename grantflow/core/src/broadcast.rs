//! Progress broadcaster
//!
//! Fans tracker state-change events out to live subscribers. Nothing here
//! persists anything: delivery is best-effort over a broadcast channel, and
//! a subscriber that lagged or reconnected asks for a resync snapshot built
//! from storage, which stays the single source of truth.

use std::sync::Arc;

use grantflow_schemas::{ExecutionEvent, ExecutionSnapshot, ExecutionStatus};
use grantflow_storage::{ExecutionFilter, Store};
use tokio::sync::broadcast;

use crate::tracker::ExecutionTracker;

/// Channel consumer side of the tracker's event stream
pub struct ProgressBroadcaster {
    tracker: Arc<ExecutionTracker>,
    store: Arc<dyn Store>,
}

impl ProgressBroadcaster {
    pub fn new(tracker: Arc<ExecutionTracker>, store: Arc<dyn Store>) -> Self {
        Self { tracker, store }
    }

    /// Subscribe to live state-change events
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.tracker.subscribe()
    }

    /// Full snapshots of every active execution, for subscribers that
    /// (re)connected or lagged behind the live stream
    pub async fn resync_snapshots(
        &self,
    ) -> Result<Vec<ExecutionSnapshot>, grantflow_storage::Error> {
        let running = self
            .store
            .list_executions(&ExecutionFilter {
                status: Some(ExecutionStatus::Running),
                ..Default::default()
            })
            .await?;

        Ok(running.iter().map(|e| e.snapshot()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grantflow_schemas::{ExecutionEventKind, ExecutionType};
    use grantflow_storage::MemoryStore;

    #[tokio::test]
    async fn events_fan_out_to_every_subscriber() {
        let store = Arc::new(MemoryStore::new());
        let tracker = Arc::new(ExecutionTracker::new(store.clone()));
        let broadcaster = ProgressBroadcaster::new(tracker.clone(), store);

        let mut first = broadcaster.subscribe();
        let mut second = broadcaster.subscribe();

        let execution = tracker
            .create(ExecutionType::Seeding, "concessions", Some(2024), "seeding")
            .await
            .unwrap();
        tracker.begin(execution.id).await.unwrap();

        let event_a = first.recv().await.unwrap();
        let event_b = second.recv().await.unwrap();
        assert_eq!(event_a.kind, ExecutionEventKind::ProcessStarted);
        assert_eq!(event_b.kind, ExecutionEventKind::ProcessStarted);
        assert_eq!(event_a.snapshot.execution_id, execution.id);
    }

    #[tokio::test]
    async fn resync_lists_running_executions_only() {
        let store = Arc::new(MemoryStore::new());
        let tracker = Arc::new(ExecutionTracker::new(store.clone()));
        let broadcaster = ProgressBroadcaster::new(tracker.clone(), store);

        let running = tracker
            .create(ExecutionType::Seeding, "concessions", Some(2024), "seeding")
            .await
            .unwrap();
        tracker.begin(running.id).await.unwrap();

        let finished = tracker
            .create(ExecutionType::Seeding, "concessions", Some(2023), "seeding")
            .await
            .unwrap();
        tracker.begin(finished.id).await.unwrap();
        tracker.complete(finished.id).await.unwrap();

        let snapshots = broadcaster.resync_snapshots().await.unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].execution_id, running.id);
    }
}
