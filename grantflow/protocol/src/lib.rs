//! Communication protocol for Grantflow
//!
//! This crate defines the messages exchanged between the live-update surface
//! and its subscribers. It includes message types for:
//!
//! - Client requests (resync, cancellation)
//! - Server pushes (execution state changes, statistics refreshes)
//!
//! The protocol is designed to work over WebSockets. Delivery of server
//! pushes is best-effort: the persisted execution record remains the sole
//! source of truth and a client can always request a full resync.

use grantflow_schemas::{ExecutionEvent, ExecutionEventKind, ExecutionSnapshot};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prelude module with commonly used types and functions
pub mod prelude;

/// Client websocket message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Full state requested by client, e.g. after a reconnect
    ResyncRequest,
    /// Execution cancellation requested by client
    CancelRequest {
        /// Execution id of the run to cancel
        execution_id: Uuid,
    },
}

/// Server websocket message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// An execution entered the running state
    ProcessStarted { snapshot: ExecutionSnapshot },
    /// Progress, phase or counter change on a running execution
    ProcessUpdate { snapshot: ExecutionSnapshot },
    /// An execution finished successfully
    ProcessCompleted { snapshot: ExecutionSnapshot },
    /// An execution failed; the snapshot carries the error text
    ProcessFailed { snapshot: ExecutionSnapshot },
    /// An execution was cancelled cooperatively
    ProcessCancelled { snapshot: ExecutionSnapshot },
    /// Aggregate statistics changed
    StatsUpdate { snapshot: ExecutionSnapshot },
    /// Full state of every active execution, answering a resync request
    ResyncSnapshot { snapshots: Vec<ExecutionSnapshot> },
}

impl From<ExecutionEvent> for ServerMessage {
    fn from(event: ExecutionEvent) -> Self {
        let snapshot = event.snapshot;
        match event.kind {
            ExecutionEventKind::ProcessStarted => ServerMessage::ProcessStarted { snapshot },
            ExecutionEventKind::ProcessUpdate => ServerMessage::ProcessUpdate { snapshot },
            ExecutionEventKind::ProcessCompleted => ServerMessage::ProcessCompleted { snapshot },
            ExecutionEventKind::ProcessFailed => ServerMessage::ProcessFailed { snapshot },
            ExecutionEventKind::ProcessCancelled => ServerMessage::ProcessCancelled { snapshot },
            ExecutionEventKind::StatsUpdate => ServerMessage::StatsUpdate { snapshot },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grantflow_schemas::{Execution, ExecutionType};

    #[test]
    fn server_messages_are_tagged_snake_case() {
        let execution = Execution::new(ExecutionType::Seeding, "concessions", Some(2024));
        let message = ServerMessage::ProcessStarted {
            snapshot: execution.snapshot(),
        };

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "process_started");
        assert_eq!(json["snapshot"]["entity"], "concessions");
    }

    #[test]
    fn client_cancel_round_trips() {
        let raw = r#"{"type": "cancel_request", "execution_id": "00000000-0000-0000-0000-000000000001"}"#;
        let message: ClientMessage = serde_json::from_str(raw).unwrap();
        assert!(matches!(message, ClientMessage::CancelRequest { .. }));
    }
}
