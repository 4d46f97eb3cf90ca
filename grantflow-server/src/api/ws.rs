//! Live-update WebSocket endpoint
//!
//! A plain consumer of the progress broadcaster: every connection gets its
//! own subscription plus an initial resync snapshot. Delivery is
//! best-effort; a lagging connection receives a fresh snapshot instead of
//! the dropped events, and clients can request one at any time.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::any,
    Router,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use grantflow_protocol::{ClientMessage, ServerMessage};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::ApiContextRef;

pub fn router() -> Router<ApiContextRef> {
    Router::new().route("/", any(ws_handler))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(context): State<ApiContextRef>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, context))
}

async fn handle_socket(socket: WebSocket, context: ApiContextRef) {
    info!("WebSocket subscriber connected");
    let (mut sink, mut stream) = socket.split();
    let mut events = context.broadcaster.subscribe();

    // start every subscriber from a consistent full snapshot
    if send_resync(&mut sink, &context).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if send_message(&mut sink, &ServerMessage::from(event)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Subscriber lagged behind, resyncing from storage");
                    if send_resync(&mut sink, &context).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Closed) => break,
            },
            incoming = next_client_message(&mut stream) => match incoming {
                Some(message) => {
                    if handle_client_message(message, &context, &mut sink).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    info!("WebSocket subscriber disconnected");
}

/// Read frames until a parseable client message, a close, or an error
async fn next_client_message(stream: &mut SplitStream<WebSocket>) -> Option<ClientMessage> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str(text.as_str()) {
                Ok(message) => return Some(message),
                Err(error) => {
                    debug!(%error, "Ignoring unparseable client message");
                }
            },
            Some(Ok(Message::Close(_))) | None => return None,
            Some(Ok(_)) => {}
            Some(Err(error)) => {
                debug!(%error, "WebSocket receive error");
                return None;
            }
        }
    }
}

async fn handle_client_message(
    message: ClientMessage,
    context: &ApiContextRef,
    sink: &mut SplitSink<WebSocket, Message>,
) -> Result<(), axum::Error> {
    match message {
        ClientMessage::ResyncRequest => send_resync(sink, context).await,
        ClientMessage::CancelRequest { execution_id } => {
            context.orchestrator.cancel(execution_id).await;
            Ok(())
        }
    }
}

async fn send_resync(
    sink: &mut SplitSink<WebSocket, Message>,
    context: &ApiContextRef,
) -> Result<(), axum::Error> {
    match context.broadcaster.resync_snapshots().await {
        Ok(snapshots) => send_message(sink, &ServerMessage::ResyncSnapshot { snapshots }).await,
        Err(error) => {
            warn!(%error, "Failed to build resync snapshot");
            Ok(())
        }
    }
}

async fn send_message(
    sink: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> Result<(), axum::Error> {
    let Ok(json) = serde_json::to_string(message) else {
        warn!("Failed to serialize server message");
        return Ok(());
    };
    sink.send(Message::Text(json.into())).await
}
