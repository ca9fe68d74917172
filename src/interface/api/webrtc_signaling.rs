/// WebSocket transport for browser signaling clients
///
/// One connection is one session. Outbound messages go through an unbounded
/// queue drained by a writer task; inbound text frames are decoded and handed
/// to the relay router in order of receipt.
use crate::application::RelayRouter;
use crate::domain::shared::value_objects::SessionId;
use crate::domain::signaling::SignalingMessage;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{sink::SinkExt, stream::StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Create signaling router
pub fn signaling_router(relay: Arc<RelayRouter>) -> Router {
    Router::new()
        .route("/ws", get(websocket_handler))
        .with_state(relay)
}

/// WebSocket handler for signaling
async fn websocket_handler(ws: WebSocketUpgrade, State(relay): State<Arc<RelayRouter>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, relay))
}

/// Decode one text frame; malformed frames are dropped
fn decode(session_id: SessionId, text: &str) -> Option<SignalingMessage> {
    match serde_json::from_str(text) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!("Dropping malformed frame from session {}: {}", session_id, e);
            None
        }
    }
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, relay: Arc<RelayRouter>) {
    let session_id = SessionId::new();
    info!("Signaling connection established for session {}", session_id);

    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<SignalingMessage>();

    if let Err(e) = relay.on_connect(session_id, Arc::new(tx)).await {
        error!("Failed to register session {}: {}", session_id, e);
        return;
    }

    // Task to send messages to this client
    let mut send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let json = match serde_json::to_string(&message) {
                Ok(j) => j,
                Err(e) => {
                    error!("Failed to serialize message: {}", e);
                    continue;
                }
            };

            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    // Task to receive messages from this client
    let relay_clone = relay.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(Message::Text(text)) => {
                    debug!("Received frame from session {}: {}", session_id, text);
                    if let Some(message) = decode(session_id, &text) {
                        relay_clone.on_inbound_message(session_id, message).await;
                    }
                }
                Ok(Message::Close(_)) => {
                    info!("WebSocket closed by session {}", session_id);
                    break;
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                Ok(Message::Binary(_)) => {
                    warn!("Ignoring binary frame from session {}", session_id);
                }
                Err(e) => {
                    error!("WebSocket error for session {}: {}", session_id, e);
                    break;
                }
            }
        }
    });

    // Wait for either task to finish
    let writer_done = tokio::select! {
        _ = &mut send_task => {
            debug!("Send task finished for session {}", session_id);
            // Not aborted: an inbound offer may still be mid-allocation
            let _ = (&mut recv_task).await;
            true
        }
        _ = &mut recv_task => {
            debug!("Receive task finished for session {}", session_id);
            false
        }
    };

    relay.on_disconnect(session_id).await;
    // The router dropped our transport; the writer flushes what is queued and ends
    if !writer_done {
        let _ = send_task.await;
    }
    info!("Signaling connection closed for session {}", session_id);
}
