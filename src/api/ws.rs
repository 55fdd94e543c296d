// WebSocket push stream of coordinator events. Subscribers see only events
// appended after they connect; a subscriber that falls behind the broadcast
// buffer loses the lagged messages rather than stalling producers.

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::Response,
};
use futures::{sink::SinkExt, stream::StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

use crate::app_state::AppState;

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: AppState, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = state.coordinator.subscribe_events();

    info!("WebSocket subscriber connected");

    let forward = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let payload = match serde_json::to_string(&event) {
                        Ok(payload) => payload,
                        Err(e) => {
                            debug!("Failed to serialize event for ws: {}", e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(payload.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!("WebSocket subscriber lagged, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    // Drain client messages; the stream is push-only apart from pings
    while let Some(result) = receiver.next().await {
        match result {
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(other) => debug!("Ignoring inbound ws message: {:?}", other),
        }
    }

    forward.abort();
    info!("WebSocket subscriber disconnected");
}
