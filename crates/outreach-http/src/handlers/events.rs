use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::StreamExt;
use tracing::{debug, warn};

use outreach_core::status::StatusEvent;

use crate::router::AppState;

/// Push channel: the current snapshot, then every status event as JSON text.
pub async fn subscribe(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| forward_events(socket, state))
}

async fn forward_events(mut socket: WebSocket, state: Arc<AppState>) {
    let mut events = Box::pin(state.session.status().subscribe_stream());
    debug!(
        subscribers = state.session.status().subscriber_count(),
        "event subscriber connected"
    );

    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else { break; };
                let text = match encode(&event) {
                    Ok(t) => t,
                    Err(e) => {
                        warn!(error = %e, "failed to encode status event");
                        continue;
                    }
                };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                // Inbound messages carry no commands.
                Some(Ok(_)) => {}
            },
        }
    }
    debug!("event subscriber disconnected");
}

fn encode(event: &StatusEvent) -> serde_json::Result<String> {
    serde_json::to_string(event)
}
