//! WebSocket handler for real-time slave events

use axon_core::{MasterInfo, SlaveEvent};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::state::AppState;

/// WebSocket message types
#[derive(Serialize)]
#[serde(tag = "type", content = "data")]
enum WsMessage {
    #[serde(rename = "master_snapshot")]
    MasterSnapshot(MasterInfo),
    #[serde(rename = "slave_added")]
    SlaveAdded { master: u32, id: String },
    #[serde(rename = "slave_removed")]
    SlaveRemoved { master: u32, id: String },
    #[serde(rename = "sweep_completed")]
    SweepCompleted { master: u32, found: usize, total: usize },
    #[serde(rename = "pong")]
    Pong,
}

impl From<SlaveEvent> for WsMessage {
    fn from(event: SlaveEvent) -> Self {
        match event {
            SlaveEvent::Added { master, slave } => WsMessage::SlaveAdded {
                master,
                id: slave.name(),
            },
            SlaveEvent::Removed { master, slave } => WsMessage::SlaveRemoved {
                master,
                id: slave.name(),
            },
            SlaveEvent::SweepCompleted {
                master,
                found,
                total,
            } => WsMessage::SweepCompleted {
                master,
                found,
                total,
            },
        }
    }
}

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = state.subscribe();

    info!("WebSocket client connected");

    // Send current masters on connect
    for master in state.registry.master_infos().await {
        if let Ok(json) = serde_json::to_string(&WsMessage::MasterSnapshot(master)) {
            if sender.send(Message::Text(json.into())).await.is_err() {
                return;
            }
        }
    }

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if let Ok(json) = serde_json::to_string(&WsMessage::from(event)) {
                            if sender.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        debug!(skipped = n, "Slave event channel lagged");
                    }
                    Err(e) => {
                        debug!(error = %e, "Slave event channel error");
                        break;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        // Keepalive
                        if text.as_str() == "ping" {
                            if let Ok(pong) = serde_json::to_string(&WsMessage::Pong) {
                                if sender.send(Message::Text(pong.into())).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("WebSocket client disconnected");
}
