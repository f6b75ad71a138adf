//! Realtime hub (C9): WebSocket snapshot + delta fan-out.
//!
//! Grounded on `packages/uwb-simulator/src/main.rs::handle_ws` — plain
//! `axum::extract::ws` plus a `tokio::sync::broadcast` channel relayed
//! through `select!` — preferred over the teacher's socketioxide surface
//! since spec.md calls for generic WebSocket semantics, not Socket.IO.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use crate::core::Core;
use crate::model::{Address, CoverState};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    State { address: Address, value: Value },
    CoverState { address: Address, state: CoverState },
    TempValue { address: Address, sensor_id: u8, value: f64 },
    HumidityValue { address: Address, sensor_id: u8, value: f64 },
    IlluminanceValue { address: Address, sensor_id: u8, value: f64 },
    Devices,
    CoverGroups,
}

#[derive(Clone)]
pub struct RealtimeHub {
    sender: broadcast::Sender<Event>,
}

impl RealtimeHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Broadcasts at-least-once; clients must tolerate duplicates (spec §5).
    pub fn broadcast(&self, event: Event) {
        let _ = self.sender.send(event);
    }
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(core): State<Arc<Core>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, core))
}

async fn handle_ws(mut socket: WebSocket, core: Arc<Core>) {
    let snapshot = core.snapshot().await;
    if let Ok(text) = serde_json::to_string(&snapshot) {
        if socket.send(Message::Text(text)).await.is_err() {
            return;
        }
    }

    let mut events = core.realtime.subscribe();

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if let Ok(text) = serde_json::to_string(&event) {
                            if socket.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("realtime: client lagged, skipped {skipped} events");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        core.handle_ws_command(&text).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_without_subscribers_does_not_panic() {
        let hub = RealtimeHub::new();
        hub.broadcast(Event::Devices);
    }

    #[tokio::test]
    async fn subscriber_receives_broadcast_event() {
        let hub = RealtimeHub::new();
        let mut rx = hub.subscribe();
        hub.broadcast(Event::Devices);
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, Event::Devices));
    }
}
