//! WebSocket broadcast hub: client registry, hello/sync/heartbeat frames,
//! and serialize-once event fan-out.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{RwLock, broadcast};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use termdeck_core::types::{TerminalEvent, format_ts};

use crate::ring::RingLog;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

pub type SharedRing = Arc<RwLock<RingLog>>;
type Registry = Arc<RwLock<HashMap<Uuid, ClientRegistration>>>;

/// One connected client. Created on accept, dropped on socket close,
/// cleanly or not.
#[derive(Debug, Clone)]
pub struct ClientRegistration {
    pub client_id: Uuid,
    pub connected_at: DateTime<Utc>,
    pub last_event_id: Option<String>,
    pub last_event_timestamp: Option<DateTime<Utc>>,
}

/// Compose one wire frame: `{type, payload, timestamp}`.
pub fn make_frame(kind: &str, payload: Value) -> String {
    json!({
        "type": kind,
        "payload": payload,
        "timestamp": format_ts(Utc::now()),
    })
    .to_string()
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cheap handle for emitting frames to every open connection. Frames are
/// serialized once; each client task forwards the shared string.
#[derive(Clone)]
pub struct HubHandle {
    frame_tx: broadcast::Sender<Arc<String>>,
    registry: Registry,
}

impl HubHandle {
    /// Broadcast a terminal event as an `event` frame.
    pub fn broadcast_event(&self, event: &TerminalEvent) {
        self.broadcast_raw("event", json!({ "event": event }));
    }

    /// Broadcast an arbitrary envelope (`cost_update`, `session_update`,
    /// `session_start`, `stream_event`, `stream_error`,
    /// `recovery_warning`, ...).
    pub fn broadcast_raw(&self, kind: &str, payload: Value) {
        let frame = Arc::new(make_frame(kind, payload));
        // Send errors just mean no client is connected right now.
        let _ = self.frame_tx.send(frame);
    }

    pub async fn client_count(&self) -> usize {
        self.registry.read().await.len()
    }

    pub async fn clients(&self) -> Vec<ClientRegistration> {
        self.registry.read().await.values().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

/// WebSocket server owning the client registry.
pub struct Hub {
    addr: SocketAddr,
    ring: SharedRing,
    registry: Registry,
    frame_tx: broadcast::Sender<Arc<String>>,
    sync_on_connect: bool,
    cancel: CancellationToken,
}

impl Hub {
    pub fn new(
        addr: SocketAddr,
        ring: SharedRing,
        sync_on_connect: bool,
        cancel: CancellationToken,
    ) -> Self {
        let (frame_tx, _) = broadcast::channel(256);
        Self {
            addr,
            ring,
            registry: Arc::new(RwLock::new(HashMap::new())),
            frame_tx,
            sync_on_connect,
            cancel,
        }
    }

    pub fn handle(&self) -> HubHandle {
        HubHandle {
            frame_tx: self.frame_tx.clone(),
            registry: Arc::clone(&self.registry),
        }
    }

    /// Bind and serve until cancelled.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        tracing::info!(addr = %self.addr, "hub listening");
        self.accept_loop(listener).await
    }

    /// Accept loop over an already-bound listener (tests bind port 0).
    pub async fn accept_loop(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            tracing::debug!(peer = %peer, "hub: TCP connection accepted");
                            let ring = Arc::clone(&self.ring);
                            let registry = Arc::clone(&self.registry);
                            let frame_rx = self.frame_tx.subscribe();
                            let sync_on_connect = self.sync_on_connect;
                            let cancel = self.cancel.clone();
                            tokio::spawn(async move {
                                match tokio_tungstenite::accept_async(stream).await {
                                    Ok(ws_stream) => {
                                        handle_client(
                                            ws_stream,
                                            ring,
                                            registry,
                                            frame_rx,
                                            sync_on_connect,
                                            cancel,
                                        )
                                        .await;
                                    }
                                    Err(e) => {
                                        tracing::debug!(peer = %peer, error = %e, "hub: handshake failed");
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "hub: TCP accept failed");
                        }
                    }
                }
                _ = self.cancel.cancelled() => {
                    tracing::info!("hub: cancellation requested, shutting down");
                    break;
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Per-client handler
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ClientFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Deserialize)]
struct SyncRequestPayload {
    #[serde(default)]
    since: Option<String>,
    #[serde(default, rename = "lastEventId")]
    last_event_id: Option<String>,
}

async fn handle_client(
    ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
    ring: SharedRing,
    registry: Registry,
    mut frame_rx: broadcast::Receiver<Arc<String>>,
    sync_on_connect: bool,
    cancel: CancellationToken,
) {
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let client_id = Uuid::new_v4();
    registry.write().await.insert(
        client_id,
        ClientRegistration {
            client_id,
            connected_at: Utc::now(),
            last_event_id: None,
            last_event_timestamp: None,
        },
    );
    tracing::debug!(client_id = %client_id, "hub: client connected");

    let hello = make_frame(
        "connected",
        json!({ "clientId": client_id, "serverTime": format_ts(Utc::now()) }),
    );
    if ws_tx.send(Message::Text(hello.into())).await.is_err() {
        registry.write().await.remove(&client_id);
        return;
    }

    // First-connect resume: hand over the buffered ring so a fresh client
    // starts with history without asking for it.
    if sync_on_connect {
        let events = ring.read().await.get_all();
        if !events.is_empty() {
            let frame = make_frame(
                "sync",
                json!({
                    "clientId": client_id,
                    "events": events,
                    "timestamp": format_ts(Utc::now()),
                }),
            );
            if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                registry.write().await.remove(&client_id);
                return;
            }
        }
    }

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.tick().await; // first tick completes immediately

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        tracing::debug!(client_id = %client_id, error = %e, "hub: read error, dropping client");
                        break;
                    }
                    None => break,
                };

                let text = match msg {
                    Message::Text(t) => t,
                    Message::Close(_) => break,
                    Message::Ping(data) => {
                        if ws_tx.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    _ => continue,
                };

                let reply = handle_client_message(
                    &text,
                    client_id,
                    &ring,
                    &registry,
                )
                .await;
                if let Some(reply) = reply {
                    if ws_tx.send(Message::Text(reply.into())).await.is_err() {
                        break;
                    }
                }
            }

            frame = frame_rx.recv() => {
                match frame {
                    Ok(frame) => {
                        if let Err(e) = ws_tx.send(Message::Text(frame.as_str().into())).await {
                            tracing::debug!(client_id = %client_id, error = %e, "hub: send failed, dropping client");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(client_id = %client_id, skipped, "hub: client lagged, frames dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            _ = heartbeat.tick() => {
                let frame = make_frame("heartbeat", json!({ "serverTime": format_ts(Utc::now()) }));
                if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }

            _ = cancel.cancelled() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
        }
    }

    registry.write().await.remove(&client_id);
    tracing::debug!(client_id = %client_id, "hub: client disconnected");
}

/// Dispatch one inbound text frame; returns the reply frame, if any.
async fn handle_client_message(
    text: &str,
    client_id: Uuid,
    ring: &SharedRing,
    registry: &Registry,
) -> Option<String> {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!(client_id = %client_id, error = %e, "hub: malformed client frame");
            return Some(make_frame(
                "error",
                json!({ "code": "INVALID_MESSAGE", "message": format!("invalid json: {e}") }),
            ));
        }
    };

    match frame.kind.as_str() {
        "sync_request" => {
            let payload: SyncRequestPayload = match serde_json::from_value(frame.payload) {
                Ok(p) => p,
                Err(e) => {
                    return Some(make_frame(
                        "error",
                        json!({ "code": "SYNC_FAILED", "message": format!("bad sync_request: {e}") }),
                    ));
                }
            };

            let events = if let Some(last_event_id) = &payload.last_event_id {
                ring.read().await.get_since(last_event_id)
            } else {
                let since = payload
                    .since
                    .as_deref()
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.with_timezone(&Utc));
                match since {
                    Some(since) => ring.read().await.get_recent(since),
                    None => {
                        return Some(make_frame(
                            "error",
                            json!({ "code": "SYNC_FAILED", "message": "missing or invalid since" }),
                        ));
                    }
                }
            };

            if let Some(reg) = registry.write().await.get_mut(&client_id) {
                if let Some(last) = events.last() {
                    reg.last_event_id = Some(last.id.clone());
                    reg.last_event_timestamp = Some(last.timestamp);
                }
            }

            Some(make_frame(
                "sync",
                json!({
                    "clientId": client_id,
                    "events": events,
                    "timestamp": format_ts(Utc::now()),
                }),
            ))
        }
        other => {
            tracing::debug!(client_id = %client_id, kind = %other, "hub: unknown message type");
            None
        }
    }
}
