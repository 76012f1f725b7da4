//! The central event loop: every source feeds one channel, and this task
//! turns raw snapshots into classified events, suppresses duplicates,
//! fills the ring, schedules persistence, and fans out to clients.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use termdeck_core::detector::DeltaDetector;
use termdeck_core::types::{SessionMetadata, StreamEvent, TerminalEvent};

use crate::hub::{HubHandle, SharedRing};
use crate::recovery::SharedSeen;
use crate::sources::poller::PollerHandle;
use crate::store::StoreHandle;

/// Event emitted by sources into the pipeline.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// Raw screen snapshot from the terminal poller.
    Snapshot {
        pane_id: String,
        content: String,
        captured_at: DateTime<Utc>,
    },
    /// Pane membership diff from the state watcher.
    PanesChanged {
        added: Vec<String>,
        removed: Vec<String>,
    },
    /// Normalized structured event from the JSONL tailer.
    Stream(StreamEvent),
    /// A stream file was discovered; a session now exists for the pane.
    SessionStarted {
        pane_id: String,
        session: SessionMetadata,
    },
    /// Session metadata changed (init fields or accumulated totals).
    SessionUpdated {
        pane_id: String,
        session: SessionMetadata,
    },
    /// Transient stream-path failure, surfaced to clients.
    StreamError { pane_id: String, message: String },
}

pub struct Pipeline {
    rx: mpsc::Receiver<PipelineEvent>,
    detector: DeltaDetector,
    ring: SharedRing,
    store: Option<StoreHandle>,
    seen: SharedSeen,
    hub: HubHandle,
    poller: PollerHandle,
    cancel: CancellationToken,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rx: mpsc::Receiver<PipelineEvent>,
        project_id: &str,
        ring: SharedRing,
        store: Option<StoreHandle>,
        seen: SharedSeen,
        hub: HubHandle,
        poller: PollerHandle,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            rx,
            detector: DeltaDetector::new(project_id),
            ring,
            store,
            seen,
            hub,
            poller,
            cancel,
        }
    }

    /// Main event loop. Runs until the source channel closes or the
    /// cancellation token fires.
    pub async fn run(&mut self) {
        info!("pipeline: event loop started");
        loop {
            tokio::select! {
                event = self.rx.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => {
                            info!("pipeline: source channel closed, shutting down");
                            break;
                        }
                    }
                }
                _ = self.cancel.cancelled() => {
                    info!("pipeline: cancellation requested, shutting down");
                    break;
                }
            }
        }
    }

    async fn handle_event(&mut self, event: PipelineEvent) {
        match event {
            PipelineEvent::Snapshot {
                pane_id,
                content,
                captured_at,
            } => {
                if let Some(ev) = self.detector.ingest_snapshot(&pane_id, &content, captured_at) {
                    self.emit(ev).await;
                }
            }
            PipelineEvent::PanesChanged { added, removed } => {
                // Sources must be registered before any read is attempted,
                // so the poller map is updated right here, synchronously.
                for pane_id in &added {
                    self.poller.add_source(pane_id, None).await;
                    info!(pane_id = %pane_id, "pane added");
                }
                for pane_id in &removed {
                    self.poller.remove_source(pane_id).await;
                    self.detector.drop_pane(pane_id);
                    info!(pane_id = %pane_id, "pane removed");
                }
            }
            PipelineEvent::Stream(ev) => {
                if !self.seen.lock().await.mark(&ev.id) {
                    debug!(id = %ev.id, "stream event suppressed as duplicate");
                    return;
                }
                if let Some(store) = &self.store {
                    store.insert_stream_event(ev.clone());
                }
                self.hub
                    .broadcast_raw("stream_event", serde_json::json!({ "event": ev }));
            }
            PipelineEvent::SessionStarted { pane_id, session } => {
                if let Some(store) = &self.store {
                    store.upsert_session(session.clone());
                }
                self.hub.broadcast_raw(
                    "session_start",
                    serde_json::json!({ "paneId": pane_id, "session": session }),
                );
            }
            PipelineEvent::SessionUpdated { pane_id, session } => {
                if let Some(store) = &self.store {
                    store.upsert_session(session.clone());
                }
                debug!(pane_id = %pane_id, "session updated");
                self.hub
                    .broadcast_raw("session_update", serde_json::json!({ "session": session }));
            }
            PipelineEvent::StreamError { pane_id, message } => {
                warn!(pane_id = %pane_id, message = %message, "stream error");
                self.hub.broadcast_raw(
                    "stream_error",
                    serde_json::json!({ "paneId": pane_id, "message": message }),
                );
            }
        }
    }

    /// Emit one terminal event: seen-check, ring, store, broadcast.
    /// Infallible by design; failures downstream are logged, never raised.
    async fn emit(&mut self, event: TerminalEvent) {
        if !self.seen.lock().await.mark(&event.id) {
            debug!(id = %event.id, "event suppressed as duplicate");
            return;
        }

        self.ring.write().await.push(event.clone());
        if let Some(store) = &self.store {
            store.insert_event(event.clone());
        }
        self.hub.broadcast_event(&event);
    }
}
