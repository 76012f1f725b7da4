//! Startup recovery: rebuild the ring log from the durable store and seed
//! the seen-id set that suppresses duplicates on the live path.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use termdeck_core::types::ts_ms;

use crate::ring::RingLog;
use crate::store::Store;

/// Bound on the seen-id set.
pub const SEEN_CAPACITY: usize = 2000;
/// On overflow the set keeps this many most-recent ids.
pub const SEEN_COMPACT_TO: usize = 1000;

pub const DEFAULT_MAX_EVENTS_TO_LOAD: usize = 1000;

/// Insertion-ordered bounded set of event ids already emitted or recovered.
#[derive(Debug, Default)]
pub struct SeenIds {
    set: HashSet<String>,
    order: VecDeque<String>,
}

impl SeenIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an id. Returns true when the id was not seen before.
    pub fn mark(&mut self, id: &str) -> bool {
        if self.set.contains(id) {
            return false;
        }
        self.set.insert(id.to_string());
        self.order.push_back(id.to_string());
        if self.order.len() > SEEN_CAPACITY {
            while self.order.len() > SEEN_COMPACT_TO {
                if let Some(old) = self.order.pop_front() {
                    self.set.remove(&old);
                }
            }
        }
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.set.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

pub type SharedSeen = Arc<Mutex<SeenIds>>;

/// Outcome of the one recovery run at startup. Exposed via `/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    pub status: String,
    pub events_loaded: usize,
    pub duplicates_skipped: usize,
    pub panes_detected: usize,
    pub memory_only_mode: bool,
    #[serde(with = "ts_ms")]
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RecoveryReport {
    fn memory_only(error: Option<String>) -> Self {
        Self {
            status: "memory_only".into(),
            events_loaded: 0,
            duplicates_skipped: 0,
            panes_detected: 0,
            memory_only_mode: true,
            timestamp: Utc::now(),
            error,
        }
    }
}

/// Runs exactly once at startup, before any source task is spawned.
pub struct RecoveryManager {
    seen: SharedSeen,
    max_events_to_load: usize,
}

impl RecoveryManager {
    pub fn new(max_events_to_load: usize) -> Self {
        Self {
            seen: Arc::new(Mutex::new(SeenIds::new())),
            max_events_to_load,
        }
    }

    /// The seen-id set shared with the live emission path.
    pub fn seen(&self) -> SharedSeen {
        Arc::clone(&self.seen)
    }

    /// Rehydrate the ring from the store. `store` is `None` when the
    /// database could not be opened (or persistence is disabled), which
    /// declares memory-only mode.
    pub async fn recover(
        &self,
        store: Option<&Store>,
        ring: &mut RingLog,
        open_error: Option<String>,
    ) -> RecoveryReport {
        let Some(store) = store else {
            tracing::warn!(
                error = ?open_error,
                "durable store unavailable, running memory-only"
            );
            return RecoveryReport::memory_only(open_error);
        };

        let events = match store.recent_events(self.max_events_to_load) {
            Ok(events) => events,
            Err(e) => {
                tracing::error!(error = %e, "recovery load failed, running memory-only");
                return RecoveryReport::memory_only(Some(e.to_string()));
            }
        };

        let mut seen = self.seen.lock().await;
        let panes: HashSet<&str> = events.iter().map(|e| e.pane_id.as_str()).collect();
        let panes_detected = panes.len();

        let mut duplicates_skipped = 0;
        for event in &events {
            if !seen.mark(&event.id) {
                duplicates_skipped += 1;
            }
        }
        let events_loaded = events.len() - duplicates_skipped;
        duplicates_skipped += ring.load_bulk(events);

        // Stream files are re-read from offset zero on discovery; their ids
        // are deterministic, so seeding them here suppresses the replay.
        match store.recent_stream_event_ids(self.max_events_to_load) {
            Ok(ids) => {
                for id in ids {
                    seen.mark(&id);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not seed stream ids, replays may re-broadcast");
            }
        }

        tracing::info!(
            events_loaded,
            duplicates_skipped,
            panes_detected,
            "recovery complete"
        );

        RecoveryReport {
            status: "complete".into(),
            events_loaded,
            duplicates_skipped,
            panes_detected,
            memory_only_mode: false,
            timestamp: Utc::now(),
            error: None,
        }
    }
}
