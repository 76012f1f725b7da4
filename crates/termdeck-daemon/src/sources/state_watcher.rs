//! State watcher: maintains the canonical set of active panes by watching
//! an external JSON state document.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use termdeck_core::statedoc::{diff_panes, parse_state_document};

use crate::pipeline::PipelineEvent;

/// Writes are coalesced: wait this long after the first change...
pub const DEBOUNCE: Duration = Duration::from_millis(100);
/// ...and this long after the latest change, before re-reading.
pub const QUIET_WINDOW: Duration = Duration::from_millis(50);

pub struct StateWatcher {
    path: PathBuf,
    tx: mpsc::Sender<PipelineEvent>,
    cancel: CancellationToken,
}

impl StateWatcher {
    pub fn new(path: PathBuf, tx: mpsc::Sender<PipelineEvent>, cancel: CancellationToken) -> Self {
        Self { path, tx, cancel }
    }

    /// Watch the document until cancelled. A missing file at startup just
    /// means the watcher starts empty and waits for creation; parse errors
    /// never tear the subscription down.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut current: BTreeSet<String> = BTreeSet::new();

        // Initial state, if the document already exists.
        self.reload(&mut current).await;

        // Bridge synchronous notify callbacks into async land. The parent
        // directory is watched so that create/unlink of the document itself
        // is observed.
        let (notify_tx, mut notify_rx) = mpsc::channel::<notify::Result<Event>>(256);
        let mut watcher: RecommendedWatcher = {
            let tx = notify_tx.clone();
            notify::recommended_watcher(move |res| {
                let _ = tx.blocking_send(res);
            })?
        };

        let watch_dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        watcher.watch(watch_dir, RecursiveMode::NonRecursive)?;
        tracing::info!(path = %self.path.display(), "state watcher: watching document");

        let mut pending = false;
        let mut debounce_deadline = Instant::now();
        let mut quiet_deadline = Instant::now();

        loop {
            let deadline = debounce_deadline.max(quiet_deadline);
            tokio::select! {
                event = notify_rx.recv() => {
                    match event {
                        Some(Ok(event)) => {
                            if self.is_relevant(&event) {
                                let now = Instant::now();
                                if !pending {
                                    pending = true;
                                    debounce_deadline = now + DEBOUNCE;
                                }
                                quiet_deadline = now + QUIET_WINDOW;
                            }
                        }
                        Some(Err(e)) => {
                            tracing::warn!("state watcher: notify error: {e}");
                        }
                        None => {
                            tracing::info!("state watcher: notify channel closed, stopping");
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline), if pending => {
                    pending = false;
                    self.reload(&mut current).await;
                }
                _ = self.cancel.cancelled() => {
                    tracing::info!("state watcher: cancellation requested, stopping");
                    break;
                }
            }
        }

        Ok(())
    }

    fn is_relevant(&self, event: &Event) -> bool {
        let watched = self.path.file_name();
        match event.kind {
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => event
                .paths
                .iter()
                .any(|p| p.file_name() == watched),
            _ => false,
        }
    }

    /// Re-read the document, diff the pane set, and emit the change if the
    /// symmetric difference is non-empty.
    async fn reload(&self, current: &mut BTreeSet<String>) {
        let next = match std::fs::read_to_string(&self.path) {
            Ok(text) => match parse_state_document(&text) {
                Ok(doc) => doc.active_panes(),
                Err(e) => {
                    // Leave the observed state unchanged.
                    tracing::warn!(
                        path = %self.path.display(),
                        "state watcher: malformed document: {e}"
                    );
                    return;
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // A removed document means every pane is gone.
                BTreeSet::new()
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "state watcher: read failed: {e}");
                return;
            }
        };

        let (added, removed) = diff_panes(current, &next);
        if added.is_empty() && removed.is_empty() {
            return;
        }

        tracing::info!(added = ?added, removed = ?removed, "state watcher: pane set changed");
        *current = next;

        if let Err(e) = self
            .tx
            .send(PipelineEvent::PanesChanged { added, removed })
            .await
        {
            tracing::warn!("state watcher: failed to send pane diff: {e}");
        }
    }
}
