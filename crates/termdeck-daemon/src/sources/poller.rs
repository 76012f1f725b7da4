//! Terminal poller: periodically fetches pane snapshots through the
//! external CLI, with per-source exponential back-off on failure.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use termdeck_term::PaneFetcher;

use crate::pipeline::PipelineEvent;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(150);
pub const DEFAULT_BASE_BACKOFF: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Per-pane polling state. A source is never given up on; back-off holds
/// retries at the cap instead.
#[derive(Debug)]
pub struct TrackedSource {
    pub pane_id: String,
    pub title: Option<String>,
    pub last_read_at: Option<DateTime<Utc>>,
    pub consecutive_errors: u32,
    pub backoff_until: Option<Instant>,
    last_output: Option<String>,
}

impl TrackedSource {
    fn new(pane_id: &str, title: Option<String>) -> Self {
        Self {
            pane_id: pane_id.to_string(),
            title,
            last_read_at: None,
            consecutive_errors: 0,
            backoff_until: None,
            last_output: None,
        }
    }

    fn eligible(&self, now: Instant) -> bool {
        self.backoff_until.is_none_or(|until| now >= until)
    }
}

/// Delay before the k-th retry: `base · 2^(k−1)`, capped.
pub fn backoff_delay(base: Duration, max: Duration, consecutive_errors: u32) -> Duration {
    let exp = consecutive_errors.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exp).min(max)
}

type Sources = Arc<Mutex<HashMap<String, TrackedSource>>>;

/// Handle for membership changes, shared with the pipeline.
#[derive(Clone)]
pub struct PollerHandle {
    sources: Sources,
}

impl PollerHandle {
    /// A handle with its own empty source map, unattached to a running
    /// poller. Used when wiring or testing components in isolation.
    pub fn detached() -> Self {
        Self {
            sources: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a pane. Idempotent: re-adding an existing pane keeps its
    /// state untouched.
    pub async fn add_source(&self, pane_id: &str, title: Option<String>) {
        let mut sources = self.sources.lock().await;
        sources
            .entry(pane_id.to_string())
            .or_insert_with(|| TrackedSource::new(pane_id, title));
    }

    /// Drop a pane. Any in-flight fetch result for it is discarded on
    /// delivery.
    pub async fn remove_source(&self, pane_id: &str) {
        self.sources.lock().await.remove(pane_id);
    }

    pub async fn contains(&self, pane_id: &str) -> bool {
        self.sources.lock().await.contains_key(pane_id)
    }

    pub async fn tracked(&self) -> Vec<String> {
        self.sources.lock().await.keys().cloned().collect()
    }
}

pub struct Poller<F: PaneFetcher> {
    fetcher: Arc<F>,
    sources: Sources,
    tx: mpsc::Sender<PipelineEvent>,
    interval: Duration,
    base_backoff: Duration,
    max_backoff: Duration,
    cancel: CancellationToken,
}

impl<F: PaneFetcher> Poller<F> {
    pub fn new(
        fetcher: Arc<F>,
        tx: mpsc::Sender<PipelineEvent>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> (Self, PollerHandle) {
        let sources: Sources = Arc::new(Mutex::new(HashMap::new()));
        let handle = PollerHandle {
            sources: Arc::clone(&sources),
        };
        (
            Self {
                fetcher,
                sources,
                tx,
                interval,
                base_backoff: DEFAULT_BASE_BACKOFF,
                max_backoff: DEFAULT_MAX_BACKOFF,
                cancel,
            },
            handle,
        )
    }

    /// Override back-off bounds. Mostly for tests.
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_backoff = base;
        self.max_backoff = max;
        self
    }

    /// Polling loop: one tick fetches every eligible source in parallel,
    /// awaits all settlements, then sleeps to the next tick.
    pub async fn run(&self) {
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "poller started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
                _ = self.cancel.cancelled() => {
                    tracing::info!("poller: cancellation requested, stopping");
                    break;
                }
            }
        }
    }

    async fn poll_once(&self) {
        let now = Instant::now();
        let eligible: Vec<String> = {
            let sources = self.sources.lock().await;
            sources
                .values()
                .filter(|s| s.eligible(now))
                .map(|s| s.pane_id.clone())
                .collect()
        };
        if eligible.is_empty() {
            return;
        }

        let fetches = eligible.iter().map(|pane_id| {
            let fetcher = Arc::clone(&self.fetcher);
            async move {
                let result = fetcher.fetch(pane_id).await;
                (pane_id.clone(), result, Utc::now())
            }
        });
        let settled = futures_util::future::join_all(fetches).await;

        for (pane_id, result, captured_at) in settled {
            let mut sources = self.sources.lock().await;
            // The pane may have been removed while the fetch was in
            // flight; its result is discarded.
            let Some(source) = sources.get_mut(&pane_id) else {
                continue;
            };

            match result {
                Ok(content) => {
                    source.consecutive_errors = 0;
                    source.backoff_until = None;
                    source.last_read_at = Some(captured_at);

                    if source.last_output.as_deref() == Some(content.as_str()) {
                        continue;
                    }
                    source.last_output = Some(content.clone());
                    drop(sources);

                    if let Err(e) = self
                        .tx
                        .send(PipelineEvent::Snapshot {
                            pane_id: pane_id.clone(),
                            content,
                            captured_at,
                        })
                        .await
                    {
                        tracing::warn!(pane_id = %pane_id, "poller: failed to send snapshot: {e}");
                    }
                }
                Err(e) => {
                    source.consecutive_errors += 1;
                    let delay = backoff_delay(
                        self.base_backoff,
                        self.max_backoff,
                        source.consecutive_errors,
                    );
                    source.backoff_until = Some(Instant::now() + delay);
                    tracing::warn!(
                        pane_id = %pane_id,
                        consecutive_errors = source.consecutive_errors,
                        backoff_ms = delay.as_millis() as u64,
                        "poller: fetch failed: {e}"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use termdeck_term::TermError;

    /// Scripted fetcher: each pane serves its snapshots in order, then
    /// keeps repeating the last one. `Err` entries are modeled as `None`.
    struct ScriptedFetcher {
        scripts: HashMap<String, Vec<Option<String>>>,
        calls: AtomicUsize,
    }

    impl ScriptedFetcher {
        fn new(scripts: HashMap<String, Vec<Option<String>>>) -> Self {
            Self {
                scripts,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl PaneFetcher for ScriptedFetcher {
        fn fetch(
            &self,
            pane_id: &str,
        ) -> impl std::future::Future<Output = Result<String, TermError>> + Send {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let step = self.scripts.get(pane_id).and_then(|script| {
                script.get(call.min(script.len().saturating_sub(1))).cloned()
            });
            async move {
                match step {
                    Some(Some(content)) => Ok(content),
                    _ => Err(TermError::CommandFailed("scripted failure".into())),
                }
            }
        }
    }

    fn scripted(pane: &str, steps: Vec<Option<&str>>) -> Arc<ScriptedFetcher> {
        let mut scripts = HashMap::new();
        scripts.insert(
            pane.to_string(),
            steps.into_iter().map(|s| s.map(str::to_string)).collect(),
        );
        Arc::new(ScriptedFetcher::new(scripts))
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(30);
        assert_eq!(backoff_delay(base, max, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, max, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, max, 3), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, max, 5), Duration::from_secs(16));
        assert_eq!(backoff_delay(base, max, 6), Duration::from_secs(30));
        assert_eq!(backoff_delay(base, max, 60), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn add_source_is_idempotent() {
        let handle = PollerHandle::detached();
        handle.add_source("%1", Some("build".into())).await;
        handle.add_source("%1", None).await;

        let tracked = handle.tracked().await;
        assert_eq!(tracked, vec!["%1".to_string()]);
        // The original registration (with its title) survived the re-add.
        let sources = handle.sources.lock().await;
        assert_eq!(sources["%1"].title.as_deref(), Some("build"));
    }

    #[tokio::test]
    async fn unchanged_output_is_suppressed() {
        let fetcher = scripted("%1", vec![Some("same"), Some("same"), Some("same")]);
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let (poller, handle) =
            Poller::new(fetcher, tx, Duration::from_millis(10), cancel.clone());
        handle.add_source("%1", None).await;

        let task = tokio::spawn(async move { poller.run().await });

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("first snapshot in time")
            .expect("channel open");
        match first {
            PipelineEvent::Snapshot { pane_id, content, .. } => {
                assert_eq!(pane_id, "%1");
                assert_eq!(content, "same");
            }
            other => panic!("expected snapshot, got {other:?}"),
        }

        // Identical refetches emit nothing.
        let second = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(second.is_err(), "byte-identical output must be suppressed");

        cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
    }

    #[tokio::test]
    async fn failures_back_off_and_success_resets() {
        let fetcher = scripted("%1", vec![None, None, Some("back")]);
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let (poller, handle) = Poller::new(fetcher, tx, Duration::from_millis(10), cancel.clone());
        let poller = poller.with_backoff(Duration::from_millis(20), Duration::from_millis(100));
        handle.add_source("%1", None).await;

        let task = tokio::spawn(async move { poller.run().await });

        let snapshot = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("recovered snapshot in time")
            .expect("channel open");
        match snapshot {
            PipelineEvent::Snapshot { content, .. } => assert_eq!(content, "back"),
            other => panic!("expected snapshot, got {other:?}"),
        }

        let sources = handle.sources.lock().await;
        let source = sources.get("%1").expect("still tracked");
        assert_eq!(source.consecutive_errors, 0);
        assert!(source.backoff_until.is_none());
        assert!(source.last_read_at.is_some());

        cancel.cancel();
        drop(sources);
        let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
    }

    #[tokio::test]
    async fn removed_source_discards_in_flight_results() {
        let fetcher = scripted("%1", vec![Some("late")]);
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let (poller, handle) =
            Poller::new(fetcher, tx, Duration::from_millis(10), cancel.clone());
        handle.add_source("%1", None).await;
        // Removed before the first tick completes: nothing may be emitted.
        handle.remove_source("%1").await;

        let task = tokio::spawn(async move { poller.run().await });

        let result = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(result.is_err(), "removed pane must not emit");

        cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
    }

    #[tokio::test]
    async fn backed_off_source_is_skipped_until_deadline() {
        let handle = PollerHandle::detached();
        handle.add_source("%1", None).await;
        {
            let mut sources = handle.sources.lock().await;
            let source = sources.get_mut("%1").expect("tracked");
            source.consecutive_errors = 3;
            source.backoff_until = Some(Instant::now() + Duration::from_secs(60));
        }
        let sources = handle.sources.lock().await;
        assert!(!sources["%1"].eligible(Instant::now()));
    }
}
