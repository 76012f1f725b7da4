//! JSONL tailer: watches a directory of append-only `events-*.jsonl`
//! files, tails each from its last byte offset, and feeds normalized
//! stream events plus session updates into the pipeline.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use chrono::Utc;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use termdeck_core::ids::stream_event_id;
use termdeck_core::stream::{SessionTracker, normalize_record, pane_id_from_file_name};

use crate::pipeline::PipelineEvent;

pub const DEFAULT_FILE_PATTERN: &str = "events-*.jsonl";

/// Tail state for one stream file.
#[derive(Debug)]
pub struct TrackedFile {
    pub path: PathBuf,
    pub pane_id: String,
    /// Byte position up to which the file has been consumed.
    pub read_offset: u64,
    /// Partial trailing line held back until its newline arrives.
    residual: String,
    /// Byte offset at which the currently accumulating line began.
    /// Line offsets are what make stream-event ids deterministic.
    next_line_offset: u64,
    tracker: SessionTracker,
}

impl TrackedFile {
    fn new(path: PathBuf, pane_id: String) -> Self {
        let tracker = SessionTracker::new(&pane_id, Utc::now());
        Self {
            path,
            pane_id,
            read_offset: 0,
            residual: String::new(),
            next_line_offset: 0,
            tracker,
        }
    }

    /// Read from the stored offset to the current end of file and return
    /// complete lines with their starting byte offsets. A shrunken file is
    /// treated as replaced and re-read from the start.
    fn read_new_lines(&mut self) -> std::io::Result<Vec<(u64, String)>> {
        let mut file = std::fs::File::open(&self.path)?;
        let len = file.metadata()?.len();
        if len < self.read_offset {
            self.read_offset = 0;
            self.next_line_offset = 0;
            self.residual.clear();
        }
        if len == self.read_offset {
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(self.read_offset))?;
        let mut chunk = String::new();
        file.take(len - self.read_offset)
            .read_to_string(&mut chunk)?;
        self.read_offset = len;

        let mut combined = std::mem::take(&mut self.residual);
        combined.push_str(&chunk);

        let mut lines = Vec::new();
        while let Some(newline) = combined.find('\n') {
            let line: String = combined.drain(..=newline).collect();
            let offset = self.next_line_offset;
            self.next_line_offset += line.len() as u64;
            let trimmed = line.trim_end_matches(['\n', '\r']);
            if !trimmed.is_empty() {
                lines.push((offset, trimmed.to_string()));
            }
        }
        self.residual = combined;

        Ok(lines)
    }
}

/// Directory tailer for the structured ingestion path.
pub struct StreamTailer {
    dir: PathBuf,
    pattern: glob::Pattern,
    tx: mpsc::Sender<PipelineEvent>,
    cancel: CancellationToken,
}

impl StreamTailer {
    pub fn new(
        dir: PathBuf,
        tx: mpsc::Sender<PipelineEvent>,
        cancel: CancellationToken,
    ) -> Result<Self, glob::PatternError> {
        Ok(Self {
            dir,
            pattern: glob::Pattern::new(DEFAULT_FILE_PATTERN)?,
            tx,
            cancel,
        })
    }

    /// Tail the directory until cancelled. Per-line failures are surfaced
    /// as `stream_error` envelopes; the tailer itself keeps running.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut files: HashMap<PathBuf, TrackedFile> = HashMap::new();

        if !self.dir.exists() {
            tracing::warn!(
                dir = %self.dir.display(),
                "stream tailer: directory does not exist, waiting for creation"
            );
        } else {
            // Existing files are consumed from the beginning.
            for entry in std::fs::read_dir(&self.dir)? {
                let path = entry?.path();
                if self.matches(&path) {
                    self.register(&mut files, path).await;
                }
            }
        }

        let (notify_tx, mut notify_rx) = mpsc::channel::<notify::Result<Event>>(256);
        let mut watcher: RecommendedWatcher = {
            let tx = notify_tx.clone();
            notify::recommended_watcher(move |res| {
                let _ = tx.blocking_send(res);
            })?
        };
        let watch_root = if self.dir.exists() {
            self.dir.clone()
        } else {
            self.dir
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."))
                .to_path_buf()
        };
        watcher.watch(&watch_root, RecursiveMode::Recursive)?;
        tracing::info!(dir = %self.dir.display(), "stream tailer: watching directory");

        loop {
            tokio::select! {
                event = notify_rx.recv() => {
                    match event {
                        Some(Ok(event)) => self.handle_notify_event(&mut files, &event).await,
                        Some(Err(e)) => {
                            tracing::warn!("stream tailer: notify error: {e}");
                        }
                        None => {
                            tracing::info!("stream tailer: notify channel closed, stopping");
                            break;
                        }
                    }
                }
                _ = self.cancel.cancelled() => {
                    tracing::info!("stream tailer: cancellation requested, stopping");
                    break;
                }
            }
        }

        Ok(())
    }

    fn matches(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| self.pattern.matches(name))
    }

    async fn handle_notify_event(&self, files: &mut HashMap<PathBuf, TrackedFile>, event: &Event) {
        match event.kind {
            EventKind::Create(_) | EventKind::Modify(_) => {
                for path in &event.paths {
                    if !self.matches(path) {
                        continue;
                    }
                    if files.contains_key(path) {
                        self.drain(files, path).await;
                    } else {
                        self.register(files, path.clone()).await;
                    }
                }
            }
            EventKind::Remove(_) => {
                for path in &event.paths {
                    if files.remove(path).is_some() {
                        tracing::info!(path = %path.display(), "stream tailer: file removed");
                    }
                }
            }
            _ => {}
        }
    }

    /// Start tracking a newly discovered file: announce the session, then
    /// consume the whole file from offset zero.
    async fn register(&self, files: &mut HashMap<PathBuf, TrackedFile>, path: PathBuf) {
        let Some(pane_id) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(pane_id_from_file_name)
            .map(str::to_string)
        else {
            tracing::warn!(path = %path.display(), "stream tailer: no pane id in file name");
            return;
        };

        tracing::info!(path = %path.display(), pane_id = %pane_id, "stream tailer: tracking file");
        let tracked = TrackedFile::new(path.clone(), pane_id.clone());
        let session = tracked.tracker.metadata().clone();
        files.insert(path.clone(), tracked);

        if let Err(e) = self
            .tx
            .send(PipelineEvent::SessionStarted {
                pane_id,
                session,
            })
            .await
        {
            tracing::warn!("stream tailer: failed to announce session: {e}");
        }

        self.drain(files, &path).await;
    }

    /// Consume everything new in a tracked file.
    async fn drain(&self, files: &mut HashMap<PathBuf, TrackedFile>, path: &Path) {
        let Some(tracked) = files.get_mut(path) else {
            return;
        };
        let pane_id = tracked.pane_id.clone();

        let lines = match tracked.read_new_lines() {
            Ok(lines) => lines,
            Err(e) => {
                tracing::warn!(path = %path.display(), "stream tailer: read failed: {e}");
                self.send(PipelineEvent::StreamError {
                    pane_id,
                    message: format!("{}: {e}", path.display()),
                })
                .await;
                return;
            }
        };

        for (offset, line) in lines {
            let record: serde_json::Value = match serde_json::from_str(&line) {
                Ok(record) => record,
                Err(e) => {
                    // The offset has already advanced past this line, so it
                    // is reported once and never re-parsed.
                    tracing::warn!(
                        path = %path.display(),
                        offset,
                        "stream tailer: malformed line: {e}"
                    );
                    self.send(PipelineEvent::StreamError {
                        pane_id: pane_id.clone(),
                        message: format!("{}: malformed line at byte {offset}", path.display()),
                    })
                    .await;
                    continue;
                }
            };

            if tracked.tracker.apply(&record) {
                self.send(PipelineEvent::SessionUpdated {
                    pane_id: pane_id.clone(),
                    session: tracked.tracker.metadata().clone(),
                })
                .await;
            }

            let id = stream_event_id(&pane_id, offset);
            if let Some(event) = normalize_record(
                &record,
                &pane_id,
                tracked.tracker.session_id(),
                id,
                Utc::now(),
            ) {
                self.send(PipelineEvent::Stream(event)).await;
            }
        }
    }

    async fn send(&self, event: PipelineEvent) {
        if let Err(e) = self.tx.send(event).await {
            tracing::warn!("stream tailer: failed to send event: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    fn write_line(path: &Path, line: &str) {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .expect("test");
        writeln!(f, "{line}").expect("test");
    }

    #[test]
    fn tracked_file_reads_incrementally_with_offsets() {
        let dir = tempfile::tempdir().expect("test");
        let path = dir.path().join("events-%1.jsonl");
        std::fs::write(&path, "").expect("test");
        let mut tracked = TrackedFile::new(path.clone(), "%1".into());

        write_line(&path, r#"{"type":"a"}"#);
        write_line(&path, r#"{"type":"b"}"#);
        let lines = tracked.read_new_lines().expect("read");
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].0, 0);
        assert_eq!(lines[0].1, r#"{"type":"a"}"#);
        // Second line starts right after the first line plus its newline.
        assert_eq!(lines[1].0, 13);

        // No change, nothing new.
        assert!(tracked.read_new_lines().expect("read").is_empty());

        write_line(&path, r#"{"type":"c"}"#);
        let lines = tracked.read_new_lines().expect("read");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].0, 26);
    }

    #[test]
    fn partial_line_is_held_back_until_complete() {
        let dir = tempfile::tempdir().expect("test");
        let path = dir.path().join("events-%1.jsonl");
        std::fs::write(&path, "").expect("test");
        let mut tracked = TrackedFile::new(path.clone(), "%1".into());

        let mut f = std::fs::OpenOptions::new().append(true).open(&path).expect("test");
        write!(f, r#"{{"type":"res"#).expect("test");
        f.flush().expect("test");

        assert!(tracked.read_new_lines().expect("read").is_empty());

        writeln!(f, r#"ult"}}"#).expect("test");
        let lines = tracked.read_new_lines().expect("read");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].0, 0);
        assert_eq!(lines[0].1, r#"{"type":"result"}"#);
    }

    #[test]
    fn offsets_are_stable_across_rereads_from_zero() {
        let dir = tempfile::tempdir().expect("test");
        let path = dir.path().join("events-%1.jsonl");
        std::fs::write(&path, "").expect("test");
        write_line(&path, r#"{"type":"a"}"#);
        write_line(&path, r#"{"type":"b"}"#);

        let mut first = TrackedFile::new(path.clone(), "%1".into());
        let mut second = TrackedFile::new(path.clone(), "%1".into());
        let offsets1: Vec<u64> = first.read_new_lines().expect("read").iter().map(|l| l.0).collect();
        let offsets2: Vec<u64> = second.read_new_lines().expect("read").iter().map(|l| l.0).collect();
        // Deterministic ids depend on this.
        assert_eq!(offsets1, offsets2);
    }

    async fn collect_events(
        rx: &mut mpsc::Receiver<PipelineEvent>,
        n: usize,
    ) -> Vec<PipelineEvent> {
        let mut out = Vec::new();
        for _ in 0..n {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("event in time")
                .expect("channel open");
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn discovers_existing_files_and_announces_sessions() {
        let dir = tempfile::tempdir().expect("test");
        let path = dir.path().join("events-%1.jsonl");
        write_line(
            &path,
            r#"{"type":"system","subtype":"init","session_id":"s-1","model":"sonnet"}"#,
        );

        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let tailer = StreamTailer::new(dir.path().to_path_buf(), tx, cancel.clone()).expect("tailer");
        let task = tokio::spawn(async move { tailer.run().await });

        // session_start (discovery), session_update (init), stream event.
        let events = collect_events(&mut rx, 3).await;
        assert!(matches!(&events[0], PipelineEvent::SessionStarted { pane_id, .. } if pane_id == "%1"));
        match &events[1] {
            PipelineEvent::SessionUpdated { session, .. } => {
                assert_eq!(session.session_id, "s-1");
                assert_eq!(session.model, "sonnet");
            }
            other => panic!("expected SessionUpdated, got {other:?}"),
        }
        match &events[2] {
            PipelineEvent::Stream(ev) => {
                assert_eq!(ev.id, "se_%1_0");
                assert_eq!(ev.session_id, "s-1");
                assert_eq!(ev.content, "Session initialized with model sonnet");
            }
            other => panic!("expected Stream, got {other:?}"),
        }

        cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
    }

    #[tokio::test]
    async fn appended_records_flow_through() {
        let dir = tempfile::tempdir().expect("test");
        let path = dir.path().join("events-%2.jsonl");
        std::fs::write(&path, "").expect("test");

        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let tailer = StreamTailer::new(dir.path().to_path_buf(), tx, cancel.clone()).expect("tailer");
        let task = tokio::spawn(async move { tailer.run().await });

        // Discovery announcement for the empty file.
        let events = collect_events(&mut rx, 1).await;
        assert!(matches!(&events[0], PipelineEvent::SessionStarted { .. }));

        write_line(
            &path,
            r#"{"type":"result","result":"ok","total_cost_usd":0.02,"usage":{"input_tokens":10,"output_tokens":5}}"#,
        );

        // The result record both updates the session and emits an event.
        let events = collect_events(&mut rx, 2).await;
        match &events[0] {
            PipelineEvent::SessionUpdated { session, .. } => {
                assert!((session.total_cost - 0.02).abs() < 1e-9);
                assert_eq!(session.total_tokens.input, 10);
            }
            other => panic!("expected SessionUpdated, got {other:?}"),
        }
        match &events[1] {
            PipelineEvent::Stream(ev) => {
                assert_eq!(ev.pane_id, "%2");
                assert!(ev.cost.is_some());
            }
            other => panic!("expected Stream, got {other:?}"),
        }

        cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
    }

    #[tokio::test]
    async fn malformed_line_surfaces_error_and_tailing_continues() {
        let dir = tempfile::tempdir().expect("test");
        let path = dir.path().join("events-%3.jsonl");
        std::fs::write(&path, "").expect("test");

        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let tailer = StreamTailer::new(dir.path().to_path_buf(), tx, cancel.clone()).expect("tailer");
        let task = tokio::spawn(async move { tailer.run().await });

        let _ = collect_events(&mut rx, 1).await; // session_start

        write_line(&path, "{this is not json");
        write_line(
            &path,
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"still here"}]}}"#,
        );

        // Error for the bad line, then the good record.
        let mut saw_error = false;
        let mut saw_event = false;
        for _ in 0..2 {
            match collect_events(&mut rx, 1).await.remove(0) {
                PipelineEvent::StreamError { pane_id, message } => {
                    assert_eq!(pane_id, "%3");
                    assert!(message.contains("malformed line"));
                    saw_error = true;
                }
                PipelineEvent::Stream(ev) => {
                    assert_eq!(ev.content, "still here");
                    saw_event = true;
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert!(saw_error && saw_event);

        cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
    }

    #[tokio::test]
    async fn unrelated_files_are_ignored() {
        let dir = tempfile::tempdir().expect("test");
        std::fs::write(dir.path().join("notes.txt"), "hello").expect("test");
        std::fs::write(dir.path().join("other-%1.jsonl"), "{}").expect("test");

        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let tailer = StreamTailer::new(dir.path().to_path_buf(), tx, cancel.clone()).expect("tailer");
        let task = tokio::spawn(async move { tailer.run().await });

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(rx.try_recv().is_err());

        cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
    }
}
