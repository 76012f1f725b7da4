//! The delta detector: raw pane snapshots in, classified [`TerminalEvent`]s
//! out.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::classify::classify;
use crate::delta::PaneDeltaState;
use crate::ids::generate_event_id;
use crate::question::parse_ask_user_question;
use crate::types::{EventKind, TerminalEvent};

/// Per-pane snapshot differ, deduplicator, and classifier.
///
/// Owns one [`PaneDeltaState`] per tracked pane; pane state is dropped when
/// the pane leaves the system. Within a pane, emitted events carry the
/// timestamps of the snapshots that produced them, in capture order.
pub struct DeltaDetector {
    project_id: String,
    panes: HashMap<String, PaneDeltaState>,
}

impl DeltaDetector {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            panes: HashMap::new(),
        }
    }

    /// Feed one raw snapshot for a pane. Returns the resulting event, or
    /// `None` when the snapshot produced no new content.
    pub fn ingest_snapshot(
        &mut self,
        pane_id: &str,
        snapshot: &str,
        captured_at: DateTime<Utc>,
    ) -> Option<TerminalEvent> {
        let pane = self.panes.entry(pane_id.to_string()).or_default();
        let delta = pane.ingest(snapshot)?;

        let kind = classify(&delta);
        let question_metadata = if kind == EventKind::Question {
            parse_ask_user_question(&delta)
        } else {
            None
        };

        Some(TerminalEvent {
            id: generate_event_id(captured_at),
            project_id: self.project_id.clone(),
            pane_id: pane_id.to_string(),
            kind,
            content: delta,
            timestamp: captured_at,
            question_metadata,
        })
    }

    /// Drop all state for a removed pane.
    pub fn drop_pane(&mut self, pane_id: &str) {
        self.panes.remove(pane_id);
    }

    pub fn pane_count(&self) -> usize {
        self.panes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: u32) -> DateTime<Utc> {
        use chrono::TimeZone;
        Utc.with_ymd_and_hms(2026, 3, 14, 10, 0, secs)
            .single()
            .expect("valid datetime")
    }

    #[test]
    fn growing_snapshot_emits_only_the_new_line() {
        let mut det = DeltaDetector::new("default");

        let first = det
            .ingest_snapshot("%1", "hello\n", ts(0))
            .expect("first snapshot emits");
        assert_eq!(first.content, "hello\n");
        assert_eq!(first.kind, EventKind::Output);

        let second = det
            .ingest_snapshot("%1", "hello\nworld\n", ts(1))
            .expect("second snapshot emits");
        assert_eq!(second.content, "world");
        assert_eq!(second.pane_id, "%1");
        assert_ne!(second.id, first.id);
    }

    #[test]
    fn identical_refetch_emits_nothing() {
        let mut det = DeltaDetector::new("default");
        det.ingest_snapshot("%1", "hello\n", ts(0));
        assert!(det.ingest_snapshot("%1", "hello\n", ts(1)).is_none());
    }

    #[test]
    fn question_event_carries_parsed_metadata() {
        let block = "☐ Auth method\nWhich authentication method should we use?\n❯ 1. OAuth\n  2. API key\n  3. Session cookie\n  4. mTLS\nEnter to select";
        let mut det = DeltaDetector::new("default");
        let ev = det
            .ingest_snapshot("%1", block, ts(0))
            .expect("question emits");

        assert_eq!(ev.kind, EventKind::Question);
        let qm = ev.question_metadata.expect("structured parse succeeds");
        assert_eq!(qm.header, "Auth method");
        assert_eq!(qm.question, "Which authentication method should we use?");
        assert_eq!(qm.options.len(), 4);
    }

    #[test]
    fn question_without_structure_still_classifies() {
        let mut det = DeltaDetector::new("default");
        let ev = det
            .ingest_snapshot("%1", "Proceed? (y/n)", ts(0))
            .expect("emits");
        assert_eq!(ev.kind, EventKind::Question);
        assert!(ev.question_metadata.is_none());
    }

    #[test]
    fn timestamps_follow_capture_order_per_pane() {
        let mut det = DeltaDetector::new("default");
        let a = det.ingest_snapshot("%1", "a", ts(0)).expect("emits");
        let b = det.ingest_snapshot("%1", "a\nb", ts(1)).expect("emits");
        let c = det.ingest_snapshot("%1", "a\nb\nc", ts(2)).expect("emits");
        assert!(a.timestamp < b.timestamp && b.timestamp < c.timestamp);
    }

    #[test]
    fn drop_pane_resets_state() {
        let mut det = DeltaDetector::new("default");
        det.ingest_snapshot("%1", "hello", ts(0));
        assert_eq!(det.pane_count(), 1);

        det.drop_pane("%1");
        assert_eq!(det.pane_count(), 0);

        // After re-add, the same content is new again (fresh dedup window).
        let ev = det.ingest_snapshot("%1", "hello", ts(5)).expect("emits");
        assert_eq!(ev.content, "hello");
    }

    #[test]
    fn panes_do_not_share_dedup_state() {
        let mut det = DeltaDetector::new("default");
        assert!(det.ingest_snapshot("%1", "same text", ts(0)).is_some());
        assert!(det.ingest_snapshot("%2", "same text", ts(0)).is_some());
    }

    #[test]
    fn ansi_is_stripped_from_content() {
        let mut det = DeltaDetector::new("default");
        let ev = det
            .ingest_snapshot("%1", "\x1b[31merror: boom\x1b[0m", ts(0))
            .expect("emits");
        assert_eq!(ev.content, "error: boom");
        assert_eq!(ev.kind, EventKind::Error);
    }
}
