//! Property tests over the pure pipeline functions.

use proptest::prelude::*;

use termdeck_core::ansi::strip_ansi;
use termdeck_core::classify::classify;
use termdeck_core::delta::{DedupWindow, PaneDeltaState, extract_delta, fnv1a_32};

proptest! {
    #[test]
    fn strip_ansi_is_idempotent(input in "\\PC{0,200}") {
        let once = strip_ansi(&input);
        prop_assert_eq!(strip_ansi(&once), once);
    }

    #[test]
    fn strip_ansi_never_grows(input in ".{0,200}") {
        prop_assert!(strip_ansi(&input).len() <= input.len());
    }

    #[test]
    fn classification_ignores_escapes(text in "[a-zA-Z0-9 :\\?\\.\\$]{0,80}") {
        let wrapped = format!("\x1b[1;33m{text}\x1b[0m");
        prop_assert_eq!(classify(&wrapped), classify(&text));
    }

    #[test]
    fn extract_delta_total_on_empty_previous(new in "\\PC{0,200}") {
        prop_assert_eq!(extract_delta("", &new), new);
    }

    #[test]
    fn delta_lines_come_from_new_snapshot(
        prev in proptest::collection::vec("[a-z]{0,10}", 0..12),
        new in proptest::collection::vec("[a-z]{0,10}", 0..12),
    ) {
        let prev = prev.join("\n");
        let new = new.join("\n");
        let delta = extract_delta(&prev, &new);
        for line in delta.lines() {
            prop_assert!(
                new.lines().any(|l| l == line || l.ends_with(line)),
                "delta line {:?} not present in new snapshot {:?}",
                line,
                new
            );
        }
    }

    #[test]
    fn dedup_window_never_exceeds_capacity(hashes in proptest::collection::vec(any::<u32>(), 0..3000)) {
        let mut window = DedupWindow::new();
        for h in hashes {
            window.insert(h);
            prop_assert!(window.len() <= termdeck_core::delta::DEDUP_CAPACITY + 1);
        }
    }

    #[test]
    fn repeated_snapshot_never_reemits(snapshot in "[a-z\\n]{1,80}") {
        let mut pane = PaneDeltaState::new();
        let first = pane.ingest(&snapshot);
        let second = pane.ingest(&snapshot);
        if first.is_some() {
            prop_assert!(second.is_none());
        }
    }

    #[test]
    fn fnv_matches_reference_for_short_inputs(bytes in "[a-z]{0,16}") {
        // Independent fold of the same parameters.
        let expected = bytes
            .as_bytes()
            .iter()
            .fold(0x811c_9dc5u32, |h, b| (h ^ u32::from(*b)).wrapping_mul(0x0100_0193));
        prop_assert_eq!(fnv1a_32(&bytes), expected);
    }
}
