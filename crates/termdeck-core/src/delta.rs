//! Snapshot delta extraction and per-pane deduplication state.

use std::collections::{HashSet, VecDeque};

/// Capacity of the per-pane processed-delta hash window.
pub const DEDUP_CAPACITY: usize = 1000;
/// On overflow the window keeps this many most-recent hashes.
pub const DEDUP_COMPACT_TO: usize = 500;

/// FNV-1a, 32-bit. Cheap and stable; collisions only cost a suppressed
/// duplicate within one pane's dedup window.
pub fn fnv1a_32(s: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in s.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Extract the new content of `new` relative to `prev`.
///
/// Rules, applied in order:
/// 1. empty previous snapshot emits the whole new snapshot
/// 2. a shrink below half the previous line count is a screen clear —
///    emit the whole new snapshot
/// 3. equal line counts where only the last line grew by a suffix emit
///    just that suffix (streaming output, progress bars)
/// 4. equal line counts where the last line changed otherwise emit the
///    new last line
/// 5. otherwise emit everything from the first diverging line
/// 6. fallback: the new last line
pub fn extract_delta(prev: &str, new: &str) -> String {
    if prev.is_empty() {
        return new.to_string();
    }

    let prev_lines: Vec<&str> = prev.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();

    if new_lines.len() * 2 < prev_lines.len() {
        return new.to_string();
    }

    if prev_lines.len() == new_lines.len() && !new_lines.is_empty() {
        let last = new_lines.len() - 1;
        if prev_lines[..last] == new_lines[..last] {
            let old_last = prev_lines[last];
            let new_last = new_lines[last];
            if new_last != old_last {
                if let Some(suffix) = new_last.strip_prefix(old_last) {
                    return suffix.to_string();
                }
                return new_last.to_string();
            }
        }
    }

    let common = prev_lines
        .iter()
        .zip(new_lines.iter())
        .take_while(|(a, b)| a == b)
        .count();
    if common < new_lines.len() {
        return new_lines[common..].join("\n");
    }

    new_lines.last().copied().unwrap_or_default().to_string()
}

/// Bounded insertion-ordered set of delta hashes for one pane.
#[derive(Debug, Default)]
pub struct DedupWindow {
    seen: HashSet<u32>,
    order: VecDeque<u32>,
}

impl DedupWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, hash: u32) -> bool {
        self.seen.contains(&hash)
    }

    /// Record a hash; compacts to the most recent half on overflow.
    pub fn insert(&mut self, hash: u32) {
        if !self.seen.insert(hash) {
            return;
        }
        self.order.push_back(hash);
        if self.order.len() > DEDUP_CAPACITY {
            while self.order.len() > DEDUP_COMPACT_TO {
                if let Some(old) = self.order.pop_front() {
                    self.seen.remove(&old);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Per-pane snapshot state inside the delta detector.
#[derive(Debug, Default)]
pub struct PaneDeltaState {
    pub last_snapshot: String,
    pub last_snapshot_hash: u32,
    pub last_line_count: usize,
    pub processed_delta_hashes: DedupWindow,
}

impl PaneDeltaState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a raw snapshot; returns the ANSI-stripped delta, or `None` when
    /// the snapshot is an identical re-fetch, the delta is blank, or the
    /// delta was already emitted within the dedup window.
    pub fn ingest(&mut self, snapshot: &str) -> Option<String> {
        let snapshot_hash = fnv1a_32(snapshot);
        if snapshot_hash == self.last_snapshot_hash && !self.last_snapshot.is_empty() {
            return None;
        }

        let delta = extract_delta(&self.last_snapshot, snapshot);

        self.last_snapshot = snapshot.to_string();
        self.last_snapshot_hash = snapshot_hash;
        self.last_line_count = snapshot.lines().count();

        let stripped = crate::ansi::strip_ansi(&delta);
        if stripped.trim().is_empty() {
            return None;
        }

        let delta_hash = fnv1a_32(&stripped);
        if self.processed_delta_hashes.contains(delta_hash) {
            return None;
        }
        self.processed_delta_hashes.insert(delta_hash);

        Some(stripped)
    }
}
