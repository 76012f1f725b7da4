//! Bounded in-memory event log used for live fan-out and short-window
//! resume.

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};

use termdeck_core::types::TerminalEvent;

pub const DEFAULT_CAPACITY: usize = 1000;

/// FIFO of the most recent events, keyed by id, ordered by insertion.
///
/// Insertion order is delivery order: the broadcast path reads events in
/// the same order `push` stored them.
#[derive(Debug)]
pub struct RingLog {
    capacity: usize,
    events: VecDeque<TerminalEvent>,
    ids: HashSet<String>,
}

impl RingLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: VecDeque::with_capacity(capacity.max(1)),
            ids: HashSet::new(),
        }
    }

    /// Append an event, evicting from the head when over capacity.
    /// An id already present is left untouched (returns false).
    pub fn push(&mut self, event: TerminalEvent) -> bool {
        if self.ids.contains(&event.id) {
            return false;
        }
        self.ids.insert(event.id.clone());
        self.events.push_back(event);
        while self.events.len() > self.capacity {
            if let Some(evicted) = self.events.pop_front() {
                self.ids.remove(&evicted.id);
            }
        }
        true
    }

    /// Snapshot copy of the whole buffer in insertion order.
    pub fn get_all(&self) -> Vec<TerminalEvent> {
        self.events.iter().cloned().collect()
    }

    /// Events strictly after the given id. When the id is unknown (already
    /// evicted) the whole buffer is returned; callers must deduplicate by
    /// id against their own state.
    pub fn get_since(&self, last_event_id: &str) -> Vec<TerminalEvent> {
        match self.events.iter().position(|e| e.id == last_event_id) {
            Some(idx) => self.events.iter().skip(idx + 1).cloned().collect(),
            None => self.get_all(),
        }
    }

    /// Events with `timestamp > since`.
    pub fn get_recent(&self, since: DateTime<Utc>) -> Vec<TerminalEvent> {
        self.events
            .iter()
            .filter(|e| e.timestamp > since)
            .cloned()
            .collect()
    }

    /// Replace the buffer with the tail of `events` (up to capacity),
    /// preserving order. Returns the number of duplicate ids skipped.
    /// Used by recovery.
    pub fn load_bulk(&mut self, events: Vec<TerminalEvent>) -> usize {
        self.events.clear();
        self.ids.clear();

        let mut duplicates = 0;
        let tail_start = events.len().saturating_sub(self.capacity);
        for event in events.into_iter().skip(tail_start) {
            if !self.push(event) {
                duplicates += 1;
            }
        }
        duplicates
    }

    pub fn has_event(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
