//! Ordered, append-only timeline of procedure events
//!
//! The store's defined order is newest-first by insertion. Feed messages
//! may arrive out of order, so consumers needing strict chronology must
//! sort by `timestamp` explicitly.
//!
//! The store is bounded: beyond the configured capacity the oldest events
//! are evicted, keeping memory flat across long procedures.

use std::collections::VecDeque;

use crate::types::TimelineEvent;

/// Default maximum number of retained events.
pub const DEFAULT_CAPACITY: usize = 2048;

/// Newest-first event log, the single source of truth for presentation.
#[derive(Debug)]
pub struct TimelineStore {
    events: VecDeque<TimelineEvent>,
    capacity: usize,
}

impl TimelineStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a store retaining at most `capacity` events (minimum 1).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Prepend an event; evicts the oldest entry when at capacity.
    pub fn append(&mut self, event: TimelineEvent) {
        self.events.push_front(event);
        while self.events.len() > self.capacity {
            self.events.pop_back();
        }
    }

    /// Replace the whole log. `events` is taken as already newest-first;
    /// entries beyond capacity are dropped from the old end.
    pub fn replace_all(&mut self, events: Vec<TimelineEvent>) {
        self.events = events.into_iter().take(self.capacity).collect();
    }

    /// Remove all events.
    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Most recently appended event.
    pub fn latest(&self) -> Option<&TimelineEvent> {
        self.events.front()
    }

    /// Snapshot of the log, newest-first.
    pub fn snapshot(&self) -> Vec<TimelineEvent> {
        self.events.iter().cloned().collect()
    }

    /// Iterate newest-first.
    pub fn iter(&self) -> impl Iterator<Item = &TimelineEvent> {
        self.events.iter()
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

impl Default for TimelineStore {
    fn default() -> Self {
        Self::new()
    }
}
