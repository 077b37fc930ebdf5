//! Bounded, most-recent-first status history

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default number of entries kept per entity.
pub const DEFAULT_HISTORY_CAPACITY: usize = 15;

/// A status value stamped with the time it became effective.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamped<S> {
    pub timestamp: DateTime<Utc>,
    pub value: S,
}

impl<S> Timestamped<S> {
    pub fn new(timestamp: DateTime<Utc>, value: S) -> Self {
        Self { timestamp, value }
    }

    pub fn now(value: S) -> Self {
        Self::new(Utc::now(), value)
    }

    pub fn map<T>(self, f: impl FnOnce(S) -> T) -> Timestamped<T> {
        Timestamped {
            timestamp: self.timestamp,
            value: f(self.value),
        }
    }
}

/// Capacity-bounded record of an entity's status values.
///
/// Entries are kept most-recent-first; `current()` is always the entry
/// pushed last. Once `capacity` is exceeded the oldest entry is evicted.
/// A history is never empty: it starts with the initial entry given at
/// construction.
#[derive(Debug, Clone)]
pub struct StatusHistory<S> {
    entries: VecDeque<Timestamped<S>>,
    capacity: usize,
}

impl<S: Clone> StatusHistory<S> {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize, initial: Timestamped<S>) -> Self {
        let capacity = capacity.max(1);
        let mut entries = VecDeque::with_capacity(capacity);
        entries.push_front(initial);
        Self { entries, capacity }
    }

    pub fn current(&self) -> &Timestamped<S> {
        // `new` seeds one entry and `push` never leaves the deque empty
        &self.entries[0]
    }

    pub fn push(&mut self, timestamp: DateTime<Utc>, value: S) {
        self.entries.push_front(Timestamped::new(timestamp, value));
        while self.entries.len() > self.capacity {
            self.entries.pop_back();
        }
    }

    /// Entries from newest to oldest.
    pub fn iter(&self) -> impl Iterator<Item = &Timestamped<S>> {
        self.entries.iter()
    }

    pub fn to_vec(&self) -> Vec<Timestamped<S>> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<S: Clone + Default> StatusHistory<S> {
    /// History seeded with the default ("unknown") value.
    pub fn unknown(capacity: usize) -> Self {
        Self::new(capacity, Timestamped::now(S::default()))
    }
}
