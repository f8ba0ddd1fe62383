//! Bounded per-session event buffer with dense sequence numbering.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde_json::Value;

/// Default ring capacity, overridable via `daemon.buffer_size`.
pub const DEFAULT_RING_CAPACITY: usize = 1000;

/// One buffered driver message.
#[derive(Debug, Clone)]
pub struct BufferedEvent {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub message: Value,
}

/// Fixed-capacity FIFO of the most recent events. Sequences start at 1 and
/// are never reused or skipped; `min_seq` rises as old events are evicted.
pub struct EventRing {
    events: VecDeque<BufferedEvent>,
    capacity: usize,
    next_sequence: u64,
}

impl EventRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            next_sequence: 1,
        }
    }

    /// Append a message, assigning it the next sequence number.
    pub fn append(&mut self, message: Value) -> BufferedEvent {
        let event = BufferedEvent {
            sequence: self.next_sequence,
            timestamp: Utc::now(),
            message,
        };
        self.next_sequence += 1;
        self.events.push_back(event.clone());
        while self.events.len() > self.capacity {
            self.events.pop_front();
        }
        event
    }

    /// The `[min_seq, max_seq]` range currently held, or `None` when empty.
    pub fn range(&self) -> Option<(u64, u64)> {
        match (self.events.front(), self.events.back()) {
            (Some(first), Some(last)) => Some((first.sequence, last.sequence)),
            _ => None,
        }
    }

    /// Events with sequence greater than `last_seen`, in order.
    ///
    /// The `bool` is the truncation flag: true when `last_seen` lies below
    /// `min_seq - 1`, meaning events the caller never saw have been evicted.
    pub fn events_after(&self, last_seen: u64) -> (Vec<BufferedEvent>, bool) {
        let Some((min_seq, _)) = self.range() else {
            return (Vec::new(), false);
        };
        let truncated = last_seen + 1 < min_seq;
        let events = self
            .events
            .iter()
            .filter(|e| e.sequence > last_seen)
            .cloned()
            .collect();
        (events, truncated)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
