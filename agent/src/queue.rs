//! Bounded FIFO buffer of pending events.
//!
//! - New events enter at the tail; at capacity the oldest event is evicted first
//! - A flush drains the entire contents at once
//! - Retried events re-enter at the head in their original order; if that
//!   overflows, the newest events are dropped from the tail

use std::collections::VecDeque;

use tracing::warn;

use crate::types::Event;

/// Bounded event queue.
#[derive(Debug)]
pub struct EventQueue {
    events: VecDeque<Event>,
    capacity: usize,
}

impl EventQueue {
    /// Creates a queue holding at most `capacity` events (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends an event, evicting the oldest ones if the queue is full.
    ///
    /// # Returns
    ///
    /// The evicted events (empty if the queue had space).
    pub fn push(&mut self, event: Event) -> Vec<Event> {
        let mut evicted = Vec::new();

        while self.events.len() >= self.capacity {
            if let Some(oldest) = self.events.pop_front() {
                evicted.push(oldest);
            }
        }

        self.events.push_back(event);

        if !evicted.is_empty() {
            warn!(evicted_count = evicted.len(), "Queue full, oldest events evicted");
        }

        evicted
    }

    /// Removes and returns every queued event, oldest first.
    pub fn drain_all(&mut self) -> Vec<Event> {
        self.events.drain(..).collect()
    }

    /// Re-inserts events at the head, preserving their relative order.
    ///
    /// # Returns
    ///
    /// Events truncated from the tail to stay within capacity.
    pub fn requeue_front(&mut self, retried: Vec<Event>) -> Vec<Event> {
        for event in retried.into_iter().rev() {
            self.events.push_front(event);
        }

        let keep = self.events.len().min(self.capacity);
        let truncated: Vec<Event> = self.events.drain(keep..).collect();

        if !truncated.is_empty() {
            warn!(
                truncated_count = truncated.len(),
                "Queue full after retry re-insertion, newest events dropped"
            );
        }

        truncated
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Iterates over queued events, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }
}
