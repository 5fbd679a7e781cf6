//! Bounded offline queue for outbound envelopes.
//!
//! Drop policy when full:
//! - incoming `desktop_state`: evict the oldest non-state entry, or failing
//!   that the oldest state entry (the newest snapshot always wins);
//! - anything else: evict the oldest non-state entry, or reject the new
//!   envelope if the queue holds only state reports.

use std::collections::VecDeque;

use dl_protocol::{Envelope, MessageType};

use crate::types::SendError;

/// Outcome of a successful [`PendingQueue::push`].
#[derive(Debug, PartialEq)]
pub enum Enqueued {
    Queued,
    /// Queued after evicting this older entry.
    Evicted(Envelope),
}

#[derive(Debug)]
pub struct PendingQueue {
    entries: VecDeque<Envelope>,
    capacity: usize,
}

fn is_state_report(kind: &MessageType) -> bool {
    *kind == MessageType::DesktopState
}

impl PendingQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn push(&mut self, envelope: Envelope) -> Result<Enqueued, SendError> {
        if envelope.kind.is_transient() {
            return Err(SendError::NotConnected(envelope.kind));
        }
        if self.capacity == 0 {
            return Err(SendError::QueueFull(envelope.kind));
        }
        if self.entries.len() < self.capacity {
            self.entries.push_back(envelope);
            return Ok(Enqueued::Queued);
        }

        let victim = self
            .entries
            .iter()
            .position(|e| !is_state_report(&e.kind))
            .or_else(|| is_state_report(&envelope.kind).then_some(0));

        match victim.and_then(|i| self.entries.remove(i)) {
            Some(evicted) => {
                self.entries.push_back(envelope);
                Ok(Enqueued::Evicted(evicted))
            }
            None => Err(SendError::QueueFull(envelope.kind)),
        }
    }

    /// Remove every entry, oldest first.
    pub fn drain(&mut self) -> Vec<Envelope> {
        self.entries.drain(..).collect()
    }

    /// Put entries back at the front, keeping their relative order.
    /// Used when a flush is interrupted.
    pub fn restore(&mut self, entries: Vec<Envelope>) {
        for envelope in entries.into_iter().rev() {
            self.entries.push_front(envelope);
        }
        while self.entries.len() > self.capacity {
            self.entries.pop_back();
        }
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

    pub fn iter(&self) -> impl Iterator<Item = &Envelope> {
        self.entries.iter()
    }
}
