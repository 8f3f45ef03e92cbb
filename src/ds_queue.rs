//! Pending-message priority queue.
//!
//! Messages come out in non-decreasing reception time; equal times come out in
//! enqueue order (message ids are handed out sequentially), which keeps a run
//! reproducible for a given seed.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::ds_error::SimError;
use crate::ds_interface::{Message, MessageId, SimTime};

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct EventKey {
    pub time: SimTime,
    pub id: MessageId,
}

impl Eq for EventKey {}

impl Ord for EventKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time
            .total_cmp(&other.time)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for EventKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Pending {
    key: EventKey,
    message: Message,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Pending {}

impl Ord for Pending {
    // reversed: BinaryHeap is a max-heap
    fn cmp(&self, other: &Self) -> Ordering {
        other.key.cmp(&self.key)
    }
}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
pub struct MessageQueue {
    heap: BinaryHeap<Pending>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: Message) -> Result<(), SimError> {
        let time = message
            .reception_time
            .ok_or(SimError::MissingReceptionTime(message.id))?;
        self.heap.push(Pending {
            key: EventKey { time, id: message.id },
            message,
        });
        Ok(())
    }

    pub fn pop(&mut self) -> Option<Message> {
        self.heap.pop().map(|p| p.message)
    }

    pub fn peek_time(&self) -> Option<SimTime> {
        self.heap.peek().map(|p| p.key.time)
    }

    /// Drops every pending message, returns how many were dropped.
    pub fn flush(&mut self) -> usize {
        let dropped = self.heap.len();
        self.heap.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
