//! The event queue backing the [`crate::simulator::Simulator`].
//!
//! Ordered by `(expiration, insertion sequence)` so that events due at the
//! same virtual time run in the order they were scheduled, never by pointer
//! identity or hash order.

use crate::time::{SequenceNumber, Time};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// A single queued event: its ordering key plus the erased closure that runs it.
pub(crate) struct QueuedEvent {
    pub(crate) expiration: Time,
    pub(crate) uid: SequenceNumber,
    pub(crate) context: u32,
    pub(crate) callback: Option<Box<dyn FnOnce(&mut crate::simulator::Simulator)>>,
    pub(crate) is_destroy: bool,
}

/// Min-heap ordering: `BinaryHeap` is a max-heap, so we reverse the natural
/// `(expiration, uid)` comparison to pop the earliest-scheduled event first.
impl Ord for QueuedEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .expiration
            .cmp(&self.expiration)
            .then_with(|| other.uid.cmp(&self.uid))
    }
}

impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.expiration == other.expiration && self.uid == other.uid
    }
}

impl Eq for QueuedEvent {}

/// The pending-event store. Separate from cancellation bookkeeping so that
/// `cancel` stays O(1): it flips a flag kept alongside the event rather than
/// touching the heap.
#[derive(Default)]
pub(crate) struct EventQueue {
    heap: BinaryHeap<QueuedEvent>,
}

impl EventQueue {
    pub(crate) fn push(&mut self, event: QueuedEvent) {
        self.heap.push(event);
    }

    pub(crate) fn peek_expiration(&self) -> Option<Time> {
        self.heap.peek().map(|e| e.expiration)
    }

    pub(crate) fn pop(&mut self) -> Option<QueuedEvent> {
        self.heap.pop()
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// O(n) extraction used by `Simulator::remove`; the spec only promises
    /// `O(log n) or worse`, and a binary heap has no cheaper arbitrary-key
    /// removal without an auxiliary index, so we rebuild the heap.
    pub(crate) fn remove_by_uid(&mut self, uid: SequenceNumber) -> bool {
        let original_len = self.heap.len();
        let remaining: Vec<QueuedEvent> = self.heap.drain().filter(|e| e.uid != uid).collect();
        let removed = remaining.len() != original_len;
        self.heap = remaining.into_iter().collect();
        removed
    }
}
