//! The discrete-event kernel: single-threaded cooperative scheduling over
//! virtual time, in the ns-3 `Simulator` tradition.
//!
//! Every protocol action in this crate (§ the Zigbee NWK/APS layers) is
//! ultimately a closure scheduled here. Nothing in this module knows about
//! Zigbee; it only knows how to order and dispatch erased callbacks.

use crate::scheduler::{EventQueue, QueuedEvent};
use crate::time::{EventId, SequenceNumber, Time, NO_CONTEXT};
use log::{debug, trace};
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventState {
    Pending,
    Cancelled,
    Ran,
    Removed,
}

/// Owns the event queue, the current virtual-time clock, and the current
/// scheduling context. There is exactly one of these per simulation run.
pub struct Simulator {
    now: Time,
    context: u32,
    next_uid: SequenceNumber,
    queue: EventQueue,
    destroy_queue: VecDeque<QueuedEvent>,
    destroy_uids: std::collections::HashSet<SequenceNumber>,
    state: HashMap<SequenceNumber, EventState>,
    event_count: u64,
    stop_requested: bool,
    stop_time: Option<Time>,
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Simulator {
    pub fn new() -> Self {
        Simulator {
            now: Time::ZERO,
            context: NO_CONTEXT,
            next_uid: 1,
            queue: EventQueue::default(),
            destroy_queue: VecDeque::new(),
            destroy_uids: Default::default(),
            state: HashMap::new(),
            event_count: 0,
            stop_requested: false,
            stop_time: None,
        }
    }

    pub fn now(&self) -> Time {
        self.now
    }

    pub fn context(&self) -> u32 {
        self.context
    }

    pub fn event_count(&self) -> u64 {
        self.event_count
    }

    fn alloc_uid(&mut self) -> SequenceNumber {
        let uid = self.next_uid;
        self.next_uid += 1;
        uid
    }

    /// Schedule `callback` to run `delay` ticks from now, inheriting the
    /// currently-executing event's context.
    pub fn schedule<F>(&mut self, delay: Time, callback: F) -> EventId
    where
        F: FnOnce(&mut Simulator) + 'static,
    {
        self.schedule_with_context(self.context, delay, callback)
    }

    /// Equivalent to `schedule(Time::ZERO, callback)`.
    pub fn schedule_now<F>(&mut self, callback: F) -> EventId
    where
        F: FnOnce(&mut Simulator) + 'static,
    {
        self.schedule(Time::ZERO, callback)
    }

    /// Schedule `callback` to run under an explicit context rather than the
    /// current one. This is the only primitive this crate's contract permits
    /// calling from outside the loop driving `run()`.
    pub fn schedule_with_context<F>(&mut self, ctx: u32, delay: Time, callback: F) -> EventId
    where
        F: FnOnce(&mut Simulator) + 'static,
    {
        if delay.0 < 0 {
            panic!("fatal: Simulator::schedule called with a negative delay");
        }
        let uid = self.alloc_uid();
        let expiration = self.now.saturating_add(delay);
        self.state.insert(uid, EventState::Pending);
        self.queue.push(QueuedEvent {
            expiration,
            uid,
            context: ctx,
            callback: Some(Box::new(callback)),
            is_destroy: false,
        });
        trace!("scheduled event uid={uid} at {expiration} ctx={ctx}");
        EventId {
            uid,
            expiration,
            context: ctx,
        }
    }

    /// Schedule `callback` to run only when `destroy()` is called. Destroy
    /// events cannot be cancelled or removed.
    pub fn schedule_destroy<F>(&mut self, callback: F) -> EventId
    where
        F: FnOnce(&mut Simulator) + 'static,
    {
        let uid = self.alloc_uid();
        self.destroy_uids.insert(uid);
        self.state.insert(uid, EventState::Pending);
        self.destroy_queue.push_back(QueuedEvent {
            expiration: self.now,
            uid,
            context: self.context,
            callback: Some(Box::new(callback)),
            is_destroy: true,
        });
        EventId {
            uid,
            expiration: self.now,
            context: self.context,
        }
    }

    /// O(1) flag flip. The event stays in the queue but its callback will
    /// not run. Idempotent; a no-op on an already-expired event.
    pub fn cancel(&mut self, id: EventId) {
        if self.destroy_uids.contains(&id.uid()) {
            panic!("fatal: attempted to cancel a destroy-time event");
        }
        if let Some(s) = self.state.get_mut(&id.uid()) {
            if *s == EventState::Pending {
                *s = EventState::Cancelled;
            }
        }
    }

    /// Extracts the event from the queue outright, freeing its closure
    /// immediately rather than waiting for the queue to reach it.
    pub fn remove(&mut self, id: EventId) -> bool {
        if self.destroy_uids.contains(&id.uid()) {
            panic!("fatal: cannot remove a destroy-time event");
        }
        let was_pending = matches!(self.state.get(&id.uid()), Some(EventState::Pending));
        if was_pending {
            self.queue.remove_by_uid(id.uid());
            self.state.insert(id.uid(), EventState::Removed);
        }
        was_pending
    }

    /// True once the event has run, been cancelled, or been removed.
    pub fn is_expired(&self, id: EventId) -> bool {
        !matches!(self.state.get(&id.uid()), Some(EventState::Pending))
    }

    pub fn is_pending(&self, id: EventId) -> bool {
        matches!(self.state.get(&id.uid()), Some(EventState::Pending))
    }

    /// Remaining ticks until `id` would fire, or zero if it is not pending.
    pub fn delay_left(&self, id: EventId) -> Time {
        if self.is_pending(id) {
            id.scheduled_time().saturating_sub(self.now)
        } else {
            Time::ZERO
        }
    }

    /// The currently running (or just-finished) event becomes the last one
    /// `run()` will dispatch.
    pub fn stop(&mut self) {
        self.stop_requested = true;
    }

    /// Schedules a deadline at `now + delay`; `run()` returns once the next
    /// pending event's expiration would reach or pass it.
    pub fn stop_after(&mut self, delay: Time) {
        if delay.0 < 0 {
            panic!("fatal: Simulator::stop_after called with a negative delay");
        }
        self.stop_time = Some(self.now.saturating_add(delay));
    }

    pub fn is_finished(&self) -> bool {
        self.stop_requested
            || match (self.queue.peek_expiration(), self.stop_time) {
                (None, _) => true,
                (Some(next), Some(deadline)) => next >= deadline,
                (Some(_), None) => false,
            }
    }

    /// Drains the queue in (expiration, insertion-sequence) order until it is
    /// empty, a stop deadline is reached, or `stop()` was called.
    pub fn run(&mut self) {
        loop {
            if self.stop_requested {
                self.stop_requested = false;
                break;
            }
            let Some(next_expiration) = self.queue.peek_expiration() else {
                break;
            };
            if let Some(deadline) = self.stop_time {
                if next_expiration >= deadline {
                    break;
                }
            }
            let event = self.queue.pop().expect("peeked event vanished");
            self.dispatch(event);
        }
    }

    fn dispatch(&mut self, event: QueuedEvent) {
        self.now = event.expiration;
        self.context = event.context;
        let cancelled = matches!(self.state.get(&event.uid), Some(EventState::Cancelled));
        if cancelled {
            debug!("skipping cancelled event uid={}", event.uid);
            return;
        }
        self.state.insert(event.uid, EventState::Ran);
        self.event_count += 1;
        if let Some(callback) = event.callback {
            callback(self);
        }
    }

    /// Flushes destroy-time events in FIFO order, then resets all kernel
    /// state so a fresh `run()` is possible.
    pub fn destroy(&mut self) {
        while let Some(event) = self.destroy_queue.pop_front() {
            self.now = event.expiration;
            self.context = event.context;
            self.event_count += 1;
            if let Some(callback) = event.callback {
                callback(self);
            }
        }
        self.queue = EventQueue::default();
        self.state.clear();
        self.destroy_uids.clear();
        self.now = Time::ZERO;
        self.context = NO_CONTEXT;
        self.next_uid = 1;
        self.event_count = 0;
        self.stop_requested = false;
        self.stop_time = None;
    }

    pub fn pending_event_count(&self) -> usize {
        self.queue.len()
    }

    pub fn queue_is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn events_at_same_time_run_in_scheduling_order() {
        let mut sim = Simulator::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        for label in ["A", "B", "C"] {
            let order = order.clone();
            sim.schedule(Time::ZERO, move |_| order.borrow_mut().push(label));
        }
        sim.run();
        assert_eq!(*order.borrow(), vec!["A", "B", "C"]);
    }

    #[test]
    fn cancel_removes_event_from_observable_order() {
        let mut sim = Simulator::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        let o = order.clone();
        sim.schedule(Time::ZERO, move |_| o.borrow_mut().push("A"));
        let b_order = order.clone();
        let b = sim.schedule(Time::ZERO, move |_| b_order.borrow_mut().push("B"));
        let o = order.clone();
        sim.schedule(Time::ZERO, move |_| o.borrow_mut().push("C"));

        sim.cancel(b);
        assert!(sim.is_expired(b));

        sim.run();
        assert_eq!(*order.borrow(), vec!["A", "C"]);
        assert_eq!(sim.event_count(), 2);
    }

    #[test]
    fn remove_shrinks_the_queue_immediately() {
        let mut sim = Simulator::new();
        let id = sim.schedule(Time(10), |_| {});
        assert_eq!(sim.pending_event_count(), 1);
        assert!(sim.remove(id));
        assert_eq!(sim.pending_event_count(), 0);
        assert!(sim.is_expired(id));
    }

    #[test]
    fn now_is_monotonic_and_matches_expiration() {
        let mut sim = Simulator::new();
        let times = Rc::new(RefCell::new(Vec::new()));
        for delay in [30, 10, 20] {
            let times = times.clone();
            sim.schedule(Time(delay), move |s| times.borrow_mut().push(s.now()));
        }
        sim.run();
        assert_eq!(*times.borrow(), vec![Time(10), Time(20), Time(30)]);
    }

    #[test]
    fn stop_makes_the_current_event_the_last_one() {
        let mut sim = Simulator::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            sim.schedule(Time(i), move |s| {
                order.borrow_mut().push(i);
                if i == 1 {
                    s.stop();
                }
            });
        }
        sim.run();
        assert_eq!(*order.borrow(), vec![0, 1]);
    }

    #[test]
    fn schedule_with_context_tags_the_event() {
        let mut sim = Simulator::new();
        let seen_ctx = Rc::new(RefCell::new(None));
        let seen = seen_ctx.clone();
        sim.schedule_with_context(7, Time::ZERO, move |s| *seen.borrow_mut() = Some(s.context()));
        sim.run();
        assert_eq!(*seen_ctx.borrow(), Some(7));
    }

    #[test]
    fn destroy_events_run_only_on_destroy_in_fifo_order() {
        let mut sim = Simulator::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for label in ["first", "second"] {
            let order = order.clone();
            sim.schedule_destroy(move |_| order.borrow_mut().push(label));
        }
        sim.schedule(Time::ZERO, |_| {});
        sim.run();
        assert!(order.borrow().is_empty());
        sim.destroy();
        assert_eq!(*order.borrow(), vec!["first", "second"]);
    }

    #[test]
    #[should_panic(expected = "negative delay")]
    fn negative_delay_is_fatal() {
        let mut sim = Simulator::new();
        sim.schedule(Time(-1), |_| {});
    }

    #[test]
    #[should_panic(expected = "cannot remove a destroy-time event")]
    fn removing_a_destroy_event_is_fatal() {
        let mut sim = Simulator::new();
        let id = sim.schedule_destroy(|_| {});
        sim.remove(id);
    }
}
