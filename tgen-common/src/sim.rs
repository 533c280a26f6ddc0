use std::{
    cell::RefCell,
    cmp::Reverse,
    collections::BinaryHeap,
    fmt,
    rc::Rc,
    time::Duration,
};

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::{Callback, EventId, Scheduler};

/// A deterministic, single-threaded discrete-event loop.
///
/// `Simulator` is a cheap handle: clones share the same clock and queue. Events
/// scheduled for the same instant run in the order they were scheduled.
#[derive(Clone, Default)]
pub struct Simulator {
    queue: Rc<RefCell<EventQueue>>,
}

#[derive(Default)]
struct EventQueue {
    /// Current simulated time.
    now: Duration,
    /// Next event sequence number, doubles as the [`EventId`].
    seq: u64,
    /// Min-heap on (deadline, seq).
    heap: BinaryHeap<Reverse<(Duration, u64)>>,
    /// Callbacks of pending events. Cancellation removes the entry, the heap
    /// slot is discarded lazily when it surfaces.
    callbacks: FxHashMap<u64, Callback>,
    /// Number of callbacks that ran.
    executed: u64,
}

impl EventQueue {
    /// Pops the next live event whose deadline is not after `limit`.
    fn pop_due(&mut self, limit: Option<Duration>) -> Option<(Duration, u64, Callback)> {
        while let Some(Reverse((at, seq))) = self.heap.peek().copied() {
            if limit.is_some_and(|limit| at > limit) {
                return None;
            }

            self.heap.pop();
            if let Some(callback) = self.callbacks.remove(&seq) {
                return Some((at, seq, callback));
            }
        }

        None
    }
}

impl Simulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs the next pending event, advancing the clock to its deadline.
    /// Returns `false` if no event was pending.
    pub fn step(&self) -> bool {
        self.step_until(None)
    }

    /// Runs events until the queue is empty.
    pub fn run(&self) {
        while self.step() {}
    }

    /// Runs every event due at or before `deadline`, then advances the clock to
    /// `deadline`. Events scheduled after `deadline` stay queued.
    pub fn run_until(&self, deadline: Duration) {
        while self.step_until(Some(deadline)) {}

        let mut queue = self.queue.borrow_mut();
        if queue.now < deadline {
            queue.now = deadline;
        }
    }

    /// Runs events for `duration` of simulated time from now.
    pub fn run_for(&self, duration: Duration) {
        let deadline = self.now() + duration;
        self.run_until(deadline);
    }

    /// Number of events that are scheduled and not cancelled.
    pub fn pending(&self) -> usize {
        self.queue.borrow().callbacks.len()
    }

    /// Number of callbacks executed so far.
    pub fn executed(&self) -> u64 {
        self.queue.borrow().executed
    }

    fn step_until(&self, limit: Option<Duration>) -> bool {
        // The queue borrow must end before the callback runs: callbacks schedule
        // and cancel events on this same queue.
        let next = {
            let mut queue = self.queue.borrow_mut();
            let next = queue.pop_due(limit);
            if let Some((at, _, _)) = next {
                queue.now = at;
                queue.executed += 1;
            }
            next
        };

        match next {
            Some((at, seq, callback)) => {
                trace!(event = seq, at = ?at, "Running event");
                callback();
                true
            }
            None => false,
        }
    }
}

impl Scheduler for Simulator {
    fn schedule(&self, delay: Duration, callback: Callback) -> EventId {
        let mut queue = self.queue.borrow_mut();
        let seq = queue.seq;
        queue.seq += 1;

        let at = queue.now.saturating_add(delay);
        queue.heap.push(Reverse((at, seq)));
        queue.callbacks.insert(seq, callback);

        EventId::new(seq)
    }

    fn cancel(&self, id: EventId) -> bool {
        self.queue.borrow_mut().callbacks.remove(&id.id()).is_some()
    }

    fn now(&self) -> Duration {
        self.queue.borrow().now
    }
}

impl fmt::Debug for Simulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queue = self.queue.borrow();
        f.debug_struct("Simulator")
            .field("now", &queue.now)
            .field("pending", &queue.callbacks.len())
            .field("executed", &queue.executed)
            .finish()
    }
}
