#![doc(issue_tracker_base_url = "https://github.com/tgen-rs/tgen/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

use std::time::Duration;

mod rate;
pub use rate::{DataRate, ParseRateError};

mod sim;
pub use sim::Simulator;

/// A deferred unit of work handed to a [`Scheduler`].
pub type Callback = Box<dyn FnOnce()>;

/// Handle to a scheduled event. Only meaningful to the scheduler that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(u64);

impl EventId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn id(&self) -> u64 {
        self.0
    }
}

/// The simulated clock and timer queue that drives every component.
///
/// All time values are offsets from the start of the simulation. Implementations
/// must never run a callback from inside [`Scheduler::schedule`] or
/// [`Scheduler::cancel`]; callbacks only run when the owner advances the clock.
pub trait Scheduler {
    /// Schedules `callback` to run `delay` after the current simulated time.
    fn schedule(&self, delay: Duration, callback: Callback) -> EventId;

    /// Cancels a pending event. Returns `true` if the event was still pending.
    /// Cancelling an event that already ran (or was already cancelled) is a no-op.
    fn cancel(&self, id: EventId) -> bool;

    /// Returns the current simulated time.
    fn now(&self) -> Duration;
}

#[allow(non_upper_case_globals)]
pub mod constants {
    pub const KiB: u32 = 1024;
    pub const MiB: u32 = 1024 * KiB;
    pub const GiB: u32 = 1024 * MiB;
}
