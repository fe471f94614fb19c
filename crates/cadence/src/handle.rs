//! Cancellation handles returned by the scheduling entry points.

use std::rc::Weak;

use crate::deferred::DeferredActionQueues;
use crate::platform::TimerId;

/// An opaque token identifying scheduled work, accepted by
/// [`RunLoop::cancel`](crate::RunLoop::cancel).
///
/// Each scheduling flavor produces its own variant, so cancellation is a
/// match instead of runtime type sniffing.
#[derive(Debug, Clone)]
pub enum Handle {
    /// Work pending in an instance queue.
    Queued(QueuedHandle),
    /// Work pending in the delayed-execution heap.
    Later(LaterHandle),
    /// A live debounce or throttle registration.
    Rate(RateHandle),
}

/// Handle to an item enqueued with `schedule` or `schedule_once`.
///
/// Holds only a weak reference to its instance; cancelling after the
/// instance flushed and was torn down simply reports `false`.
#[derive(Debug, Clone)]
pub struct QueuedHandle {
    pub(crate) instance: Weak<DeferredActionQueues>,
    pub(crate) queue: usize,
    pub(crate) seq: u64,
}

/// Handle to an entry in the delayed-execution heap.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LaterHandle {
    pub(crate) seq: u64,
}

/// Which rate-limiting registry a [`RateHandle`] belongs to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RateKind {
    /// Registered through `throttle`.
    Throttle,
    /// Registered through `debounce`.
    Debounce,
}

/// Handle to a live debounce or throttle registration.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RateHandle {
    pub(crate) timer: TimerId,
    pub(crate) kind: RateKind,
}

impl RateHandle {
    /// The host timer backing this registration.
    pub fn timer_id(&self) -> TimerId {
        self.timer
    }

    /// Which registry the registration lives in.
    pub fn kind(&self) -> RateKind {
        self.kind
    }
}
