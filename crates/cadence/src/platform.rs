//! Host platform adapter.
//!
//! The run loop never talks to wall-clock timers directly. The embedder
//! injects a [`Platform`] implementation providing one-shot timers, a
//! next-turn hook, and a monotone millisecond clock. [`VirtualPlatform`] is a
//! deterministic implementation driven manually by the embedder (or a test),
//! with a virtual clock that only moves when asked to.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use log::trace;

/// A callback handed to the host for later delivery.
pub type HostCallback = Box<dyn FnOnce()>;

/// Identifier of a host timer armed through a [`Platform`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    /// Get the numeric id value.
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Create a `TimerId` from a raw value.
    pub fn from_u64(id: u64) -> Self {
        TimerId(id)
    }
}

/// Timer primitives supplied by the embedding host.
///
/// All callbacks must be delivered on the host's single logical thread of
/// execution, between turns of whatever loop drives the host.
pub trait Platform {
    /// Arm a one-shot timer firing `callback` after `wait_ms` milliseconds.
    fn set_timeout(&self, wait_ms: u64, callback: HostCallback) -> TimerId;

    /// Disarm a timer. Unknown or already-fired ids are ignored.
    fn clear_timeout(&self, id: TimerId);

    /// Schedule `callback` on the next host turn.
    ///
    /// The default forwards to `set_timeout(0, ..)`, which is the host
    /// behavior most embedders want.
    fn next(&self, callback: HostCallback) -> TimerId {
        self.set_timeout(0, callback)
    }

    /// Disarm a callback scheduled with [`Platform::next`].
    fn clear_next(&self, id: TimerId) {
        self.clear_timeout(id);
    }

    /// Current time in milliseconds. Must be monotone non-decreasing.
    fn now(&self) -> u64;
}

struct VirtualTimer {
    id: TimerId,
    due: u64,
    callback: HostCallback,
}

/// A deterministic host with a virtual clock.
///
/// Timers fire only when the embedder advances the clock with
/// [`VirtualPlatform::advance`] or delivers a single callback with
/// [`VirtualPlatform::step`]. Callbacks armed *during* an advance are fired
/// within the same advance if they come due before it ends, matching how a
/// real host drains chained zero-delay timers turn after turn.
pub struct VirtualPlatform {
    now: Cell<u64>,
    next_id: Cell<u64>,
    timers: RefCell<Vec<VirtualTimer>>,
}

impl VirtualPlatform {
    /// Create a new virtual host at time zero.
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            now: Cell::new(0),
            next_id: Cell::new(1),
            timers: RefCell::new(Vec::new()),
        })
    }

    /// Move the clock forward by `ms`, firing every callback that comes due.
    ///
    /// Callbacks fire in `(due, arming-order)` order, and the clock reads as
    /// each callback's due time while it runs.
    pub fn advance(&self, ms: u64) {
        let target = self.now.get().saturating_add(ms);
        while let Some(timer) = self.take_earliest(target) {
            if timer.due > self.now.get() {
                self.now.set(timer.due);
            }
            (timer.callback)();
        }
        self.now.set(target);
    }

    /// Fire exactly one callback that is due at the current clock reading.
    ///
    /// Returns `false` when nothing is due. Useful for driving the host one
    /// turn at a time.
    pub fn step(&self) -> bool {
        match self.take_earliest(self.now.get()) {
            Some(timer) => {
                (timer.callback)();
                true
            }
            None => false,
        }
    }

    /// Number of armed callbacks, due or not.
    pub fn pending(&self) -> usize {
        self.timers.borrow().len()
    }

    fn take_earliest(&self, up_to: u64) -> Option<VirtualTimer> {
        let index = {
            let timers = self.timers.borrow();
            timers
                .iter()
                .enumerate()
                .filter(|(_, timer)| timer.due <= up_to)
                .min_by_key(|(_, timer)| (timer.due, timer.id))
                .map(|(index, _)| index)
        };
        index.map(|index| self.timers.borrow_mut().remove(index))
    }
}

impl Platform for VirtualPlatform {
    fn set_timeout(&self, wait_ms: u64, callback: HostCallback) -> TimerId {
        let id = TimerId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        let due = self.now.get().saturating_add(wait_ms);
        trace!("virtual timer {} armed for t={}", id.0, due);
        self.timers.borrow_mut().push(VirtualTimer { id, due, callback });
        id
    }

    fn clear_timeout(&self, id: TimerId) {
        self.timers.borrow_mut().retain(|timer| timer.id != id);
    }

    fn now(&self) -> u64 {
        self.now.get()
    }
}
