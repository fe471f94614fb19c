//! Delayed-execution bookkeeping: the sorted timer heap and the
//! debounce/throttle registries.
//!
//! The heap is a flat vector kept sorted by deadline, so the earliest entry
//! is always at the front and a single host timer can be armed for it. The
//! registries are small flat lists searched linearly, both by coalescing key
//! and by host timer id.

use smallvec::SmallVec;

use crate::job::{JobFn, JobKey};
use crate::platform::TimerId;

/// One delayed work item.
pub(crate) struct TimerEntry {
    pub at: u64,
    pub seq: u64,
    pub hook: JobFn,
}

/// Pending delayed work, sorted ascending by `(deadline, insertion order)`.
#[derive(Default)]
pub(crate) struct TimerHeap {
    entries: Vec<TimerEntry>,
}

impl TimerHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert at the sorted position. Returns true when the new entry became
    /// the earliest, meaning the armed host timer must be re-targeted.
    pub fn insert(&mut self, at: u64, seq: u64, hook: JobFn) -> bool {
        let index = self.entries.partition_point(|entry| entry.at <= at);
        self.entries.insert(index, TimerEntry { at, seq, hook });
        debug_assert!(self.is_sorted());
        index == 0
    }

    /// The earliest deadline, if any work is pending.
    pub fn next_deadline(&self) -> Option<u64> {
        self.entries.first().map(|entry| entry.at)
    }

    /// Remove and return every entry due at or before `now`, earliest first.
    pub fn pop_due(&mut self, now: u64) -> Vec<TimerEntry> {
        let due = self.entries.partition_point(|entry| entry.at <= now);
        self.entries.drain(..due).collect()
    }

    /// Remove an entry by identity. Returns whether it was the earliest, or
    /// `None` when the entry already fired or was cancelled.
    pub fn remove(&mut self, seq: u64) -> Option<bool> {
        let index = self.entries.iter().position(|entry| entry.seq == seq)?;
        self.entries.remove(index);
        debug_assert!(self.is_sorted());
        Some(index == 0)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn is_sorted(&self) -> bool {
        self.entries
            .windows(2)
            .all(|pair| pair[0].at <= pair[1].at)
    }
}

/// One live debounce or throttle registration.
pub(crate) struct RateEntry {
    pub key: JobKey,
    pub timer: TimerId,
    /// Registration identity; lets the fire path release exactly the
    /// registration that armed it, even if the key was re-registered since.
    pub nonce: u64,
    /// Trailing-edge work; `None` when the leading edge already ran it.
    pub hook: Option<JobFn>,
}

/// Flat list of live registrations for one rate-limiting flavor.
#[derive(Default)]
pub(crate) struct RateRegistry {
    entries: SmallVec<[RateEntry; 4]>,
}

impl RateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn timer_for(&self, key: JobKey) -> Option<TimerId> {
        self.entries
            .iter()
            .find(|entry| entry.key == key)
            .map(|entry| entry.timer)
    }

    pub fn insert(&mut self, entry: RateEntry) {
        self.entries.push(entry);
    }

    /// Take the trailing-edge hook while keeping the registration live.
    pub fn take_hook(&mut self, nonce: u64) -> Option<JobFn> {
        self.entries
            .iter_mut()
            .find(|entry| entry.nonce == nonce)
            .and_then(|entry| entry.hook.take())
    }

    pub fn remove_by_key(&mut self, key: JobKey) -> Option<RateEntry> {
        let index = self.entries.iter().position(|entry| entry.key == key)?;
        Some(self.entries.remove(index))
    }

    pub fn remove_by_nonce(&mut self, nonce: u64) -> Option<RateEntry> {
        let index = self.entries.iter().position(|entry| entry.nonce == nonce)?;
        Some(self.entries.remove(index))
    }

    pub fn remove_by_timer(&mut self, timer: TimerId) -> Option<RateEntry> {
        let index = self.entries.iter().position(|entry| entry.timer == timer)?;
        Some(self.entries.remove(index))
    }

    /// Drop every registration, yielding the host timers that back them.
    pub fn drain_timers(&mut self) -> SmallVec<[TimerId; 4]> {
        self.entries.drain(..).map(|entry| entry.timer).collect()
    }
}
