//! A single named queue of pending work.
//!
//! Items run in insertion order. Once-scheduled items are coalesced at
//! insertion time by [`JobKey`]: re-scheduling replaces the stored hook in
//! place, keeping the item's original position in the queue.

use std::backtrace::Backtrace;
use std::collections::VecDeque;
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::job::{Job, JobFn, JobKey};

pub(crate) struct Queue {
    name: Rc<str>,
    items: VecDeque<Job>,
    once: FxHashMap<JobKey, u64>,
    next_seq: u64,
}

impl Queue {
    pub fn new(name: Rc<str>) -> Self {
        Self {
            name,
            items: VecDeque::new(),
            once: FxHashMap::default(),
            next_seq: 1,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append an item. Returns its identity for cancellation.
    pub fn push(&mut self, hook: JobFn, trace: Option<Backtrace>) -> u64 {
        let seq = self.alloc_seq();
        self.items.push_back(Job {
            seq,
            hook,
            key: None,
            trace,
        });
        seq
    }

    /// Append an item with once semantics.
    ///
    /// If an item with the same key is already pending, its hook is replaced
    /// and its position and identity are kept.
    pub fn push_once(&mut self, key: JobKey, hook: JobFn, trace: Option<Backtrace>) -> u64 {
        if let Some(&seq) = self.once.get(&key) {
            if let Some(item) = self.items.iter_mut().find(|item| item.seq == seq) {
                item.hook = hook;
                item.trace = trace;
                return seq;
            }
        }
        let seq = self.alloc_seq();
        self.items.push_back(Job {
            seq,
            hook,
            key: Some(key),
            trace,
        });
        self.once.insert(key, seq);
        seq
    }

    /// Take the next item for execution, releasing its once identity.
    pub fn pop_front(&mut self) -> Option<Job> {
        let job = self.items.pop_front()?;
        if let Some(key) = job.key {
            self.once.remove(&key);
        }
        Some(job)
    }

    /// Remove a pending item by identity, preserving order of the rest.
    pub fn cancel(&mut self, seq: u64) -> bool {
        let Some(index) = self.items.iter().position(|item| item.seq == seq) else {
            return false;
        };
        if let Some(job) = self.items.remove(index) {
            if let Some(key) = job.key {
                self.once.remove(&key);
            }
        }
        true
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn alloc_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}
