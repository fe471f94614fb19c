//! The ordered queue set behind one run-loop instance, and its flush.
//!
//! A flush pumps queues left to right in declared order. Work scheduled into
//! an earlier queue while a later one is draining pulls the cursor back, so
//! earlier phases always settle before later phases proceed. A flush can
//! also pause, handing control back to the host until the next turn.

use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::trace;
use rustc_hash::FxHashMap;

use crate::job::{self, ErrorHook, JobFn, JobKey, YieldHook};
use crate::queue::Queue;

/// Unique identifier of one run-loop instance.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct InstanceId(u64);

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

impl InstanceId {
    fn next() -> Self {
        InstanceId(NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric id value.
    pub fn as_u64(self) -> u64 {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn from_raw(id: u64) -> Self {
        InstanceId(id)
    }
}

/// Declared queue order shared by every instance of one run loop.
pub(crate) struct QueueLayout {
    names: Vec<Rc<str>>,
    index: FxHashMap<Rc<str>, usize>,
    default: usize,
}

impl QueueLayout {
    /// Build the layout. Queue declarations are a construction contract:
    /// an empty list, duplicate names, or an unknown default queue panic.
    pub fn new(queue_names: &[&str], default_queue: Option<&str>) -> Self {
        assert!(
            !queue_names.is_empty(),
            "a run loop needs at least one queue"
        );

        let names: Vec<Rc<str>> = queue_names.iter().map(|name| Rc::from(*name)).collect();
        let mut index = FxHashMap::default();
        for (position, name) in names.iter().enumerate() {
            let previous = index.insert(name.clone(), position);
            assert!(previous.is_none(), "duplicate queue name `{name}`");
        }

        let default = match default_queue {
            Some(name) => match index.get(name) {
                Some(&position) => position,
                None => panic!("default queue `{name}` is not a declared queue"),
            },
            None => 0,
        };

        Self {
            names,
            index,
            default,
        }
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn name(&self, index: usize) -> &str {
        &self.names[index]
    }

    pub fn default(&self) -> usize {
        self.default
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }
}

/// Result of pumping an instance's queues.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum FlushOutcome {
    /// Every queue drained to empty.
    Done,
    /// The host asked for control back; remaining items stay in place.
    Pause,
}

/// Per-flush policy supplied by the orchestrator.
pub(crate) struct FlushContext<'a> {
    pub sink: Option<&'a ErrorHook>,
    pub must_yield: Option<&'a YieldHook>,
}

/// A full set of queues for one instance of the run loop.
pub(crate) struct DeferredActionQueues {
    id: InstanceId,
    queues: Vec<RefCell<Queue>>,
}

impl DeferredActionQueues {
    pub fn new(layout: Rc<QueueLayout>) -> Rc<Self> {
        let queues = (0..layout.len())
            .map(|index| RefCell::new(Queue::new(Rc::from(layout.name(index)))))
            .collect();
        Rc::new(Self {
            id: InstanceId::next(),
            queues,
        })
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// Enqueue into the queue at `index`, coalescing when `key` is set.
    /// Returns the item's identity within that queue.
    pub fn schedule(
        &self,
        index: usize,
        hook: JobFn,
        key: Option<JobKey>,
        trace: Option<Backtrace>,
    ) -> u64 {
        let mut queue = self.queues[index].borrow_mut();
        match key {
            Some(key) => queue.push_once(key, hook, trace),
            None => queue.push(hook, trace),
        }
    }

    pub fn cancel(&self, index: usize, seq: u64) -> bool {
        self.queues[index].borrow_mut().cancel(seq)
    }

    /// Pump every queue to empty, or until the host asks for a pause.
    ///
    /// Queue borrows are released around each invocation, so running items
    /// may freely schedule more work into this instance.
    pub fn flush(&self, ctx: FlushContext<'_>) -> FlushOutcome {
        let mut cursor = 0;
        while cursor < self.queues.len() {
            loop {
                let job = self.queues[cursor].borrow_mut().pop_front();
                let Some(job) = job else { break };
                job::invoke(job.hook, job.trace, ctx.sink);
                if ctx.must_yield.is_some_and(|must_yield| must_yield()) {
                    trace!(
                        "flush pausing in `{}`",
                        self.queues[cursor].borrow().name()
                    );
                    return FlushOutcome::Pause;
                }
            }
            // Work scheduled backwards re-opens the earliest dirty queue.
            match (0..cursor).find(|&earlier| !self.queues[earlier].borrow().is_empty()) {
                Some(earlier) => cursor = earlier,
                None => cursor += 1,
            }
        }
        FlushOutcome::Done
    }
}
