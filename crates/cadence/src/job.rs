//! Work items and their guarded invocation.

use std::backtrace::Backtrace;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

use log::warn;

use crate::error::WorkError;

/// A unit of deferred work.
pub(crate) type JobFn = Box<dyn FnOnce()>;

/// Sink receiving failures from guarded work invocations.
pub type ErrorHook = Rc<dyn Fn(WorkError)>;

/// Hook polled between flushed items; returning `true` pauses the flush
/// until the next host turn.
pub type YieldHook = Rc<dyn Fn() -> bool>;

/// Coalescing identity for once-scheduled, debounced, and throttled work.
///
/// Two calls coalesce when their keys compare equal. The key pairs a receiver
/// identity (a pointer, or zero for free-standing work) with a method name,
/// mirroring how hosts usually identify "the same callback on the same
/// object".
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct JobKey {
    target: usize,
    method: &'static str,
}

impl JobKey {
    /// A key with no receiver; coalesces purely by name.
    pub fn named(method: &'static str) -> Self {
        Self { target: 0, method }
    }

    /// A key scoped to a receiver's address.
    ///
    /// The key only holds the address, never the reference, so it does not
    /// extend the receiver's lifetime. Callers are responsible for not
    /// reusing a key across receivers that happen to share an address.
    pub fn scoped<T>(target: &T, method: &'static str) -> Self {
        Self {
            target: target as *const T as usize,
            method,
        }
    }

    /// The method-name half of the key.
    pub fn method(&self) -> &'static str {
        self.method
    }
}

/// One pending item in a queue.
pub(crate) struct Job {
    pub seq: u64,
    pub hook: JobFn,
    pub key: Option<JobKey>,
    pub trace: Option<Backtrace>,
}

/// Run a work item under the configured error policy.
///
/// With a sink, a panicking item is caught and forwarded as a [`WorkError`]
/// and the pump continues. Without one the panic propagates to the host.
pub(crate) fn invoke(hook: JobFn, trace: Option<Backtrace>, sink: Option<&ErrorHook>) {
    match sink {
        Some(sink) => {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(hook)) {
                let error = WorkError::new(payload, trace);
                warn!("work item failed, routing to error sink: {error}");
                sink(error);
            }
        }
        None => hook(),
    }
}
