//! Error types for run-loop misuse and failed work items.

use std::any::Any;
use std::backtrace::Backtrace;
use std::fmt;

use thiserror::Error;

use crate::events::LoopEvent;

/// Errors raised by incorrect use of the run-loop API.
///
/// These are caller mistakes, reported synchronously. Failures *inside*
/// scheduled work are a separate category, see [`WorkError`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// `end` was called while no instance was open.
    #[error("`end` called without a matching `begin`")]
    EndWithoutBegin,

    /// A scheduling call named a queue that was not declared at construction.
    #[error("no queue named `{0}` is declared on this run loop")]
    UnknownQueue(String),

    /// `off` was called with a subscription that is not registered for the event.
    #[error("subscription is not registered for the {0:?} event")]
    UnknownSubscription(LoopEvent),
}

/// A failure captured from a scheduled work item.
///
/// When an error sink is configured, every work invocation is guarded and a
/// panicking item is converted into a `WorkError` carrying the panic payload.
/// Items scheduled while debug capture was enabled also carry a backtrace of
/// the scheduling site, which is usually more useful for diagnosis than the
/// panic site itself.
pub struct WorkError {
    payload: Box<dyn Any + Send>,
    scheduled_at: Option<Backtrace>,
}

impl WorkError {
    pub(crate) fn new(payload: Box<dyn Any + Send>, scheduled_at: Option<Backtrace>) -> Self {
        Self {
            payload,
            scheduled_at,
        }
    }

    /// Best-effort rendering of the panic message.
    pub fn message(&self) -> &str {
        if let Some(message) = self.payload.downcast_ref::<&'static str>() {
            message
        } else if let Some(message) = self.payload.downcast_ref::<String>() {
            message
        } else {
            "work item panicked"
        }
    }

    /// Backtrace of the call that scheduled the failed item, when debug
    /// capture was enabled at scheduling time.
    pub fn scheduled_at(&self) -> Option<&Backtrace> {
        self.scheduled_at.as_ref()
    }

    /// The raw panic payload.
    pub fn into_payload(self) -> Box<dyn Any + Send> {
        self.payload
    }
}

impl fmt::Debug for WorkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkError")
            .field("message", &self.message())
            .field("scheduled_at", &self.scheduled_at.is_some())
            .finish()
    }
}

impl fmt::Display for WorkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}
