//! Cadence: a cooperative run-loop scheduler for event-driven,
//! single-threaded hosts.
//!
//! A [`RunLoop`] coordinates deferred work across a fixed, ordered set of
//! named queues and guarantees that work scheduled from within running work
//! flushes in the same logical tick before control returns to the host.
//! Delayed execution, debouncing, and throttling all fold their fire-time
//! work back into the same queue machinery:
//!
//! - **Queues**: [`RunLoop::schedule`], [`RunLoop::schedule_once`],
//!   [`RunLoop::schedule_iterable`]
//! - **Immediate**: [`RunLoop::run`], [`RunLoop::join`]
//! - **Delayed**: [`RunLoop::later`]
//! - **Rate-limited**: [`RunLoop::debounce`], [`RunLoop::throttle`]
//!
//! The host injects its timer primitives through the [`Platform`] trait;
//! [`VirtualPlatform`] is a deterministic implementation driven manually,
//! which is also how the test-suite exercises timing behavior.
//!
//! # Example
//!
//! ```
//! use cadence::{RunLoop, VirtualPlatform};
//!
//! let platform = VirtualPlatform::new();
//! let run_loop = RunLoop::new(&["actions", "render"], platform.clone());
//!
//! let rl = run_loop.clone();
//! run_loop.run(move || {
//!     rl.schedule("render", || println!("paint")).unwrap();
//!     rl.schedule("actions", || println!("react")).unwrap();
//! });
//! // "react" printed before "paint": queues flush in declared order.
//!
//! run_loop.later(10, || println!("later"));
//! platform.advance(10); // "later" fires through the actions queue
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod deferred;
mod error;
mod events;
mod handle;
mod job;
mod queue;
mod run_loop;
mod timers;

pub mod platform;

pub use deferred::InstanceId;
pub use error::{Error, WorkError};
pub use events::{LifecycleHook, LoopEvent, SubscriptionId};
pub use handle::{Handle, LaterHandle, QueuedHandle, RateHandle, RateKind};
pub use job::{ErrorHook, JobKey, YieldHook};
pub use platform::{HostCallback, Platform, TimerId, VirtualPlatform};
pub use run_loop::{RunLoop, RunLoopOptions};
