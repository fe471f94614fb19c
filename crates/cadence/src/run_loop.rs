//! The run-loop orchestrator.
//!
//! [`RunLoop`] owns the instance stack, the autorun, the delayed-execution
//! heap, the debounce/throttle registries, and the lifecycle event table. All
//! public scheduling entry points route work either into the current
//! instance's queues or into timers that fold their fire-time work back into
//! those queues.
//!
//! The loop is strictly single-threaded and cooperative: callbacks handed to
//! the host platform capture weak references, and no internal borrow is held
//! across a work invocation, so running work may freely schedule more work.

use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use log::{debug, trace, warn};

use crate::deferred::{DeferredActionQueues, FlushContext, FlushOutcome, InstanceId, QueueLayout};
use crate::error::{Error, WorkError};
use crate::events::{EventTable, LifecycleHook, LoopEvent, SubscriptionId};
use crate::handle::{Handle, LaterHandle, QueuedHandle, RateHandle, RateKind};
use crate::job::{ErrorHook, JobFn, JobKey, YieldHook};
use crate::platform::Platform;
use crate::timers::{RateEntry, RateRegistry, TimerHeap};

/// Construction-time configuration for a [`RunLoop`].
#[derive(Default)]
pub struct RunLoopOptions {
    /// Queue that absorbs expired [`RunLoop::later`] work. Defaults to the
    /// first declared queue.
    pub default_queue: Option<String>,
    /// Start with debug capture of scheduling-site backtraces enabled.
    pub debug: bool,
    /// Invoked after every `begin`, explicit or implicit, with
    /// `(current, previous)`.
    pub on_begin: Option<LifecycleHook>,
    /// Invoked after every non-paused `end` with `(just_ended, next_current)`.
    pub on_end: Option<LifecycleHook>,
    /// When set, every work invocation is guarded and failures are diverted
    /// here instead of aborting the pump.
    pub on_error: Option<ErrorHook>,
    /// Polled between flushed items; returning `true` pauses the flush and
    /// yields to the host until the next turn.
    pub must_yield: Option<YieldHook>,
}

struct Inner {
    layout: Rc<QueueLayout>,
    platform: Rc<dyn Platform>,

    // -- Instance lifecycle --
    current: RefCell<Option<Rc<DeferredActionQueues>>>,
    stack: RefCell<Vec<Rc<DeferredActionQueues>>>,
    autorun: Cell<Option<crate::platform::TimerId>>,

    // -- Delayed execution --
    timers: RefCell<TimerHeap>,
    expiry: Cell<Option<crate::platform::TimerId>>,
    later_seq: Cell<u64>,

    // -- Rate limiting --
    throttlers: RefCell<RateRegistry>,
    debouncers: RefCell<RateRegistry>,
    rate_nonce: Cell<u64>,

    // -- Hooks and events --
    events: RefCell<EventTable>,
    on_begin: Option<LifecycleHook>,
    on_end: Option<LifecycleHook>,
    on_error: RefCell<Option<ErrorHook>>,
    must_yield: Option<YieldHook>,

    debug: Cell<bool>,
}

/// A cooperative run-loop scheduler for a single-threaded host.
///
/// Cloning produces another handle to the same loop.
#[derive(Clone)]
pub struct RunLoop {
    inner: Rc<Inner>,
}

impl RunLoop {
    /// Create a run loop with the given queue order and host platform.
    ///
    /// # Panics
    ///
    /// Panics when `queue_names` is empty or contains duplicates; queue
    /// declarations are a construction contract, not a runtime condition.
    pub fn new(queue_names: &[&str], platform: Rc<dyn Platform>) -> Self {
        Self::with_options(queue_names, platform, RunLoopOptions::default())
    }

    /// Create a run loop with explicit [`RunLoopOptions`].
    ///
    /// # Panics
    ///
    /// Panics on the same construction mistakes as [`RunLoop::new`], and when
    /// `default_queue` names an undeclared queue.
    pub fn with_options(
        queue_names: &[&str],
        platform: Rc<dyn Platform>,
        options: RunLoopOptions,
    ) -> Self {
        let layout = Rc::new(QueueLayout::new(
            queue_names,
            options.default_queue.as_deref(),
        ));
        RunLoop {
            inner: Rc::new(Inner {
                layout,
                platform,
                current: RefCell::new(None),
                stack: RefCell::new(Vec::new()),
                autorun: Cell::new(None),
                timers: RefCell::new(TimerHeap::new()),
                expiry: Cell::new(None),
                later_seq: Cell::new(0),
                throttlers: RefCell::new(RateRegistry::new()),
                debouncers: RefCell::new(RateRegistry::new()),
                rate_nonce: Cell::new(0),
                events: RefCell::new(EventTable::new()),
                on_begin: options.on_begin,
                on_end: options.on_end,
                on_error: RefCell::new(options.on_error),
                must_yield: options.must_yield,
                debug: Cell::new(options.debug),
            }),
        }
    }

    // ========================================================================
    // Instance lifecycle
    // ========================================================================

    /// Make an instance current.
    ///
    /// When the autorun is pending, the implicitly opened instance is joined:
    /// the autorun is cancelled and no fresh instance (or `Begin` event) is
    /// produced. Otherwise any current instance is pushed onto the stack and
    /// a fresh one becomes current.
    pub fn begin(&self) -> InstanceId {
        let previous = self.inner.current.borrow().clone();
        let previous_id = previous.as_ref().map(|instance| instance.id());

        let current = match (self.inner.autorun.take(), previous) {
            (Some(token), Some(instance)) => {
                // join the instance the autorun opened implicitly
                self.inner.platform.clear_next(token);
                instance
            }
            (pending, previous) => {
                if let Some(token) = pending {
                    self.inner.platform.clear_next(token);
                }
                if let Some(previous) = previous {
                    self.inner.stack.borrow_mut().push(previous);
                }
                let instance = DeferredActionQueues::new(self.inner.layout.clone());
                *self.inner.current.borrow_mut() = Some(instance.clone());
                debug!("instance {} began", instance.id().as_u64());
                self.emit(LoopEvent::Begin, instance.id(), previous_id);
                instance
            }
        };

        if let Some(hook) = &self.inner.on_begin {
            hook(current.id(), previous_id);
        }
        current.id()
    }

    /// Flush and tear down the current instance.
    ///
    /// A paused flush leaves the instance current and re-arms the autorun;
    /// the host will resume the pump on its next turn. A completed flush
    /// pops the instance stack and fires the `End` event.
    pub fn end(&self) -> Result<(), Error> {
        let current = self
            .inner
            .current
            .borrow()
            .clone()
            .ok_or(Error::EndWithoutBegin)?;

        let sink = self.inner.on_error.borrow().clone();
        let outcome = {
            let ctx = FlushContext {
                sink: sink.as_ref(),
                must_yield: self.inner.must_yield.as_ref(),
            };
            catch_unwind(AssertUnwindSafe(|| current.flush(ctx)))
        };

        match outcome {
            Ok(FlushOutcome::Pause) => {
                debug!("flush paused; resuming on the next host turn");
                self.arm_autorun();
                Ok(())
            }
            Ok(FlushOutcome::Done) => {
                self.finish_instance(&current);
                Ok(())
            }
            Err(payload) => {
                // the pump aborted; teardown still happens before the panic
                // continues into the host
                self.finish_instance(&current);
                resume_unwind(payload)
            }
        }
    }

    /// Open an instance if none is current, arming the autorun that will
    /// flush it on the next host turn. Returns the current instance's id.
    pub fn ensure_instance(&self) -> InstanceId {
        self.ensure_current().id()
    }

    /// Id of the current instance, if one is open.
    pub fn current_instance(&self) -> Option<InstanceId> {
        self.inner.current.borrow().as_ref().map(|i| i.id())
    }

    fn finish_instance(&self, just_ended: &Rc<DeferredActionQueues>) {
        *self.inner.current.borrow_mut() = None;
        let next = self.inner.stack.borrow_mut().pop();
        if let Some(next) = &next {
            *self.inner.current.borrow_mut() = Some(next.clone());
        }
        let next_id = next.map(|instance| instance.id());
        debug!("instance {} ended", just_ended.id().as_u64());
        self.emit(LoopEvent::End, just_ended.id(), next_id);
        if let Some(hook) = &self.inner.on_end {
            hook(just_ended.id(), next_id);
        }
    }

    fn ensure_current(&self) -> Rc<DeferredActionQueues> {
        if let Some(current) = self.inner.current.borrow().clone() {
            return current;
        }
        self.begin();
        self.arm_autorun();
        self.inner
            .current
            .borrow()
            .clone()
            .expect("begin() installs a current instance")
    }

    fn arm_autorun(&self) {
        let weak = Rc::downgrade(&self.inner);
        let token = self.inner.platform.next(Box::new(move || {
            if let Some(run_loop) = RunLoop::upgrade(&weak) {
                run_loop.autorun_end();
            }
        }));
        self.inner.autorun.set(Some(token));
    }

    fn autorun_end(&self) {
        self.inner.autorun.set(None);
        if let Err(error) = self.end() {
            warn!("autorun end found no open instance: {error}");
        }
    }

    fn upgrade(weak: &Weak<Inner>) -> Option<RunLoop> {
        weak.upgrade().map(|inner| RunLoop { inner })
    }

    // ========================================================================
    // Immediate execution
    // ========================================================================

    /// Run `work` inside a fresh `begin`/`end` bracket, flushing everything
    /// it schedules before returning.
    ///
    /// Returns `None` when a configured error sink swallowed a failure in
    /// `work`; the flush still runs. Without a sink the failure propagates
    /// after the flush-side teardown.
    pub fn run<R>(&self, work: impl FnOnce() -> R) -> Option<R> {
        self.begin();
        match catch_unwind(AssertUnwindSafe(work)) {
            Ok(value) => {
                self.end().expect("balanced by the begin above");
                Some(value)
            }
            Err(payload) => {
                let sink = self.inner.on_error.borrow().clone();
                match sink {
                    Some(sink) => {
                        let error = WorkError::new(payload, None);
                        warn!("immediate work failed, routing to error sink: {error}");
                        sink(error);
                        self.end().expect("balanced by the begin above");
                        None
                    }
                    None => {
                        self.end().expect("balanced by the begin above");
                        resume_unwind(payload)
                    }
                }
            }
        }
    }

    /// Run `work` inside the current instance when one is open, otherwise
    /// behave exactly like [`RunLoop::run`].
    pub fn join<R>(&self, work: impl FnOnce() -> R) -> Option<R> {
        if self.inner.current.borrow().is_none() {
            return self.run(work);
        }
        let sink = self.inner.on_error.borrow().clone();
        match sink {
            Some(sink) => match catch_unwind(AssertUnwindSafe(work)) {
                Ok(value) => Some(value),
                Err(payload) => {
                    let error = WorkError::new(payload, None);
                    warn!("joined work failed, routing to error sink: {error}");
                    sink(error);
                    None
                }
            },
            None => Some(work()),
        }
    }

    // ========================================================================
    // Queue scheduling
    // ========================================================================

    /// Enqueue `work` into the named queue of the current instance, opening
    /// an autorun instance when none is current.
    pub fn schedule(&self, queue: &str, work: impl FnOnce() + 'static) -> Result<Handle, Error> {
        let index = self.queue_index(queue)?;
        Ok(self.schedule_job(index, Box::new(work), None))
    }

    /// Enqueue `work` with once semantics: while an item with the same key
    /// is pending in the queue, re-scheduling replaces its work in place and
    /// returns a handle to the existing item.
    pub fn schedule_once(
        &self,
        queue: &str,
        key: JobKey,
        work: impl FnOnce() + 'static,
    ) -> Result<Handle, Error> {
        let index = self.queue_index(queue)?;
        Ok(self.schedule_job(index, Box::new(work), Some(key)))
    }

    /// Enqueue a drain of `iterable`: each drain step pulls one work item,
    /// schedules it onto the same queue, and re-schedules itself behind it.
    /// Long lazy sequences are consumed one step at a time, so a pause can
    /// interleave host turns with consumption.
    pub fn schedule_iterable<I>(&self, queue: &str, iterable: I) -> Result<Handle, Error>
    where
        I: Iterator<Item = Box<dyn FnOnce()>> + 'static,
    {
        let index = self.queue_index(queue)?;
        let iterable = Rc::new(RefCell::new(iterable));
        let step = drain_step(Rc::downgrade(&self.inner), index, iterable);
        Ok(self.schedule_job(index, step, None))
    }

    /// Deprecated alias of [`RunLoop::schedule`].
    #[deprecated(note = "renamed to `schedule`")]
    pub fn defer(&self, queue: &str, work: impl FnOnce() + 'static) -> Result<Handle, Error> {
        self.schedule(queue, work)
    }

    /// Deprecated alias of [`RunLoop::schedule_once`].
    #[deprecated(note = "renamed to `schedule_once`")]
    pub fn defer_once(
        &self,
        queue: &str,
        key: JobKey,
        work: impl FnOnce() + 'static,
    ) -> Result<Handle, Error> {
        self.schedule_once(queue, key, work)
    }

    fn queue_index(&self, name: &str) -> Result<usize, Error> {
        self.inner
            .layout
            .index_of(name)
            .ok_or_else(|| Error::UnknownQueue(name.to_string()))
    }

    fn schedule_job(&self, queue: usize, hook: JobFn, key: Option<JobKey>) -> Handle {
        let instance = self.ensure_current();
        let trace = self.inner.debug.get().then(Backtrace::force_capture);
        trace!(
            "scheduling into `{}` on instance {}",
            self.inner.layout.name(queue),
            instance.id().as_u64()
        );
        let seq = instance.schedule(queue, hook, key, trace);
        Handle::Queued(QueuedHandle {
            instance: Rc::downgrade(&instance),
            queue,
            seq,
        })
    }

    // ========================================================================
    // Delayed execution
    // ========================================================================

    /// Run `work` after `wait_ms` milliseconds of host time.
    ///
    /// Expired work is folded into the default queue of a fresh instance, so
    /// its side effects flush like any other scheduled work.
    pub fn later(&self, wait_ms: u64, work: impl FnOnce() + 'static) -> Handle {
        let at = self.inner.platform.now().saturating_add(wait_ms);
        let seq = self.inner.later_seq.get() + 1;
        self.inner.later_seq.set(seq);
        let became_earliest = self.inner.timers.borrow_mut().insert(at, seq, Box::new(work));
        trace!("delayed work {seq} due at t={at}");
        if became_earliest {
            self.reinstall_expiry_timer();
        }
        Handle::Later(LaterHandle { seq })
    }

    /// Alias of [`RunLoop::later`] under the host-timer name.
    pub fn set_timeout(&self, wait_ms: u64, work: impl FnOnce() + 'static) -> Handle {
        self.later(wait_ms, work)
    }

    /// One host timer backs the whole heap; it always targets the earliest
    /// deadline, so it is torn down and re-armed whenever that changes.
    fn reinstall_expiry_timer(&self) {
        if let Some(token) = self.inner.expiry.take() {
            self.inner.platform.clear_timeout(token);
        }
        let Some(at) = self.inner.timers.borrow().next_deadline() else {
            return;
        };
        let wait = at.saturating_sub(self.inner.platform.now());
        let weak = Rc::downgrade(&self.inner);
        let token = self.inner.platform.set_timeout(
            wait,
            Box::new(move || {
                if let Some(run_loop) = RunLoop::upgrade(&weak) {
                    run_loop.run_expired_timers();
                }
            }),
        );
        self.inner.expiry.set(Some(token));
    }

    fn run_expired_timers(&self) {
        self.inner.expiry.set(None);
        self.begin();
        let now = self.inner.platform.now();
        let due = self.inner.timers.borrow_mut().pop_due(now);
        trace!("{} delayed items expired at t={now}", due.len());
        let default_queue = self.inner.layout.default();
        for entry in due {
            self.schedule_job(default_queue, entry.hook, None);
        }
        self.reinstall_expiry_timer();
        self.end().expect("balanced by the begin above");
    }

    // ========================================================================
    // Debounce and throttle
    // ========================================================================

    /// Rate-limit `work` on its leading edge: the first call for `key` runs
    /// immediately, further calls are suppressed until `wait_ms` elapses.
    pub fn throttle(&self, key: JobKey, wait_ms: u64, work: impl FnOnce() + 'static) -> Handle {
        self.throttle_with(key, wait_ms, true, work)
    }

    /// [`RunLoop::throttle`] with an explicit edge. With `immediate` false
    /// the first call's work runs when the wait elapses instead.
    pub fn throttle_with(
        &self,
        key: JobKey,
        wait_ms: u64,
        immediate: bool,
        work: impl FnOnce() + 'static,
    ) -> Handle {
        if let Some(timer) = self.inner.throttlers.borrow().timer_for(key) {
            // live registration: the call is suppressed
            return Handle::Rate(RateHandle {
                timer,
                kind: RateKind::Throttle,
            });
        }

        let nonce = self.next_rate_nonce();
        let weak = Rc::downgrade(&self.inner);
        let timer = self.inner.platform.set_timeout(
            wait_ms,
            Box::new(move || {
                if let Some(run_loop) = RunLoop::upgrade(&weak) {
                    run_loop.release_throttle(nonce);
                }
            }),
        );

        let hook = if immediate {
            let _ = self.join(work);
            None
        } else {
            Some(Box::new(work) as JobFn)
        };
        self.inner.throttlers.borrow_mut().insert(RateEntry {
            key,
            timer,
            nonce,
            hook,
        });
        Handle::Rate(RateHandle {
            timer,
            kind: RateKind::Throttle,
        })
    }

    /// Rate-limit `work` on its trailing edge: every call for `key` restarts
    /// the wait, and only the latest work runs once calls stop for
    /// `wait_ms`.
    pub fn debounce(&self, key: JobKey, wait_ms: u64, work: impl FnOnce() + 'static) -> Handle {
        self.debounce_with(key, wait_ms, false, work)
    }

    /// [`RunLoop::debounce`] with an explicit edge. With `immediate` true
    /// the first call of a burst runs right away and the trailing edge is
    /// skipped.
    pub fn debounce_with(
        &self,
        key: JobKey,
        wait_ms: u64,
        immediate: bool,
        work: impl FnOnce() + 'static,
    ) -> Handle {
        let prior = self.inner.debouncers.borrow_mut().remove_by_key(key);
        let had_prior = prior.is_some();
        if let Some(entry) = prior {
            // the wait extends
            self.inner.platform.clear_timeout(entry.timer);
        }

        let nonce = self.next_rate_nonce();
        let weak = Rc::downgrade(&self.inner);
        let timer = self.inner.platform.set_timeout(
            wait_ms,
            Box::new(move || {
                if let Some(run_loop) = RunLoop::upgrade(&weak) {
                    run_loop.release_debounce(nonce);
                }
            }),
        );

        let hook = if immediate {
            if !had_prior {
                let _ = self.join(work);
            }
            None
        } else {
            Some(Box::new(work) as JobFn)
        };
        self.inner.debouncers.borrow_mut().insert(RateEntry {
            key,
            timer,
            nonce,
            hook,
        });
        Handle::Rate(RateHandle {
            timer,
            kind: RateKind::Debounce,
        })
    }

    /// Fire path for an elapsed throttle window: run the trailing work if
    /// any, then retire exactly the registration that armed this timer. Work
    /// that re-registers the same key keeps its fresh registration.
    fn release_throttle(&self, nonce: u64) {
        let trailing = self.inner.throttlers.borrow_mut().take_hook(nonce);
        if let Some(work) = trailing {
            let _ = self.run(work);
        }
        self.inner.throttlers.borrow_mut().remove_by_nonce(nonce);
    }

    fn release_debounce(&self, nonce: u64) {
        let trailing = self.inner.debouncers.borrow_mut().take_hook(nonce);
        if let Some(work) = trailing {
            let _ = self.run(work);
        }
        self.inner.debouncers.borrow_mut().remove_by_nonce(nonce);
    }

    fn next_rate_nonce(&self) -> u64 {
        let nonce = self.inner.rate_nonce.get() + 1;
        self.inner.rate_nonce.set(nonce);
        nonce
    }

    // ========================================================================
    // Cancellation
    // ========================================================================

    /// Cancel scheduled work. Returns whether anything was actually removed;
    /// cancelling an already-fired or already-cancelled handle reports
    /// `false`.
    pub fn cancel(&self, handle: &Handle) -> bool {
        match handle {
            Handle::Queued(handle) => match handle.instance.upgrade() {
                Some(instance) => instance.cancel(handle.queue, handle.seq),
                None => false,
            },
            Handle::Later(handle) => {
                let removed = self.inner.timers.borrow_mut().remove(handle.seq);
                match removed {
                    Some(was_earliest) => {
                        if was_earliest {
                            self.reinstall_expiry_timer();
                        }
                        true
                    }
                    None => false,
                }
            }
            Handle::Rate(handle) => {
                let registry = match handle.kind {
                    RateKind::Throttle => &self.inner.throttlers,
                    RateKind::Debounce => &self.inner.debouncers,
                };
                match registry.borrow_mut().remove_by_timer(handle.timer) {
                    Some(entry) => {
                        self.inner.platform.clear_timeout(entry.timer);
                        true
                    }
                    None => false,
                }
            }
        }
    }

    /// Drop every delayed, debounced, and throttled registration and cancel
    /// a pending autorun.
    ///
    /// Work already enqueued in instance queues is deliberately left alone;
    /// only the timer side is cleared.
    pub fn cancel_timers(&self) {
        for timer in self.inner.throttlers.borrow_mut().drain_timers() {
            self.inner.platform.clear_timeout(timer);
        }
        for timer in self.inner.debouncers.borrow_mut().drain_timers() {
            self.inner.platform.clear_timeout(timer);
        }
        self.inner.timers.borrow_mut().clear();
        if let Some(token) = self.inner.expiry.take() {
            self.inner.platform.clear_timeout(token);
        }
        if let Some(token) = self.inner.autorun.take() {
            self.inner.platform.clear_next(token);
        }
        debug!("all timers cancelled");
    }

    /// Whether any delayed, debounced, or throttled work is pending, or an
    /// autorun is armed.
    pub fn has_timers(&self) -> bool {
        !self.inner.timers.borrow().is_empty()
            || !self.inner.debouncers.borrow().is_empty()
            || !self.inner.throttlers.borrow().is_empty()
            || self.inner.autorun.get().is_some()
    }

    // ========================================================================
    // Lifecycle events and hooks
    // ========================================================================

    /// Subscribe to a lifecycle event. Subscribers fire in insertion order;
    /// duplicate subscriptions each fire independently.
    pub fn on(
        &self,
        event: LoopEvent,
        callback: impl Fn(InstanceId, Option<InstanceId>) + 'static,
    ) -> SubscriptionId {
        self.inner.events.borrow_mut().subscribe(event, Rc::new(callback))
    }

    /// Remove an event subscription.
    pub fn off(&self, event: LoopEvent, id: SubscriptionId) -> Result<(), Error> {
        self.inner.events.borrow_mut().unsubscribe(event, id)
    }

    /// Re-point the error sink without reconstructing the loop. The sink is
    /// consulted per invocation, so the change also covers work that is
    /// already scheduled.
    pub fn set_on_error(&self, sink: Option<ErrorHook>) {
        *self.inner.on_error.borrow_mut() = sink;
    }

    /// Enable or disable backtrace capture at scheduling time.
    pub fn set_debug(&self, enabled: bool) {
        self.inner.debug.set(enabled);
    }

    /// Whether scheduling-site backtraces are being captured.
    pub fn debug_enabled(&self) -> bool {
        self.inner.debug.get()
    }

    fn emit(&self, event: LoopEvent, instance: InstanceId, other: Option<InstanceId>) {
        let subscribers = self.inner.events.borrow().snapshot(event);
        for subscriber in subscribers {
            subscriber(instance, other);
        }
    }
}

fn drain_step<I>(loop_ref: Weak<Inner>, queue: usize, iterable: Rc<RefCell<I>>) -> JobFn
where
    I: Iterator<Item = Box<dyn FnOnce()>> + 'static,
{
    Box::new(move || {
        let Some(run_loop) = RunLoop::upgrade(&loop_ref) else {
            return;
        };
        let produced = iterable.borrow_mut().next();
        if let Some(work) = produced {
            run_loop.schedule_job(queue, work, None);
            run_loop.schedule_job(
                queue,
                drain_step(loop_ref.clone(), queue, iterable.clone()),
                None,
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::VirtualPlatform;
    use std::cell::RefCell;

    fn run_loop() -> (Rc<VirtualPlatform>, RunLoop) {
        let platform = VirtualPlatform::new();
        let run_loop = RunLoop::new(&["actions", "render"], platform.clone());
        (platform, run_loop)
    }

    #[test]
    fn test_end_without_begin_fails() {
        let (_, rl) = run_loop();
        assert_eq!(rl.end(), Err(Error::EndWithoutBegin));
    }

    #[test]
    fn test_run_returns_value_and_flushes() {
        let (_, rl) = run_loop();
        let ran = Rc::new(Cell::new(false));

        let ran_in = ran.clone();
        let inner = rl.clone();
        let value = rl.run(move || {
            inner
                .schedule("actions", move || ran_in.set(true))
                .unwrap();
            42
        });

        assert_eq!(value, Some(42));
        assert!(ran.get());
        assert!(rl.current_instance().is_none());
    }

    #[test]
    fn test_unknown_queue_is_rejected() {
        let (_, rl) = run_loop();
        let error = rl.schedule("missing", || {}).unwrap_err();
        assert_eq!(error, Error::UnknownQueue("missing".to_string()));
        // the failed schedule still opened no instance of its own
        assert!(rl.current_instance().is_none());
    }

    #[test]
    fn test_join_runs_inline_inside_instance() {
        let (_, rl) = run_loop();
        let order = Rc::new(RefCell::new(Vec::new()));

        let o = order.clone();
        let inner = rl.clone();
        rl.run(move || {
            o.borrow_mut().push("outer");
            let o2 = o.clone();
            inner.join(move || o2.borrow_mut().push("joined"));
            o.borrow_mut().push("after-join");
        });

        assert_eq!(*order.borrow(), vec!["outer", "joined", "after-join"]);
    }

    #[test]
    fn test_nested_run_completes_before_outer_resumes() {
        let (_, rl) = run_loop();
        let order = Rc::new(RefCell::new(Vec::new()));

        let o = order.clone();
        let inner = rl.clone();
        rl.run(move || {
            let o_sched = o.clone();
            let nested = inner.clone();
            let o_nested = o.clone();
            inner
                .schedule("actions", move || {
                    o_sched.borrow_mut().push("outer-item");
                    let o_deep = o_nested.clone();
                    nested.run(move || o_deep.borrow_mut().push("nested-run"));
                    o_nested.borrow_mut().push("outer-item-end");
                })
                .unwrap();
        });

        assert_eq!(
            *order.borrow(),
            vec!["outer-item", "nested-run", "outer-item-end"]
        );
    }

    #[test]
    fn test_begin_joins_pending_autorun_without_second_begin_event() {
        let (platform, rl) = run_loop();
        let begins = Rc::new(Cell::new(0u32));

        let begins_in = begins.clone();
        rl.on(LoopEvent::Begin, move |_, _| begins_in.set(begins_in.get() + 1));

        rl.schedule("actions", || {}).unwrap();
        assert_eq!(begins.get(), 1);
        assert!(rl.has_timers());

        let joined = rl.begin();
        assert_eq!(begins.get(), 1);
        assert_eq!(rl.current_instance(), Some(joined));
        assert!(!rl.has_timers());

        rl.end().unwrap();
        assert!(rl.current_instance().is_none());

        // the cancelled autorun turn delivers nothing
        platform.advance(0);
        assert!(rl.current_instance().is_none());
    }

    #[test]
    fn test_ensure_instance_opens_once_and_reuses() {
        let (platform, rl) = run_loop();

        let first = rl.ensure_instance();
        let second = rl.ensure_instance();
        assert_eq!(first, second);
        // one autorun armed for the implicit instance
        assert_eq!(platform.pending(), 1);

        platform.advance(0);
        assert!(rl.current_instance().is_none());
        assert_eq!(platform.pending(), 0);
    }

    #[test]
    fn test_set_on_error_repoints_sink() {
        let (_, rl) = run_loop();
        let seen = Rc::new(RefCell::new(Vec::new()));

        let seen_in = seen.clone();
        rl.set_on_error(Some(Rc::new(move |err: WorkError| {
            seen_in.borrow_mut().push(err.message().to_string())
        })));

        assert_eq!(rl.run(|| panic!("first")), None::<()>);
        rl.set_on_error(None);
        assert_eq!(*seen.borrow(), vec!["first".to_string()]);
    }

    #[test]
    fn test_debug_flag_round_trips() {
        let (_, rl) = run_loop();
        assert!(!rl.debug_enabled());
        rl.set_debug(true);
        assert!(rl.debug_enabled());
    }
}
