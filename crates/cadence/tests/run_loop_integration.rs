//! Integration tests for the run loop: lifecycle, queue ordering, timers,
//! rate limiting, and cancellation, driven through the virtual host.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use cadence::{
    Error, JobKey, LoopEvent, RunLoop, RunLoopOptions, VirtualPlatform, WorkError,
};

fn setup() -> (Rc<VirtualPlatform>, RunLoop) {
    let platform = VirtualPlatform::new();
    let run_loop = RunLoop::new(&["actions", "render"], platform.clone());
    (platform, run_loop)
}

fn recorder() -> Rc<RefCell<Vec<String>>> {
    Rc::new(RefCell::new(Vec::new()))
}

fn record(log: &Rc<RefCell<Vec<String>>>, label: impl Into<String>) {
    log.borrow_mut().push(label.into());
}

#[test]
fn test_run_flushes_queues_in_declared_order() {
    let (_, rl) = setup();
    let log = recorder();

    let l = log.clone();
    let scheduler = rl.clone();
    rl.run(move || {
        record(&l, "outer");
        let la = l.clone();
        scheduler
            .schedule("render", move || record(&la, "paint"))
            .unwrap();
        let lb = l.clone();
        scheduler
            .schedule("actions", move || record(&lb, "react"))
            .unwrap();
    });

    assert_eq!(*log.borrow(), vec!["outer", "react", "paint"]);
}

#[test]
fn test_later_queue_schedules_earlier_queue_work() {
    let platform = VirtualPlatform::new();
    let rl = RunLoop::new(&["sync", "actions", "render"], platform);
    let log = recorder();

    let l = log.clone();
    let scheduler = rl.clone();
    rl.run(move || {
        let feed = scheduler.clone();
        let lr = l.clone();
        scheduler
            .schedule("render", move || {
                record(&lr, "render");
                let ls = lr.clone();
                feed.schedule("sync", move || record(&ls, "fed-back-sync"))
                    .unwrap();
            })
            .unwrap();
        let la = l.clone();
        scheduler
            .schedule("actions", move || record(&la, "actions"))
            .unwrap();
    });

    // the sync queue settles again before the flush completes
    assert_eq!(
        *log.borrow(),
        vec!["actions", "render", "fed-back-sync"]
    );
}

#[test]
fn test_schedule_once_coalesces_to_latest_work() {
    let (_, rl) = setup();
    let log = recorder();
    let key = JobKey::named("m");

    rl.begin();
    let l = log.clone();
    let first = rl
        .schedule_once("actions", key, move || record(&l, "m(1)"))
        .unwrap();
    let l = log.clone();
    rl.schedule_once("actions", key, move || record(&l, "m(2)"))
        .unwrap();
    rl.end().unwrap();

    assert_eq!(*log.borrow(), vec!["m(2)"]);
    // both handles name the same coalesced item, which has already run
    assert!(!rl.cancel(&first));
}

#[test]
fn test_autorun_flushes_on_next_host_turn() {
    let (platform, rl) = setup();
    let ran = Rc::new(Cell::new(0u32));

    for _ in 0..3 {
        let ran = ran.clone();
        rl.schedule("actions", move || ran.set(ran.get() + 1))
            .unwrap();
    }

    // all three schedules share one implicit instance and one armed autorun
    assert!(rl.current_instance().is_some());
    assert_eq!(platform.pending(), 1);
    assert_eq!(ran.get(), 0);

    platform.advance(0);
    assert_eq!(ran.get(), 3);
    assert!(rl.current_instance().is_none());
    assert!(!rl.has_timers());
}

#[test]
fn test_later_fires_through_default_queue_in_deadline_order() {
    let (platform, rl) = setup();
    let log = recorder();

    let l = log.clone();
    rl.later(10, move || record(&l, "slow"));
    let l = log.clone();
    rl.later(5, move || record(&l, "fast"));

    assert!(rl.has_timers());

    platform.advance(5);
    assert_eq!(*log.borrow(), vec!["fast"]);

    platform.advance(5);
    assert_eq!(*log.borrow(), vec!["fast", "slow"]);
    assert!(!rl.has_timers());
}

#[test]
fn test_later_work_participates_in_a_flush() {
    let (platform, rl) = setup();
    let log = recorder();

    let l = log.clone();
    let scheduler = rl.clone();
    rl.later(5, move || {
        record(&l, "timer");
        let lr = l.clone();
        scheduler
            .schedule("render", move || record(&lr, "timer-render"))
            .unwrap();
    });

    platform.advance(5);
    assert_eq!(*log.borrow(), vec!["timer", "timer-render"]);
}

#[test]
fn test_debounce_extends_the_wait() {
    let (platform, rl) = setup();
    let count = Rc::new(Cell::new(0u32));
    let key = JobKey::named("save");

    let c = count.clone();
    rl.debounce(key, 100, move || c.set(c.get() + 1));
    platform.advance(50);
    let c = count.clone();
    rl.debounce(key, 100, move || c.set(c.get() + 1));

    platform.advance(99);
    assert_eq!(count.get(), 0);

    platform.advance(1); // t = 150
    assert_eq!(count.get(), 1);

    platform.advance(500);
    assert_eq!(count.get(), 1);
}

#[test]
fn test_debounce_immediate_runs_leading_edge_only() {
    let (platform, rl) = setup();
    let count = Rc::new(Cell::new(0u32));
    let key = JobKey::named("save");

    let c = count.clone();
    rl.debounce_with(key, 100, true, move || c.set(c.get() + 1));
    assert_eq!(count.get(), 1);

    platform.advance(50);
    let c = count.clone();
    rl.debounce_with(key, 100, true, move || c.set(c.get() + 1));
    assert_eq!(count.get(), 1);

    // trailing edge is skipped for immediate debounces
    platform.advance(200);
    assert_eq!(count.get(), 1);

    // a fresh burst runs its leading edge again
    let c = count.clone();
    rl.debounce_with(key, 100, true, move || c.set(c.get() + 1));
    assert_eq!(count.get(), 2);
}

#[test]
fn test_debounced_work_can_re_debounce_itself() {
    fn poll(rl: &RunLoop, key: JobKey, count: Rc<Cell<u32>>) {
        let rl_again = rl.clone();
        rl.debounce(key, 10, move || {
            count.set(count.get() + 1);
            if count.get() < 3 {
                poll(&rl_again, key, count.clone());
            }
        });
    }

    let (platform, rl) = setup();
    let count = Rc::new(Cell::new(0u32));
    let key = JobKey::named("poll");

    poll(&rl, key, count.clone());
    platform.advance(100);

    // each firing re-registers the next; releasing one round never kills
    // the registration made from inside it
    assert_eq!(count.get(), 3);
    assert!(!rl.has_timers());
}

#[test]
fn test_throttle_immediate_suppresses_until_wait_elapses() {
    let (platform, rl) = setup();
    let count = Rc::new(Cell::new(0u32));
    let key = JobKey::named("scroll");

    for _ in 0..3 {
        let c = count.clone();
        rl.throttle(key, 100, move || c.set(c.get() + 1));
        platform.advance(10);
    }
    assert_eq!(count.get(), 1);

    platform.advance(70); // t = 100, the window closes
    let c = count.clone();
    rl.throttle(key, 100, move || c.set(c.get() + 1));
    assert_eq!(count.get(), 2);
}

#[test]
fn test_throttle_trailing_runs_once_at_wait() {
    let (platform, rl) = setup();
    let count = Rc::new(Cell::new(0u32));
    let key = JobKey::named("scroll");

    for _ in 0..3 {
        let c = count.clone();
        rl.throttle_with(key, 100, false, move || c.set(c.get() + 1));
        platform.advance(10);
    }
    assert_eq!(count.get(), 0);

    platform.advance(70); // t = 100
    assert_eq!(count.get(), 1);

    platform.advance(500);
    assert_eq!(count.get(), 1);
}

#[test]
fn test_error_sink_contains_failures() {
    let platform = VirtualPlatform::new();
    let errors = recorder();

    let e = errors.clone();
    let rl = RunLoop::with_options(
        &["actions", "render"],
        platform,
        RunLoopOptions {
            on_error: Some(Rc::new(move |err: WorkError| {
                record(&e, err.message().to_string())
            })),
            ..Default::default()
        },
    );

    let value = rl.run(|| -> u32 { panic!("explosion") });
    assert_eq!(value, None);
    assert_eq!(*errors.borrow(), vec!["explosion"]);

    // the loop stays usable and later items survive a failing one
    let ran = Rc::new(Cell::new(false));
    let ran_in = ran.clone();
    let scheduler = rl.clone();
    rl.run(move || {
        scheduler
            .schedule("actions", || panic!("item failed"))
            .unwrap();
        scheduler
            .schedule("actions", move || ran_in.set(true))
            .unwrap();
    });

    assert!(ran.get());
    assert_eq!(errors.borrow().len(), 2);
}

#[test]
fn test_debug_capture_reaches_error_sink() {
    let platform = VirtualPlatform::new();
    let captured = Rc::new(Cell::new(false));

    let c = captured.clone();
    let rl = RunLoop::with_options(
        &["actions"],
        platform,
        RunLoopOptions {
            debug: true,
            on_error: Some(Rc::new(move |err: WorkError| {
                c.set(err.scheduled_at().is_some())
            })),
            ..Default::default()
        },
    );

    let scheduler = rl.clone();
    rl.run(move || {
        scheduler
            .schedule("actions", || panic!("traced failure"))
            .unwrap();
    });

    assert!(captured.get());
}

#[test]
fn test_must_yield_pauses_and_autorun_resumes() {
    let platform = VirtualPlatform::new();
    let gate = Rc::new(Cell::new(true));

    let g = gate.clone();
    let rl = RunLoop::with_options(
        &["actions", "render"],
        platform.clone(),
        RunLoopOptions {
            must_yield: Some(Rc::new(move || g.get())),
            ..Default::default()
        },
    );

    let ran = Rc::new(Cell::new(0u32));
    let scheduler = rl.clone();
    let ran_in = ran.clone();
    rl.run(move || {
        for _ in 0..3 {
            let ran = ran_in.clone();
            scheduler
                .schedule("actions", move || ran.set(ran.get() + 1))
                .unwrap();
        }
    });

    // the first item ran, then the flush yielded back to the host
    assert_eq!(ran.get(), 1);
    assert!(rl.current_instance().is_some());
    assert!(rl.has_timers());

    // work scheduled while paused joins the still-current instance
    let ran_in = ran.clone();
    rl.schedule("actions", move || ran_in.set(ran_in.get() + 1))
        .unwrap();

    // one host turn runs one item while the gate stays closed
    assert!(platform.step());
    assert_eq!(ran.get(), 2);
    assert!(rl.current_instance().is_some());

    gate.set(false);
    assert!(platform.step());
    assert_eq!(ran.get(), 4);
    assert!(rl.current_instance().is_none());
    assert!(!platform.step());
}

#[test]
fn test_cancel_scheduled_item_never_fires() {
    let (_, rl) = setup();
    let ran = Rc::new(Cell::new(false));

    rl.begin();
    let ran_in = ran.clone();
    let handle = rl
        .schedule("actions", move || ran_in.set(true))
        .unwrap();

    assert!(rl.cancel(&handle));
    assert!(!rl.cancel(&handle));
    rl.end().unwrap();

    assert!(!ran.get());
}

#[test]
fn test_cancel_once_item_releases_its_key() {
    let (_, rl) = setup();
    let log = recorder();
    let key = JobKey::named("m");

    rl.begin();
    let l = log.clone();
    let handle = rl
        .schedule_once("actions", key, move || record(&l, "stale"))
        .unwrap();
    assert!(rl.cancel(&handle));

    let l = log.clone();
    rl.schedule_once("actions", key, move || record(&l, "fresh"))
        .unwrap();
    rl.end().unwrap();

    assert_eq!(*log.borrow(), vec!["fresh"]);
}

#[test]
fn test_cancel_on_torn_down_instance_is_false() {
    let (_, rl) = setup();

    let scheduler = rl.clone();
    let handle = rl
        .run(move || scheduler.schedule("actions", || {}).unwrap())
        .unwrap();

    // the instance flushed and was dropped with the end of `run`
    assert!(!rl.cancel(&handle));
}

#[test]
fn test_cancel_later_rearms_host_timer() {
    let (platform, rl) = setup();
    let log = recorder();

    let l = log.clone();
    let fast = rl.later(5, move || record(&l, "fast"));
    let l = log.clone();
    rl.later(10, move || record(&l, "slow"));

    assert!(rl.cancel(&fast));
    assert!(!rl.cancel(&fast));

    platform.advance(20);
    assert_eq!(*log.borrow(), vec!["slow"]);
}

#[test]
fn test_cancel_rate_registrations() {
    let (platform, rl) = setup();
    let count = Rc::new(Cell::new(0u32));

    let c = count.clone();
    let debounced = rl.debounce(JobKey::named("d"), 10, move || c.set(c.get() + 1));
    let c = count.clone();
    let throttled = rl.throttle_with(JobKey::named("t"), 10, false, move || c.set(c.get() + 1));

    assert!(rl.cancel(&debounced));
    assert!(rl.cancel(&throttled));
    assert!(!rl.cancel(&debounced));
    assert!(!rl.cancel(&throttled));

    platform.advance(100);
    assert_eq!(count.get(), 0);
}

#[test]
fn test_cancel_timers_clears_timer_side_only() {
    let (platform, rl) = setup();
    let timer_ran = Rc::new(Cell::new(false));
    let queued_ran = Rc::new(Cell::new(false));

    let t = timer_ran.clone();
    rl.later(5, move || t.set(true));
    let t = timer_ran.clone();
    rl.debounce(JobKey::named("d"), 5, move || t.set(true));
    let t = timer_ran.clone();
    rl.throttle_with(JobKey::named("t"), 5, false, move || t.set(true));
    let q = queued_ran.clone();
    rl.schedule("actions", move || q.set(true)).unwrap();

    assert!(rl.has_timers());
    rl.cancel_timers();
    assert!(!rl.has_timers());

    platform.advance(100);
    assert!(!timer_ran.get());
    // the queued item survived; the autorun was cancelled, so it flushes
    // only when the instance is ended explicitly
    assert!(!queued_ran.get());
    assert!(rl.current_instance().is_some());
    rl.end().unwrap();
    assert!(queued_ran.get());
}

#[test]
fn test_lifecycle_events_and_hooks() {
    let platform = VirtualPlatform::new();
    let log = recorder();

    let l = log.clone();
    let l2 = log.clone();
    let rl = RunLoop::with_options(
        &["actions"],
        platform,
        RunLoopOptions {
            on_begin: Some(Rc::new(move |_, _| record(&l, "hook-begin"))),
            on_end: Some(Rc::new(move |_, _| record(&l2, "hook-end"))),
            ..Default::default()
        },
    );

    let l = log.clone();
    rl.on(LoopEvent::Begin, move |current, previous| {
        record(
            &l,
            format!("begin {} prev={}", current.as_u64(), previous.is_some()),
        );
    });
    let l = log.clone();
    let end_id = rl.on(LoopEvent::End, move |_, next| {
        record(&l, format!("end next={}", next.is_some()));
    });

    rl.run(|| {});
    assert_eq!(log.borrow().len(), 4);
    assert!(log.borrow()[0].starts_with("begin"));
    assert_eq!(log.borrow()[1], "hook-begin");
    assert_eq!(log.borrow()[2], "end next=false");
    assert_eq!(log.borrow()[3], "hook-end");

    rl.off(LoopEvent::End, end_id).unwrap();
    assert_eq!(
        rl.off(LoopEvent::End, end_id),
        Err(Error::UnknownSubscription(LoopEvent::End))
    );

    log.borrow_mut().clear();
    rl.run(|| {});
    // the End subscription is gone, the Begin one and both hooks remain
    assert_eq!(log.borrow().len(), 3);
}

#[test]
fn test_nested_run_reports_stacked_instances() {
    let (_, rl) = setup();
    let events = Rc::new(RefCell::new(Vec::new()));

    let e = events.clone();
    rl.on(LoopEvent::Begin, move |current, previous| {
        e.borrow_mut().push((current, previous));
    });

    let outer_rl = rl.clone();
    rl.run(move || {
        let _ = outer_rl.run(|| {});
    });

    let events = events.borrow();
    assert_eq!(events.len(), 2);
    let (outer, outer_prev) = events[0];
    let (inner, inner_prev) = events[1];
    assert_eq!(outer_prev, None);
    assert_eq!(inner_prev, Some(outer));
    assert_ne!(outer, inner);
}

#[test]
fn test_schedule_iterable_drains_in_order() {
    let (_, rl) = setup();
    let log = recorder();

    let jobs: Vec<Box<dyn FnOnce()>> = ["one", "two", "three"]
        .into_iter()
        .map(|label| {
            let l = log.clone();
            Box::new(move || record(&l, label)) as Box<dyn FnOnce()>
        })
        .collect();

    let scheduler = rl.clone();
    rl.run(move || {
        scheduler
            .schedule_iterable("actions", jobs.into_iter())
            .unwrap();
    });

    assert_eq!(*log.borrow(), vec!["one", "two", "three"]);
}

#[test]
fn test_join_outside_instance_behaves_like_run() {
    let (_, rl) = setup();
    let ran = Rc::new(Cell::new(false));

    let ran_in = ran.clone();
    let scheduler = rl.clone();
    let value = rl.join(move || {
        scheduler
            .schedule("actions", move || ran_in.set(true))
            .unwrap();
        7
    });

    assert_eq!(value, Some(7));
    assert!(ran.get());
    assert!(rl.current_instance().is_none());
}

#[test]
fn test_default_queue_option_routes_expired_timers() {
    let platform = VirtualPlatform::new();
    let rl = RunLoop::with_options(
        &["actions", "timers"],
        platform.clone(),
        RunLoopOptions {
            default_queue: Some("timers".to_string()),
            ..Default::default()
        },
    );
    let log = recorder();

    // the timer's fire and a direct schedule land in different queues;
    // declared order decides execution order within the flush
    let l = log.clone();
    let scheduler = rl.clone();
    rl.later(5, move || {
        record(&l, "timer-fire");
        let la = l.clone();
        scheduler
            .schedule("actions", move || record(&la, "timer-scheduled-action"))
            .unwrap();
    });

    platform.advance(5);
    assert_eq!(*log.borrow(), vec!["timer-fire", "timer-scheduled-action"]);
}
