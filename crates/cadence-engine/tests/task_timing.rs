//! Integration test: sync task timing against the virtual uptime, async
//! task cancellation, and task manager shutdown.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cadence_core::{Owner, ScheduleError, TaskPriority};
use cadence_engine::{LoadMonitor, SchedulerConfig, TaskContext, TaskManager, TaskManagerConfig};
use proptest::prelude::*;

fn config() -> SchedulerConfig {
    SchedulerConfig {
        task_manager: TaskManagerConfig {
            pool_threads: 2,
            ..Default::default()
        },
        ..SchedulerConfig::default()
    }
}

fn manager() -> TaskManager {
    TaskManager::primary(&config(), None).unwrap()
}

fn counter() -> (Arc<AtomicUsize>, impl FnMut(&TaskContext<'_>) + Send + 'static) {
    let runs = Arc::new(AtomicUsize::new(0));
    let r = Arc::clone(&runs);
    (runs, move |_: &TaskContext<'_>| {
        r.fetch_add(1, Ordering::SeqCst);
    })
}

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while !check() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(2));
    }
    true
}

// ── Sync timing ──────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn one_shot_fires_once_when_uptime_reaches_delay(
        delay in 0u64..400,
        steps in proptest::collection::vec(1u64..60, 1..20),
    ) {
        let tm = TaskManager::secondary("timing", &config(), None, 0);
        let (runs, work) = counter();
        let task = tm.schedule_sync_delayed("p", work, delay, TaskPriority::Normal).unwrap();

        let mut elapsed = 0;
        for step in steps {
            tm.heartbeat(step);
            elapsed += step;
            let expected = usize::from(elapsed >= delay);
            prop_assert_eq!(runs.load(Ordering::SeqCst), expected);
        }
        if elapsed >= delay {
            prop_assert!(!tm.is_queued(task.id()));
        }
    }
}

#[test]
fn repeating_task_fires_k_plus_one_times_and_stays_queued() {
    let period = 50;
    for k in [0u64, 1, 4, 9] {
        let tm = TaskManager::secondary("timing", &config(), None, 0);
        let (runs, work) = counter();
        let task = tm
            .schedule_sync_repeating("p", work, 0, period, TaskPriority::Normal)
            .unwrap();

        // Uptime t0 + kP + 1, one tick-sized heartbeat at a time.
        let target = k * period + 1;
        let mut up = 0;
        while up < target {
            let step = period.min(target - up);
            tm.heartbeat(step);
            up += step;
        }

        assert_eq!(runs.load(Ordering::SeqCst) as u64, k + 1, "k = {k}");
        assert!(tm.is_queued(task.id()));
        assert!(task.is_alive());
    }
}

#[test]
fn next_call_time_never_falls_behind_uptime() {
    let tm = TaskManager::secondary("timing", &config(), None, 0);
    let (runs, work) = counter();
    let task = tm
        .schedule_sync_repeating("p", work, 0, 10, TaskPriority::Normal)
        .unwrap();

    // One large jump: the task fires once and is re-armed in the future.
    tm.heartbeat(1_000);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(task.next_call_time() > tm.up_time());
}

#[test]
fn cancelled_sync_task_never_runs() {
    let tm = manager();
    let (runs, work) = counter();
    let task = tm
        .schedule_sync_delayed("p", work, 100, TaskPriority::Normal)
        .unwrap();

    assert!(tm.cancel_task(task.id()));
    assert!(!tm.is_queued(task.id()));
    tm.heartbeat(500);
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert!(!tm.cancel_task(task.id()));
}

#[test]
fn owner_cancellation_leaves_other_owners() {
    let tm = manager();
    let (a_runs, a) = counter();
    let (b_runs, b) = counter();
    tm.schedule_sync_delayed("a", a, 10, TaskPriority::Normal).unwrap();
    tm.schedule_sync_delayed("b", b, 10, TaskPriority::Normal).unwrap();

    tm.cancel_tasks(&Owner::new("a"));
    tm.heartbeat(20);
    assert_eq!(a_runs.load(Ordering::SeqCst), 0);
    assert_eq!(b_runs.load(Ordering::SeqCst), 1);
}

#[test]
fn deferrable_task_waits_under_overload() {
    let load = Arc::new(LoadMonitor::new(50));
    let tm = TaskManager::secondary("timing", &config(), Some(Arc::clone(&load)), 0);
    let (critical_runs, critical) = counter();
    let (low_runs, low) = counter();
    tm.schedule_sync_delayed("c", critical, 0, TaskPriority::Critical).unwrap();
    tm.schedule_sync_delayed("l", low, 0, TaskPriority::Highest).unwrap();

    load.begin_tick(true);
    tm.heartbeat(50);
    assert_eq!(critical_runs.load(Ordering::SeqCst), 1);
    assert_eq!(low_runs.load(Ordering::SeqCst), 0);

    // Highest defers for at most 500 ms of uptime, then runs regardless.
    for _ in 0..12 {
        load.begin_tick(true);
        tm.heartbeat(50);
    }
    assert_eq!(low_runs.load(Ordering::SeqCst), 1);
}

// ── Async tasks ──────────────────────────────────────────────────────

#[test]
fn cancelling_an_in_flight_async_task_interrupts_it() {
    let tm = manager();
    let started = Arc::new(AtomicBool::new(false));
    let interrupted = Arc::new(AtomicBool::new(false));
    let (s, i) = (Arc::clone(&started), Arc::clone(&interrupted));

    let task = tm
        .schedule_async(
            "p",
            move |ctx: &TaskContext<'_>| {
                s.store(true, Ordering::SeqCst);
                while ctx.sleep(Duration::from_millis(5)) {}
                i.store(true, Ordering::SeqCst);
            },
            false,
        )
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || started.load(Ordering::SeqCst)));
    assert_eq!(tm.active_workers().len(), 1);

    assert!(tm.cancel_task(task.id()));
    assert!(tm.wait_for_async_tasks(Duration::from_secs(5)));
    assert!(interrupted.load(Ordering::SeqCst));
    assert!(!tm.is_queued(task.id()));
    assert!(tm.active_workers().is_empty());
}

#[test]
fn long_life_task_gets_its_own_thread() {
    let tm = manager();
    let name = Arc::new(parking_lot::Mutex::new(String::new()));
    let n = Arc::clone(&name);
    let task = tm
        .schedule_async(
            "p",
            move |_: &TaskContext<'_>| {
                *n.lock() = thread::current().name().unwrap_or_default().to_string();
            },
            true,
        )
        .unwrap();

    assert!(tm.wait_for_async_tasks(Duration::from_secs(5)));
    assert_eq!(*name.lock(), format!("cadence-task-{}", task.id()));
}

#[test]
fn async_repeating_task_runs_until_cancelled() {
    let tm = manager();
    let (runs, work) = counter();
    let task = tm
        .schedule_async_repeating("p", work, 0, 1, TaskPriority::Normal)
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || runs.load(Ordering::SeqCst) >= 3));
    tm.cancel(&task);
    assert!(tm.wait_for_async_tasks(Duration::from_secs(5)));
    let after = runs.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(30));
    assert_eq!(runs.load(Ordering::SeqCst), after);
}

#[test]
fn async_repeating_task_keeps_its_period() {
    let tm = manager();
    let (runs, work) = counter();
    let task = tm
        .schedule_async_repeating("p", work, 0, 50, TaskPriority::Normal)
        .unwrap();

    thread::sleep(Duration::from_millis(1_000));
    let seen = runs.load(Ordering::SeqCst);
    tm.cancel(&task);
    assert!(tm.wait_for_async_tasks(Duration::from_secs(5)));
    // About 21 runs at 50 ms; the wait must not grow with elapsed time.
    assert!((12..=26).contains(&seen), "ran {seen} times in one second");
}

// ── Shutdown ─────────────────────────────────────────────────────────

#[test]
fn shutdown_rejects_new_tasks() {
    let tm = manager();
    tm.shutdown().unwrap();
    let (_, work) = counter();
    assert_eq!(
        tm.schedule_async("p", work, false).unwrap_err(),
        ScheduleError::ShutDown
    );
    let (_, work) = counter();
    assert!(tm
        .schedule_sync_delayed("p", work, 0, TaskPriority::Normal)
        .is_err());
}

#[test]
fn wait_for_async_tasks_reports_timeout() {
    let tm = manager();
    let stop = Arc::new(AtomicBool::new(false));
    let s = Arc::clone(&stop);
    tm.schedule_async(
        "slow",
        move |_: &TaskContext<'_>| {
            while !s.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(2));
            }
        },
        true,
    )
    .unwrap();

    assert!(!tm.wait_for_async_tasks(Duration::from_millis(30)));
    assert_eq!(tm.active_workers()[0].owner().name(), "slow");
    stop.store(true, Ordering::SeqCst);
    assert!(tm.wait_for_async_tasks(Duration::from_secs(5)));
}
