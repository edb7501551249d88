//! Integration test: whole-tick behaviour of the scheduler, lockstep and
//! realtime.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cadence_core::{AsyncManager, Owner, RegistryError, Stage, TaskPriority, TickError};
use cadence_engine::{RealtimeScheduler, Scheduler, SchedulerConfig, TaskManagerConfig};
use cadence_test_utils::{BlockingManager, CountingManager, PanickingManager};
use parking_lot::Mutex;

mod common;

fn config(period_ms: u64) -> SchedulerConfig {
    SchedulerConfig {
        tick_period_ms: period_ms,
        stage_worker_count: Some(2),
        task_manager: TaskManagerConfig {
            pool_threads: 2,
            ..Default::default()
        },
        ..SchedulerConfig::default()
    }
}

#[test]
fn every_stage_runs_once_per_tick() {
    let scheduler = Scheduler::new(config(50)).unwrap();
    let m = Arc::new(CountingManager::new("m", -1));
    scheduler.add_async_manager(Arc::clone(&m) as Arc<dyn AsyncManager>).unwrap();

    for _ in 0..3 {
        scheduler.tick(50).unwrap();
    }

    assert_eq!(CountingManager::count(&m.start_tick), 9);
    assert_eq!(CountingManager::count(&m.dynamic), 3);
    assert_eq!(CountingManager::count(&m.physics), 3);
    assert_eq!(CountingManager::count(&m.lighting), 3);
    assert_eq!(CountingManager::count(&m.finalize), 3);
    assert_eq!(CountingManager::count(&m.pre_snapshot), 3);
    assert_eq!(CountingManager::count(&m.copy_snapshot), 3);
}

#[test]
fn nested_tick_is_rejected() {
    let scheduler = Arc::new(Scheduler::new(config(50)).unwrap());
    let nested = Arc::new(Mutex::new(None));
    let (s, n) = (Arc::clone(&scheduler), Arc::clone(&nested));
    scheduler.schedule_core_task(move || {
        *n.lock() = Some(s.tick(50).map(|r| r.tick));
    });

    let report = scheduler.tick(50).unwrap();

    assert_eq!(report.tick, 1);
    assert_eq!(*nested.lock(), Some(Err(TickError::Reentrant)));
    assert_eq!(scheduler.tick(50).unwrap().tick, 2);
}

#[test]
fn registry_is_frozen_during_the_snapshot_window() {
    let scheduler = Arc::new(Scheduler::new(config(50)).unwrap());
    let result = Arc::new(Mutex::new(None));
    let (s, r) = (Arc::clone(&scheduler), Arc::clone(&result));
    scheduler.schedule_core_task(move || {
        let m: Arc<dyn AsyncManager> = Arc::new(CountingManager::new("late", -1));
        *r.lock() = Some(s.add_async_manager(m));
    });

    scheduler.tick(50).unwrap();

    assert_eq!(
        *result.lock(),
        Some(Err(RegistryError::SnapshotWindow {
            stage: Stage::Snapshot
        }))
    );
    assert!(scheduler.async_managers().is_empty());
}

#[test]
fn panicking_manager_does_not_break_the_tick() {
    let scheduler = Scheduler::new(config(50)).unwrap();
    let counting = Arc::new(CountingManager::new("ok", -1));
    scheduler.add_async_manager(Arc::new(PanickingManager::new("boom"))).unwrap();
    scheduler.add_async_manager(Arc::clone(&counting) as Arc<dyn AsyncManager>).unwrap();

    let report = scheduler.tick(50).unwrap();

    assert_eq!(report.metrics.unit_panics, 1);
    assert_eq!(CountingManager::count(&counting.copy_snapshot), 1);
    assert!(!scheduler.snapshot_lock().is_write_locked());
}

#[test]
fn interrupted_wait_does_not_end_the_tick() {
    common::init_test_logging();
    let scheduler = Arc::new(Scheduler::new(config(50)).unwrap());
    let blocking = Arc::new(BlockingManager::new());
    let counting = Arc::new(CountingManager::new("m", -1));
    scheduler
        .add_async_manager(Arc::clone(&blocking) as Arc<dyn AsyncManager>)
        .unwrap();
    scheduler
        .add_async_manager(Arc::clone(&counting) as Arc<dyn AsyncManager>)
        .unwrap();

    let s = Arc::clone(&scheduler);
    let ticker = thread::spawn(move || s.tick(50));
    assert!(blocking.wait_entered(Duration::from_secs(5)));
    assert!(scheduler.snapshot_lock().is_write_locked());

    scheduler.interrupter().interrupt();
    let report = ticker.join().unwrap().unwrap();
    blocking.release();

    assert_eq!(report.metrics.interrupted_waits, 1);
    assert_eq!(CountingManager::count(&counting.finalize), 1);
    assert_eq!(CountingManager::count(&counting.pre_snapshot), 1);
    assert_eq!(CountingManager::count(&counting.copy_snapshot), 1);
    assert!(!scheduler.snapshot_lock().is_write_locked());
    assert_eq!(scheduler.stage().current(), Stage::TickStart);
    assert!(scheduler.tick(50).is_ok());
}

#[test]
fn realtime_loop_survives_a_stage_interrupt() {
    common::init_test_logging();
    let scheduler = Arc::new(Scheduler::new(config(10)).unwrap());
    let m = Arc::new(CountingManager::new("m", -1));
    scheduler.add_async_manager(Arc::clone(&m) as Arc<dyn AsyncManager>).unwrap();

    let mut rt = RealtimeScheduler::start(Arc::clone(&scheduler)).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while scheduler.tick_count() < 2 {
        assert!(Instant::now() < deadline, "loop did not start ticking");
        thread::sleep(Duration::from_millis(2));
    }

    scheduler.interrupter().interrupt();
    let after = scheduler.tick_count();
    while scheduler.tick_count() < after + 5 {
        assert!(Instant::now() < deadline, "loop stopped ticking after interrupt");
        thread::sleep(Duration::from_millis(2));
    }

    assert!(rt.is_running());
    let report = rt.stop();
    assert!(report.tick_joined);
    assert!(report.ticks >= after + 5);
}

#[test]
fn readers_wait_out_the_snapshot_phase() {
    let scheduler = Arc::new(Scheduler::new(config(50)).unwrap());
    let blocking = Arc::new(BlockingManager::new());
    scheduler
        .add_async_manager(Arc::clone(&blocking) as Arc<dyn AsyncManager>)
        .unwrap();

    let s = Arc::clone(&scheduler);
    let ticker = thread::spawn(move || s.tick(50));
    assert!(blocking.wait_entered(Duration::from_secs(5)));

    let s = Arc::clone(&scheduler);
    let reader = thread::spawn(move || {
        let start = Instant::now();
        s.safe_call(&Owner::new("plugin"), || s.stage().current())
            .map(|stage| (stage, start.elapsed()))
    });

    thread::sleep(Duration::from_millis(40));
    blocking.release();
    ticker.join().unwrap().unwrap();

    let (stage, waited) = reader.join().unwrap().unwrap();
    assert_eq!(stage, Stage::TickStart);
    assert!(waited >= Duration::from_millis(30));
}

#[test]
fn realtime_scheduler_ticks_managers_and_tasks() {
    common::init_test_logging();
    let scheduler = Arc::new(Scheduler::new(config(5)).unwrap());
    let m = Arc::new(CountingManager::new("m", 0));
    scheduler.add_async_manager(Arc::clone(&m) as Arc<dyn AsyncManager>).unwrap();
    let pulses = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let p = Arc::clone(&pulses);
    scheduler
        .task_manager()
        .schedule_sync_repeating(
            "plugin",
            move |_| {
                p.fetch_add(1, Ordering::SeqCst);
            },
            0,
            5,
            TaskPriority::Normal,
        )
        .unwrap();
    scheduler.set_setup_complete();

    let mut rt = RealtimeScheduler::start(Arc::clone(&scheduler)).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while CountingManager::count(&m.copy_snapshot) < 5 {
        assert!(Instant::now() < deadline, "managers not ticked within 5s");
        thread::sleep(Duration::from_millis(5));
    }
    let report = rt.stop();

    assert!(report.tick_joined);
    assert!(report.ticks >= 5);
    assert!(pulses.load(Ordering::SeqCst) >= 1);
    // Sequence-0 manager: local and global physics passes every round.
    assert!(CountingManager::count(&m.physics) >= 2 * report.ticks as usize);
    assert!(!scheduler.task_manager().is_alive());
}
