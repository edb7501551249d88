//! Integration test: snapshot lock exclusion between readers and the
//! tick thread's writer, driven from many user threads at once.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use cadence_core::Owner;
use cadence_engine::{LockBackoffConfig, Scheduler, SchedulerConfig, SnapshotLock, TaskManagerConfig};

#[test]
fn many_readers_hold_the_lock_together() {
    let lock = Arc::new(SnapshotLock::new());
    let readers = 8;
    let inside = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let all_in = Arc::new(Barrier::new(readers));

    let handles: Vec<_> = (0..readers)
        .map(|i| {
            let lock = Arc::clone(&lock);
            let inside = Arc::clone(&inside);
            let peak = Arc::clone(&peak);
            let all_in = Arc::clone(&all_in);
            thread::spawn(move || {
                let owner = Owner::new(format!("plugin-{i}"));
                let _guard = lock.read(&owner);
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                all_in.wait();
                inside.fetch_sub(1, Ordering::SeqCst);
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(peak.load(Ordering::SeqCst), readers);
    assert_eq!(lock.reader_count(), 0);
}

#[test]
fn writer_waits_for_readers_to_release() {
    let lock = Arc::new(SnapshotLock::new());
    let holding = Arc::new(Barrier::new(2));
    let release = Arc::new(Barrier::new(2));

    let reader = {
        let lock = Arc::clone(&lock);
        let holding = Arc::clone(&holding);
        let release = Arc::clone(&release);
        thread::spawn(move || {
            let owner = Owner::new("slow-plugin");
            lock.read_lock(&owner);
            holding.wait();
            release.wait();
            thread::sleep(Duration::from_millis(30));
            lock.read_unlock(&owner).unwrap();
        })
    };

    holding.wait();
    assert!(!lock.write_lock(Duration::from_millis(20)));
    let held = lock.locking_owners(Duration::ZERO);
    assert_eq!(held.len(), 1);
    assert_eq!(held[0].owner.name(), "slow-plugin");

    release.wait();
    let start = Instant::now();
    assert!(lock.write_lock(Duration::from_secs(5)));
    assert!(start.elapsed() >= Duration::from_millis(20));
    lock.write_unlock();
    reader.join().unwrap();
}

#[test]
fn readers_block_while_the_writer_holds() {
    let lock = Arc::new(SnapshotLock::new());
    assert!(lock.write_lock(Duration::from_millis(100)));

    let acquired = Arc::new(AtomicBool::new(false));
    let reader = {
        let lock = Arc::clone(&lock);
        let acquired = Arc::clone(&acquired);
        thread::spawn(move || {
            let owner = Owner::new("reader");
            assert!(!lock.try_read_lock(&owner));
            let _guard = lock.read(&owner);
            acquired.store(true, Ordering::SeqCst);
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!acquired.load(Ordering::SeqCst));
    lock.write_unlock();
    reader.join().unwrap();
    assert!(acquired.load(Ordering::SeqCst));
}

#[test]
fn backoff_acquires_once_readers_leave() {
    let lock = Arc::new(SnapshotLock::new());
    let holding = Arc::new(Barrier::new(2));
    let reader = {
        let lock = Arc::clone(&lock);
        let holding = Arc::clone(&holding);
        thread::spawn(move || {
            let _guard = lock.core_read("autosave");
            holding.wait();
            thread::sleep(Duration::from_millis(60));
        })
    };
    holding.wait();

    let config = LockBackoffConfig {
        initial_wait: Duration::from_millis(10),
        backoff_factor: 1.5,
        report_threshold: Duration::ZERO,
        core_report_after: Duration::ZERO,
    };
    let stall = lock.write_lock_with_backoff(&config);
    assert!(stall.retries >= 1);
    assert!(stall.stalled >= Duration::from_millis(30));
    assert!(lock.is_write_locked());
    lock.write_unlock();
    reader.join().unwrap();
}

#[test]
fn core_tasks_may_read_under_the_tick_writer() {
    let scheduler = Arc::new(
        Scheduler::new(SchedulerConfig {
            stage_worker_count: Some(2),
            task_manager: TaskManagerConfig {
                pool_threads: 1,
                ..Default::default()
            },
            ..SchedulerConfig::default()
        })
        .unwrap(),
    );
    let reads = Arc::new(AtomicUsize::new(0));
    let (s, r) = (Arc::clone(&scheduler), Arc::clone(&reads));
    scheduler.schedule_core_task(move || {
        s.safe_run(&Owner::new("plugin"), || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        let value = s.core_safe_call("autosave", || 7);
        assert_eq!(value, Some(7));
        r.fetch_add(1, Ordering::SeqCst);
    });

    let (tx, rx) = crossbeam_channel::bounded(1);
    let s = Arc::clone(&scheduler);
    thread::spawn(move || {
        let _ = tx.send(s.tick(50).is_ok());
    });

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(true));
    assert_eq!(reads.load(Ordering::SeqCst), 2);
    assert_eq!(scheduler.snapshot_lock().reader_count(), 0);
    assert!(!scheduler.snapshot_lock().is_write_locked());
}

#[test]
fn guard_dropped_on_another_thread_releases_its_holder() {
    let lock = SnapshotLock::new();
    let core_guard = lock.core_read("autosave");
    let owner_guard = lock.read(&Owner::new("plugin"));
    assert_eq!(lock.core_locking_threads().len(), 1);

    thread::scope(|scope| {
        scope.spawn(move || {
            drop(core_guard);
            drop(owner_guard);
        });
    });

    assert_eq!(lock.reader_count(), 0);
    assert!(lock.core_locking_threads().is_empty());
    assert!(lock.locking_tasks().is_empty());
    assert!(lock.locking_owners(Duration::ZERO).is_empty());

    // Nothing is left registered for this thread, so a waiting writer is
    // not bypassed by a stale reentrant entry.
    assert!(lock.write_lock(Duration::from_millis(50)));
    lock.write_unlock();
}
