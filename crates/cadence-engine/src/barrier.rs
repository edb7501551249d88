//! Barrier-synchronized stage execution over the stage pool.
//!
//! For each sub-sequence of a [`StageDescriptor`], every eligible manager
//! is asked for a unit of work; all returned units are submitted to the
//! stage pool and the calling (tick) thread blocks until every one has
//! completed before moving on to the next sub-sequence.
//!
//! ```text
//! Tick thread                      Stage pool (2×CPU+1)
//!     | set stage marker                 |
//!     | unit_for(manager, s) ... ------->| catch_unwind(unit)
//!     | select! {                        | done_tx.send(idx)
//!     |   done_rx      <-----------------|
//!     |   interrupt_rx                   |
//!     |   default(16 × period) => log stalled units, keep waiting
//!     | }                                |
//!     | next sub-sequence                |
//! ```

use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cadence_core::{AsyncManager, StageWriter, UpdateCounter};
use crossbeam_channel::{select, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::ConfigError;
use crate::descriptor::StageDescriptor;
use crate::lock::mark_stage_pool_thread;

/// Extract a printable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

/// Handle that interrupts a [`StageRunner`]'s current (or next) wait.
///
/// An interrupt abandons the wait for one sub-sequence only; the stage
/// moves on to the next sub-sequence and the tick carries on. Interrupts
/// coalesce: several calls before the runner observes one count as a
/// single interrupt.
#[derive(Clone, Debug)]
pub struct StageInterrupter {
    tx: Sender<()>,
}

impl StageInterrupter {
    /// Abandon the runner's current sub-sequence wait.
    pub fn interrupt(&self) {
        let _ = self.tx.try_send(());
    }
}

/// Result of one [`StageRunner::run_stage`] call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StageOutcome {
    /// Units submitted across all sub-sequences.
    pub units: usize,
    /// Units that panicked.
    pub panics: usize,
    /// Stall timeouts hit while waiting.
    pub stall_warnings: u64,
    /// Sub-sequence waits abandoned on interrupt.
    pub interrupted_waits: usize,
    /// Wall-clock time for the whole stage.
    pub elapsed: Duration,
}

enum Wake {
    Done(usize, Option<String>),
    Disconnected,
    Interrupted,
    Timeout,
}

/// One unit that had not completed when a stall was reported.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StalledUnit {
    /// The manager that produced the unit.
    pub manager: String,
    /// Pool thread running it, or `None` if it has not started yet.
    pub thread: Option<String>,
    /// Time since the unit started running.
    pub running_for: Option<Duration>,
}

/// Diagnostics captured when a stage wait times out.
#[derive(Clone, Debug)]
pub struct StallReport {
    /// Stage that stalled.
    pub stage: String,
    /// Sub-sequence being waited on.
    pub sub_seq: i32,
    /// Units still outstanding.
    pub units: Vec<StalledUnit>,
    /// Stack of the waiting tick thread at the time of the report.
    pub backtrace: String,
}

/// Where a submitted unit is running, for stall reports.
#[derive(Clone, Debug)]
struct RunningSlot {
    thread: String,
    started: Instant,
}

/// Runs stage descriptors across the registered managers on a shared pool.
pub struct StageRunner {
    pool: rayon::ThreadPool,
    stall_timeout: Duration,
    setup_complete: Arc<AtomicBool>,
    interrupt_tx: Sender<()>,
    interrupt_rx: Receiver<()>,
    stall_warnings: AtomicU64,
    unit_panics: AtomicU64,
    last_stall: Mutex<Option<StallReport>>,
}

impl StageRunner {
    /// Build a runner with a pool of `workers` threads named
    /// `cadence-stage-{i}`.
    pub fn new(
        workers: usize,
        stall_timeout: Duration,
        setup_complete: Arc<AtomicBool>,
    ) -> Result<Self, ConfigError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("cadence-stage-{i}"))
            .start_handler(|_| mark_stage_pool_thread())
            .build()
            .map_err(|e| ConfigError::ThreadSpawnFailed {
                reason: format!("stage pool: {e}"),
            })?;
        let (interrupt_tx, interrupt_rx) = crossbeam_channel::bounded(1);
        Ok(Self {
            pool,
            stall_timeout,
            setup_complete,
            interrupt_tx,
            interrupt_rx,
            stall_warnings: AtomicU64::new(0),
            unit_panics: AtomicU64::new(0),
            last_stall: Mutex::new(None),
        })
    }

    /// A handle that interrupts this runner's waits.
    pub fn interrupter(&self) -> StageInterrupter {
        StageInterrupter {
            tx: self.interrupt_tx.clone(),
        }
    }

    /// Number of threads in the stage pool.
    pub fn workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Cumulative stall timeouts across all stages.
    pub fn stall_warnings(&self) -> u64 {
        self.stall_warnings.load(Ordering::Relaxed)
    }

    /// Cumulative panicked units across all stages.
    pub fn unit_panics(&self) -> u64 {
        self.unit_panics.load(Ordering::Relaxed)
    }

    /// The most recent stall report, if any stage wait has timed out since
    /// setup completed.
    pub fn last_stall(&self) -> Option<StallReport> {
        self.last_stall.lock().clone()
    }

    /// Run every sub-sequence of `descriptor` across `managers`.
    ///
    /// Sub-sequences run strictly ascending; no unit of sub-sequence
    /// `s + 1` is requested before every unit of `s` has completed.
    /// Panicking units are logged and counted as done. On interrupt the
    /// remaining wait for the current sub-sequence is abandoned and the
    /// runner advances; units already submitted still run to completion on
    /// the pool.
    pub fn run_stage(
        &self,
        managers: &[Arc<dyn AsyncManager>],
        descriptor: &StageDescriptor,
        stage: &StageWriter,
        updates: &UpdateCounter,
    ) -> StageOutcome {
        let start = Instant::now();
        let mut outcome = StageOutcome::default();

        for s in descriptor.min_sequence()..=descriptor.max_sequence() {
            stage.set(descriptor.stage_for(s));

            let mut names = Vec::new();
            let slots: Arc<Vec<Mutex<Option<RunningSlot>>>>;
            let (done_tx, done_rx) = crossbeam_channel::unbounded::<(usize, Option<String>)>();
            {
                let mut units = Vec::new();
                for manager in managers {
                    if s == -1 || s == manager.sequence() {
                        if let Some(unit) = descriptor.unit_for(manager.as_ref(), s, updates) {
                            names.push(manager.name().to_string());
                            units.push(unit);
                        }
                    }
                }
                slots = Arc::new((0..units.len()).map(|_| Mutex::new(None)).collect());
                for (idx, unit) in units.into_iter().enumerate() {
                    let done_tx = done_tx.clone();
                    let slots = Arc::clone(&slots);
                    self.pool.spawn(move || {
                        *slots[idx].lock() = Some(RunningSlot {
                            thread: thread::current().name().unwrap_or("<unnamed>").to_string(),
                            started: Instant::now(),
                        });
                        let result = panic::catch_unwind(AssertUnwindSafe(unit));
                        let panic = result.err().map(|p| panic_message(p.as_ref()));
                        let _ = done_tx.send((idx, panic));
                    });
                }
            }
            drop(done_tx);

            outcome.units += names.len();
            self.await_units(descriptor, s, &names, &slots, &done_rx, &mut outcome);
        }

        outcome.elapsed = start.elapsed();
        if outcome.units > 0 {
            debug!(
                stage = %descriptor.name(),
                units = outcome.units,
                elapsed_us = outcome.elapsed.as_micros() as u64,
                "stage complete"
            );
        }
        outcome
    }

    fn await_units(
        &self,
        descriptor: &StageDescriptor,
        sub_seq: i32,
        names: &[String],
        slots: &[Mutex<Option<RunningSlot>>],
        done_rx: &Receiver<(usize, Option<String>)>,
        outcome: &mut StageOutcome,
    ) {
        let mut done = vec![false; names.len()];
        let mut remaining = names.len();

        while remaining > 0 {
            let wake = select! {
                recv(done_rx) -> msg => match msg {
                    Ok((idx, panic)) => Wake::Done(idx, panic),
                    Err(_) => Wake::Disconnected,
                },
                recv(self.interrupt_rx) -> _ => Wake::Interrupted,
                default(self.stall_timeout) => Wake::Timeout,
            };

            match wake {
                Wake::Done(idx, panic) => {
                    done[idx] = true;
                    remaining -= 1;
                    if let Some(message) = panic {
                        outcome.panics += 1;
                        self.unit_panics.fetch_add(1, Ordering::Relaxed);
                        error!(
                            stage = %descriptor.name(),
                            manager = %names[idx],
                            panic = %message,
                            "stage unit panicked"
                        );
                    }
                }
                // Every sender is gone: the pool dropped jobs it could not run.
                Wake::Disconnected => break,
                Wake::Interrupted => {
                    outcome.interrupted_waits += 1;
                    info!(
                        stage = %descriptor.name(),
                        sub_seq,
                        outstanding = remaining,
                        "main thread interrupted while waiting on tick stage units"
                    );
                    return;
                }
                Wake::Timeout => {
                    outcome.stall_warnings += 1;
                    self.stall_warnings.fetch_add(1, Ordering::Relaxed);
                    if self.setup_complete.load(Ordering::Acquire) {
                        self.log_stall(descriptor, sub_seq, names, slots, &done);
                    }
                }
            }
        }
    }

    fn log_stall(
        &self,
        descriptor: &StageDescriptor,
        sub_seq: i32,
        names: &[String],
        slots: &[Mutex<Option<RunningSlot>>],
        done: &[bool],
    ) {
        let units: Vec<StalledUnit> = names
            .iter()
            .zip(done)
            .zip(slots)
            .filter(|((_, done), _)| !**done)
            .map(|((name, _), slot)| {
                let slot = slot.lock();
                StalledUnit {
                    manager: name.clone(),
                    thread: slot.as_ref().map(|s| s.thread.clone()),
                    running_for: slot.as_ref().map(|s| s.started.elapsed()),
                }
            })
            .collect();
        let report = StallReport {
            stage: descriptor.name(),
            sub_seq,
            units,
            backtrace: Backtrace::force_capture().to_string(),
        };

        warn!(
            stage = %report.stage,
            sub_seq,
            timeout_ms = self.stall_timeout.as_millis() as u64,
            "tick stage has not completed"
        );
        for unit in &report.units {
            match (&unit.thread, unit.running_for) {
                (Some(thread), Some(running_for)) => warn!(
                    manager = %unit.manager,
                    thread = %thread,
                    elapsed_ms = running_for.as_millis() as u64,
                    "manager has not completed its unit"
                ),
                _ => warn!(manager = %unit.manager, "manager unit is still waiting for a pool thread"),
            }
        }
        debug!(backtrace = %report.backtrace, "tick thread stack at stall");
        *self.last_stall.lock() = Some(report);
    }
}

impl std::fmt::Debug for StageRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRunner")
            .field("workers", &self.workers())
            .field("stall_timeout", &self.stall_timeout)
            .finish()
    }
}
