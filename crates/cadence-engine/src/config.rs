//! Scheduler configuration, validation, and error types.
//!
//! [`SchedulerConfig`] is the input for constructing a
//! [`Scheduler`](crate::scheduler::Scheduler) or a
//! [`RealtimeScheduler`](crate::realtime::RealtimeScheduler).
//! [`validate()`](SchedulerConfig::validate) checks structural invariants
//! at startup.

use std::error::Error;
use std::fmt;
use std::time::Duration;

/// Default tick period in milliseconds.
pub const TICK_PERIOD_MS: u64 = 50;

/// Default cap on cumulative updates in one convergence loop.
pub const UPDATE_CAP: u64 = 100_000;

// ── LockBackoffConfig ──────────────────────────────────────────────

/// Configuration for the snapshot-lock writer acquisition loop.
///
/// The writer never gives up: each failed attempt waits longer than the
/// last and emits diagnostics naming the readers that hold the lock.
#[derive(Clone, Debug)]
pub struct LockBackoffConfig {
    /// Wait for the first attempt. Default: 500 ms.
    pub initial_wait: Duration,
    /// Multiplicative factor applied after each failed attempt. Default: 1.5.
    pub backoff_factor: f64,
    /// Readers held longer than this are reported on failure. Default: 50 ms.
    pub report_threshold: Duration,
    /// Cumulative stall after which core locking threads are also
    /// reported. Default: 2 s.
    pub core_report_after: Duration,
}

impl Default for LockBackoffConfig {
    fn default() -> Self {
        Self {
            initial_wait: Duration::from_millis(500),
            backoff_factor: 1.5,
            report_threshold: Duration::from_millis(50),
            core_report_after: Duration::from_secs(2),
        }
    }
}

// ── TaskManagerConfig ─────────────────────────────────────────────

/// Configuration for a [`TaskManager`](crate::task_manager::TaskManager).
#[derive(Clone, Debug)]
pub struct TaskManagerConfig {
    /// Threads in the pool that runs non-long-life async tasks. Default: 20.
    pub pool_threads: usize,
    /// Priority-queue buckets are `tick_period / bucket_divisor` ms wide.
    /// Default: 4.
    pub bucket_divisor: u64,
    /// First wait for outstanding async tasks during shutdown. Default: 2 s.
    pub shutdown_wait_initial: Duration,
    /// Upper bound for the doubling shutdown wait. Default: 8 s.
    pub shutdown_wait_cap: Duration,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            pool_threads: 20,
            bucket_divisor: 4,
            shutdown_wait_initial: Duration::from_secs(2),
            shutdown_wait_cap: Duration::from_secs(8),
        }
    }
}

// ── ThresholdRefresh ──────────────────────────────────────────────

/// When the dynamic-update threshold is recomputed during convergence.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ThresholdRefresh {
    /// Once, before the convergence loop starts.
    PerLoop,
    /// Before every dynamic-update pass, once per convergence round.
    #[default]
    PerPass,
}

// ── ConfigError ────────────────────────────────────────────────────

/// Errors detected during [`SchedulerConfig::validate()`].
#[derive(Debug, PartialEq)]
pub enum ConfigError {
    /// `tick_period_ms` is zero.
    ZeroTickPeriod,
    /// `update_cap` is zero.
    ZeroUpdateCap,
    /// `start_tick_stages` is zero; Stage1 always runs.
    NoStartTickStages,
    /// `stage_worker_count` is `Some(0)`.
    ZeroStageWorkers,
    /// `stall_timeout_multiplier` is zero.
    ZeroStallTimeout,
    /// `LockBackoffConfig` invariant violated.
    InvalidLockBackoff {
        /// Description of which invariant was violated.
        reason: String,
    },
    /// `TaskManagerConfig` invariant violated.
    InvalidTaskManager {
        /// Description of which invariant was violated.
        reason: String,
    },
    /// A background thread or pool could not be spawned.
    ThreadSpawnFailed {
        /// Description of which thread failed.
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroTickPeriod => write!(f, "tick_period_ms must be at least 1"),
            Self::ZeroUpdateCap => write!(f, "update_cap must be at least 1"),
            Self::NoStartTickStages => write!(f, "start_tick_stages must be at least 1"),
            Self::ZeroStageWorkers => write!(f, "stage_worker_count must be at least 1"),
            Self::ZeroStallTimeout => write!(f, "stall_timeout_multiplier must be at least 1"),
            Self::InvalidLockBackoff { reason } => {
                write!(f, "invalid lock backoff config: {reason}")
            }
            Self::InvalidTaskManager { reason } => {
                write!(f, "invalid task manager config: {reason}")
            }
            Self::ThreadSpawnFailed { reason } => {
                write!(f, "thread spawn failed: {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

// ── SchedulerConfig ────────────────────────────────────────────────

/// Complete configuration for a scheduler.
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Fixed tick period in milliseconds. Default: 50.
    pub tick_period_ms: u64,
    /// Cap on cumulative dynamic + physics updates per tick. Default: 100 000.
    pub update_cap: u64,
    /// Number of start-tick stages: Stage1 plus `n - 1` Stage2+ slots.
    /// Default: 3.
    pub start_tick_stages: usize,
    /// Number of sequenced sub-steps (`0..local_sequences`) in the dynamic
    /// and physics passes, in addition to the all-managers sub-step `-1`.
    /// Default: 1.
    pub local_sequences: i32,
    /// Whether the convergence loop runs dynamic-update passes. Default: true.
    pub dynamic_updates: bool,
    /// Whether the convergence loop runs physics passes. Default: true.
    pub block_physics: bool,
    /// Dynamic-update threshold recompute policy.
    pub threshold_refresh: ThresholdRefresh,
    /// Stage pool threads. `None` = `2 × available_parallelism + 1`.
    pub stage_worker_count: Option<usize>,
    /// Stage waits time out after this many tick periods, then log and keep
    /// waiting. Default: 16.
    pub stall_timeout_multiplier: u32,
    /// Snapshot-lock writer acquisition backoff.
    pub lock_backoff: LockBackoffConfig,
    /// Primary task manager settings.
    pub task_manager: TaskManagerConfig,
    /// The realtime loop resets its schedule when it falls this far behind.
    /// Default: 10 000 ms.
    pub catch_up_limit_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_period_ms: TICK_PERIOD_MS,
            update_cap: UPDATE_CAP,
            start_tick_stages: 3,
            local_sequences: 1,
            dynamic_updates: true,
            block_physics: true,
            threshold_refresh: ThresholdRefresh::PerPass,
            stage_worker_count: None,
            stall_timeout_multiplier: 16,
            lock_backoff: LockBackoffConfig::default(),
            task_manager: TaskManagerConfig::default(),
            catch_up_limit_ms: 10_000,
        }
    }
}

impl SchedulerConfig {
    /// Check structural invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_period_ms == 0 {
            return Err(ConfigError::ZeroTickPeriod);
        }
        if self.update_cap == 0 {
            return Err(ConfigError::ZeroUpdateCap);
        }
        if self.start_tick_stages == 0 {
            return Err(ConfigError::NoStartTickStages);
        }
        if self.stage_worker_count == Some(0) {
            return Err(ConfigError::ZeroStageWorkers);
        }
        if self.stall_timeout_multiplier == 0 {
            return Err(ConfigError::ZeroStallTimeout);
        }

        let lb = &self.lock_backoff;
        if lb.initial_wait.is_zero() {
            return Err(ConfigError::InvalidLockBackoff {
                reason: "initial_wait must be non-zero".into(),
            });
        }
        if !lb.backoff_factor.is_finite() || lb.backoff_factor < 1.0 {
            return Err(ConfigError::InvalidLockBackoff {
                reason: format!(
                    "backoff_factor must be finite and >= 1.0, got {}",
                    lb.backoff_factor
                ),
            });
        }

        let tm = &self.task_manager;
        if tm.pool_threads == 0 {
            return Err(ConfigError::InvalidTaskManager {
                reason: "pool_threads must be at least 1".into(),
            });
        }
        if tm.bucket_divisor == 0 || tm.bucket_divisor > self.tick_period_ms {
            return Err(ConfigError::InvalidTaskManager {
                reason: format!(
                    "bucket_divisor must be in [1, tick_period_ms], got {}",
                    tm.bucket_divisor
                ),
            });
        }
        if tm.shutdown_wait_initial.is_zero() || tm.shutdown_wait_cap < tm.shutdown_wait_initial
        {
            return Err(ConfigError::InvalidTaskManager {
                reason: "shutdown_wait_cap must be >= shutdown_wait_initial > 0".into(),
            });
        }
        Ok(())
    }

    /// Resolve the stage pool size, applying auto-detection if `None`.
    pub fn resolved_stage_workers(&self) -> usize {
        match self.stage_worker_count {
            Some(n) => n.max(1),
            None => {
                let cpus = std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(4);
                cpus * 2 + 1
            }
        }
    }

    /// The fixed tick period.
    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms)
    }

    /// How long a stage wait blocks before reporting a stall.
    pub fn stall_timeout(&self) -> Duration {
        self.tick_period() * self.stall_timeout_multiplier
    }

    /// Width of a task-queue bucket in milliseconds.
    pub fn bucket_width_ms(&self) -> u64 {
        (self.tick_period_ms / self.task_manager.bucket_divisor).max(1)
    }
}
