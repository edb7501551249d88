//! Per-tick performance metrics for the scheduler.
//!
//! [`TickMetrics`] captures timing and convergence data for a single tick,
//! together with cumulative diagnostic counters, for telemetry and for the
//! realtime loop's overload decisions.

/// Timing and convergence metrics collected during a single tick.
///
/// All durations are in microseconds unless noted. Cumulative counters
/// cover the scheduler's lifetime, not just this tick.
#[derive(Clone, Debug, Default)]
pub struct TickMetrics {
    /// Wall-clock time for the entire tick, in microseconds.
    pub total_us: u64,
    /// Per-stage execution times: `(stage name, microseconds)`.
    pub stage_us: Vec<(String, u64)>,
    /// Dynamic updates performed by the convergence loop.
    pub dynamic_updates: u64,
    /// Physics updates performed by the convergence loop.
    pub physics_updates: u64,
    /// Rounds of the convergence loop. Each round runs one dynamic pass
    /// and one physics pass, as enabled.
    pub convergence_passes: u32,
    /// Whether the convergence loop stopped at the update cap.
    pub update_cap_hit: bool,
    /// Time spent acquiring the snapshot writer, in milliseconds.
    pub lock_stall_ms: u64,
    /// Sync tasks pulsed by this tick's heartbeat.
    pub tasks_pulsed: usize,
    /// Core tasks drained after the snapshot copy.
    pub core_tasks_run: usize,
    /// Sub-sequence waits abandoned because the tick thread was
    /// interrupted.
    pub interrupted_waits: usize,
    /// Cumulative number of stage-wait stall timeouts.
    pub stall_warnings: u64,
    /// Cumulative number of failed writer acquisition attempts.
    pub lock_stall_retries: u64,
    /// Cumulative number of update-cap warnings.
    pub update_cap_warnings: u64,
    /// Cumulative number of stage units that panicked.
    pub unit_panics: u64,
    /// Cumulative number of core tasks that panicked.
    pub core_task_panics: u64,
}

impl TickMetrics {
    /// Total updates (dynamic + physics) this tick.
    pub fn total_updates(&self) -> u64 {
        self.dynamic_updates + self.physics_updates
    }

    /// Time recorded for the named stage, summed over repeated runs.
    pub fn stage_time_us(&self, name: &str) -> u64 {
        self.stage_us
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, us)| *us)
            .sum()
    }
}

/// Outcome of one successful [`Scheduler::tick`](crate::scheduler::Scheduler::tick).
#[derive(Clone, Debug, Default)]
pub struct TickReport {
    /// Ticks completed so far, including this one.
    pub tick: u64,
    /// Virtual uptime after this tick's heartbeat, in milliseconds.
    pub up_time_ms: u64,
    /// Metrics for this tick.
    pub metrics: TickMetrics,
}
