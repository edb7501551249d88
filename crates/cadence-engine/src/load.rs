//! Tick timing and overload detection shared by the scheduler and tasks.
//!
//! The realtime loop marks the start of every tick and sets the heavy-load
//! flag when the tick started more than one period late. Anyone may then
//! ask [`LoadMonitor::is_overloaded`]; once it answers `true` the answer
//! stays `true` until the next tick boundary resets the flag.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

/// Remaining tick time (ms) below which the current tick counts as
/// overloaded.
const OVERRUN_TOLERANCE_MS: i64 = -10;

/// Returns monotonic nanoseconds since an arbitrary process-local epoch.
///
/// Uses `OnceLock<Instant>` to lazily initialise a baseline. Only for
/// relative duration comparisons.
pub(crate) fn monotonic_nanos() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    Instant::now().duration_since(*epoch).as_nanos() as u64
}

/// Tick start time and the sticky heavy-load flag.
#[derive(Debug)]
pub struct LoadMonitor {
    period_ms: u64,
    tick_start_ns: AtomicU64,
    heavy_load: AtomicBool,
}

impl LoadMonitor {
    /// A monitor for ticks of `period_ms`.
    pub fn new(period_ms: u64) -> Self {
        Self {
            period_ms,
            tick_start_ns: AtomicU64::new(monotonic_nanos()),
            heavy_load: AtomicBool::new(false),
        }
    }

    /// Record the start of a tick and reset the heavy-load flag to
    /// `heavy_load`.
    pub fn begin_tick(&self, heavy_load: bool) {
        self.tick_start_ns.store(monotonic_nanos(), Ordering::Release);
        self.heavy_load.store(heavy_load, Ordering::Release);
    }

    /// Clear the heavy-load flag without starting a tick.
    pub fn clear(&self) {
        self.heavy_load.store(false, Ordering::Release);
    }

    /// Milliseconds since the current tick started.
    pub fn tick_time_ms(&self) -> u64 {
        let start = self.tick_start_ns.load(Ordering::Acquire);
        monotonic_nanos().saturating_sub(start) / 1_000_000
    }

    /// Milliseconds left in the current tick's period; negative on overrun.
    pub fn remaining_tick_time_ms(&self) -> i64 {
        self.period_ms as i64 - self.tick_time_ms() as i64
    }

    /// Whether the scheduler is overloaded.
    ///
    /// True if the tick started late, or if the current tick has overrun
    /// its period by more than 10 ms. Sticky until the next tick.
    pub fn is_overloaded(&self) -> bool {
        if self.heavy_load.load(Ordering::Acquire) {
            return true;
        }
        if self.remaining_tick_time_ms() >= OVERRUN_TOLERANCE_MS {
            return false;
        }
        self.heavy_load.store(true, Ordering::Release);
        true
    }
}
