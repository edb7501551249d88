//! Task priorities and their maximum deferral under load.

use std::fmt;

/// How urgently a scheduled task must run.
///
/// When the scheduler is overloaded, a task may be pushed back by one tick
/// period per pulse until it has been deferred for longer than
/// [`max_deferred_ms`](TaskPriority::max_deferred_ms). `Critical` tasks are
/// never deferred.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskPriority {
    /// Never deferred.
    Critical,
    /// Deferred at most 0.5 s.
    Highest,
    /// Deferred at most 2 s.
    High,
    /// Deferred at most 5 s.
    AboveNormal,
    /// Deferred at most 10 s.
    #[default]
    Normal,
    /// Deferred at most 30 s.
    BelowNormal,
    /// Deferred at most 60 s.
    Low,
    /// Deferred at most 120 s.
    Lowest,
}

impl TaskPriority {
    /// Maximum time in milliseconds a task of this priority may be deferred.
    pub const fn max_deferred_ms(self) -> u64 {
        match self {
            Self::Critical => 0,
            Self::Highest => 500,
            Self::High => 2_000,
            Self::AboveNormal => 5_000,
            Self::Normal => 10_000,
            Self::BelowNormal => 30_000,
            Self::Low => 60_000,
            Self::Lowest => 120_000,
        }
    }

    /// Whether tasks of this priority may ever be deferred.
    pub const fn can_defer(self) -> bool {
        self.max_deferred_ms() > 0
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Critical => "critical",
            Self::Highest => "highest",
            Self::High => "high",
            Self::AboveNormal => "above-normal",
            Self::Normal => "normal",
            Self::BelowNormal => "below-normal",
            Self::Low => "low",
            Self::Lowest => "lowest",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deferral_grows_as_priority_drops() {
        let all = [
            TaskPriority::Critical,
            TaskPriority::Highest,
            TaskPriority::High,
            TaskPriority::AboveNormal,
            TaskPriority::Normal,
            TaskPriority::BelowNormal,
            TaskPriority::Low,
            TaskPriority::Lowest,
        ];
        for pair in all.windows(2) {
            assert!(pair[0].max_deferred_ms() < pair[1].max_deferred_ms());
        }
    }

    #[test]
    fn only_critical_is_never_deferred() {
        assert!(!TaskPriority::Critical.can_defer());
        assert!(TaskPriority::Highest.can_defer());
        assert_eq!(TaskPriority::default(), TaskPriority::Normal);
    }
}
