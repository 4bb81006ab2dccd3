//! Timeout manager statistics.

use super::operation::OperationOutcome;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Cumulative lifecycle counters shared by the manager and its operations
#[derive(Debug, Default)]
pub(crate) struct TimeoutCounters {
    created: AtomicU64,
    completed: AtomicU64,
    timed_out: AtomicU64,
    aborted: AtomicU64,
}

impl TimeoutCounters {
    pub(crate) fn record_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record(&self, outcome: OperationOutcome) {
        let counter = match outcome {
            OperationOutcome::Completed => &self.completed,
            OperationOutcome::TimedOut => &self.timed_out,
            OperationOutcome::Aborted => &self.aborted,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.created.load(Ordering::Relaxed),
            self.completed.load(Ordering::Relaxed),
            self.timed_out.load(Ordering::Relaxed),
            self.aborted.load(Ordering::Relaxed),
        )
    }
}

/// Number of live bookkeeping objects, for leak detection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryFootprint {
    pub tracked_operations: usize,
    pub pending_timers: usize,
    pub context_entries: usize,
    pub context_links: usize,
}

impl MemoryFootprint {
    pub fn is_empty(&self) -> bool {
        *self == MemoryFootprint::default()
    }
}

/// Point-in-time view of the timeout manager
#[derive(Debug, Clone, Serialize)]
pub struct TimeoutStats {
    pub active_operations: usize,
    pub total_created: u64,
    pub completed: u64,
    pub timed_out: u64,
    pub aborted: u64,
    pub active_contexts: usize,
    pub memory: MemoryFootprint,
}

impl TimeoutStats {
    /// Operations that have settled one way or another
    pub fn total_settled(&self) -> u64 {
        self.completed + self.timed_out + self.aborted
    }

    pub fn timeout_rate(&self) -> f64 {
        let settled = self.total_settled();
        if settled == 0 {
            0.0
        } else {
            self.timed_out as f64 / settled as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_track_each_outcome() {
        let counters = TimeoutCounters::default();
        counters.record_created();
        counters.record_created();
        counters.record(OperationOutcome::TimedOut);
        counters.record(OperationOutcome::Completed);

        assert_eq!(counters.snapshot(), (2, 1, 1, 0));
    }

    #[test]
    fn test_timeout_rate() {
        let stats = TimeoutStats {
            active_operations: 0,
            total_created: 4,
            completed: 3,
            timed_out: 1,
            aborted: 0,
            active_contexts: 0,
            memory: MemoryFootprint::default(),
        };
        assert_eq!(stats.total_settled(), 4);
        assert_eq!(stats.timeout_rate(), 0.25);
        assert!(stats.memory.is_empty());
    }
}
