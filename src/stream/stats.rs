//! Stream processor statistics.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub(crate) struct StreamCounters {
    processed: AtomicU64,
    skipped: AtomicU64,
    errored: AtomicU64,
    timeouts: AtomicU64,
    backpressure_activations: AtomicU64,
    memory_high_water_mb: AtomicU64,
    backpressure_active: AtomicBool,
}

impl StreamCounters {
    pub(crate) fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self, skipped: bool) {
        self.errored.fetch_add(1, Ordering::Relaxed);
        if skipped {
            self.skipped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_memory(&self, used_mb: u64) {
        self.memory_high_water_mb
            .fetch_max(used_mb, Ordering::Relaxed);
    }

    /// Flip the backpressure flag, returning whether it changed
    pub(crate) fn set_backpressure(&self, active: bool) -> bool {
        let changed = self.backpressure_active.swap(active, Ordering::SeqCst) != active;
        if changed && active {
            self.backpressure_activations
                .fetch_add(1, Ordering::Relaxed);
        }
        changed
    }

    pub(crate) fn backpressure_active(&self) -> bool {
        self.backpressure_active.load(Ordering::SeqCst)
    }

    pub(crate) fn snapshot(&self) -> StreamStats {
        StreamStats {
            processed: self.processed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            errored: self.errored.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            backpressure_activations: self.backpressure_activations.load(Ordering::Relaxed),
            backpressure_active: self.backpressure_active(),
            memory_high_water_mb: self.memory_high_water_mb.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a processor's counters.
///
/// `errored` counts every failed item, including the ones the error hook
/// chose to skip (`skipped`). `timeouts` counts per-item and stream-wide
/// deadline expiries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    pub processed: u64,
    pub skipped: u64,
    pub errored: u64,
    pub timeouts: u64,
    pub backpressure_activations: u64,
    pub backpressure_active: bool,
    pub memory_high_water_mb: u64,
}
