//! Batch manager statistics.

use crate::error::ResilienceError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub(crate) struct BatchCounters {
    submitted: AtomicU64,
    dispatched_groups: AtomicU64,
    dispatched_items: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl BatchCounters {
    pub(crate) fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dispatch(&self, group_size: usize) {
        self.dispatched_groups.fetch_add(1, Ordering::Relaxed);
        self.dispatched_items
            .fetch_add(group_size as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_success(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failures(&self, count: usize) {
        self.failed.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, queued: usize, in_flight_groups: usize) -> BatchStats {
        let dispatched_groups = self.dispatched_groups.load(Ordering::Relaxed);
        let dispatched_items = self.dispatched_items.load(Ordering::Relaxed);

        BatchStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            dispatched_groups,
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            queued,
            in_flight_groups,
            average_group_size: if dispatched_groups == 0 {
                0.0
            } else {
                dispatched_items as f64 / dispatched_groups as f64
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchStats {
    pub submitted: u64,
    pub dispatched_groups: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub queued: usize,
    pub in_flight_groups: usize,
    pub average_group_size: f64,
}

/// One item failure recorded under the `collect-errors` strategy
#[derive(Debug, Clone)]
pub struct BatchItemError {
    pub item_id: String,
    pub priority: Option<i32>,
    pub error: ResilienceError,
    pub failed_at: DateTime<Utc>,
}
