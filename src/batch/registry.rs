//! # Batch Registry
//!
//! Owns one [`BatchManager`] per call site or explicit key, so that repeated
//! calls from the same place share a queue, and shuts them all down together.

use super::config::BatchConfig;
use super::manager::BatchManager;
use super::processor::BatchProcessor;
use crate::error::ResilienceResult;
use crate::timeout::TimeoutManager;
use dashmap::DashMap;
use std::fmt;
use std::panic::Location;
use tracing::info;

pub struct BatchRegistry<P: BatchProcessor> {
    managers: DashMap<String, BatchManager<P>>,
    config: BatchConfig,
    timeouts: TimeoutManager,
}

impl<P: BatchProcessor> BatchRegistry<P> {
    pub fn new(config: BatchConfig, timeouts: TimeoutManager) -> Self {
        Self {
            managers: DashMap::new(),
            config,
            timeouts,
        }
    }

    /// Manager for the caller's source location, created on first use
    #[track_caller]
    pub fn for_call_site<F>(&self, make_processor: F) -> ResilienceResult<BatchManager<P>>
    where
        F: FnOnce() -> P,
    {
        let location = Location::caller();
        let key = format!(
            "{}:{}:{}",
            location.file(),
            location.line(),
            location.column()
        );
        self.get_or_create(key, make_processor)
    }

    /// Manager registered under `key`, created with `make_processor` on first use
    pub fn get_or_create<F>(
        &self,
        key: impl Into<String>,
        make_processor: F,
    ) -> ResilienceResult<BatchManager<P>>
    where
        F: FnOnce() -> P,
    {
        let key = key.into();
        if let Some(existing) = self.managers.get(&key) {
            return Ok(existing.value().clone());
        }

        let manager = BatchManager::with_timeout_manager(
            key.clone(),
            self.config.clone(),
            make_processor(),
            self.timeouts.clone(),
        )?;

        // Another caller may have registered the key meanwhile; keep theirs
        let entry = self.managers.entry(key).or_insert(manager);
        Ok(entry.value().clone())
    }

    pub fn get(&self, key: &str) -> Option<BatchManager<P>> {
        self.managers.get(key).map(|entry| entry.value().clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.managers
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.managers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }

    /// Shut down and forget every manager. Returns the total of rejected items.
    pub async fn shutdown_all(&self) -> usize {
        let managers: Vec<BatchManager<P>> = self
            .managers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.managers.clear();

        let mut rejected = 0;
        for manager in &managers {
            rejected += manager.shutdown().await;
        }

        info!(
            managers = managers.len(),
            rejected = rejected,
            "Batch registry shut down"
        );
        rejected
    }
}

impl<P: BatchProcessor> fmt::Debug for BatchRegistry<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchRegistry")
            .field("managers", &self.keys())
            .field("config", &self.config)
            .finish()
    }
}
