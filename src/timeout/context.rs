//! Context ownership handles.
//!
//! The manager records `context -> operations` and nothing else; it never
//! holds the [`TimeoutContext`] itself. Release the handle explicitly with
//! [`TimeoutContext::release`]. Dropping it releases as well, as a backstop.

use super::manager::ManagerInner;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ContextId(Uuid);

impl ContextId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Owning handle for a group of timeout operations
pub struct TimeoutContext {
    id: ContextId,
    name: String,
    manager: Weak<ManagerInner>,
    released: AtomicBool,
}

impl TimeoutContext {
    pub(crate) fn new(name: String, manager: Weak<ManagerInner>) -> Self {
        Self {
            id: ContextId::new(),
            name,
            manager,
            released: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Abort every operation started in this context; the context stays usable
    pub fn cleanup(&self) -> usize {
        self.manager
            .upgrade()
            .map(|manager| manager.cleanup_context(self.id))
            .unwrap_or(0)
    }

    /// Abort every operation and drop the context relation
    pub fn release(self) -> usize {
        self.release_inner()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    fn release_inner(&self) -> usize {
        if self.released.swap(true, Ordering::AcqRel) {
            return 0;
        }
        self.manager
            .upgrade()
            .map(|manager| manager.release_context(self.id))
            .unwrap_or(0)
    }
}

impl fmt::Debug for TimeoutContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutContext")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("released", &self.is_released())
            .finish()
    }
}

impl Drop for TimeoutContext {
    fn drop(&mut self) {
        if !self.is_released() {
            let cancelled = self.release_inner();
            debug!(
                context = %self.name,
                cancelled = cancelled,
                "Timeout context released on drop"
            );
        }
    }
}
