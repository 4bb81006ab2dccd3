//! # Memory Probes
//!
//! Source of the memory samples that drive stream backpressure.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use sysinfo::{Pid, System};

pub trait MemoryProbe: Send + Sync + fmt::Debug {
    /// Memory currently attributed to this process, in megabytes
    fn used_memory_mb(&self) -> u64;

    /// Ask the runtime to reclaim memory. Returns whether anything was attempted.
    fn request_gc(&self) -> bool {
        false
    }
}

/// Resident set size of the current process, sampled through `sysinfo`
pub struct SystemMemoryProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl SystemMemoryProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SystemMemoryProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemMemoryProbe")
            .field("pid", &self.pid)
            .finish()
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn used_memory_mb(&self) -> u64 {
        let Some(pid) = self.pid else {
            return 0;
        };

        let mut system = self.system.lock();
        if !system.refresh_process(pid) {
            return 0;
        }
        system
            .process(pid)
            .map(|process| process.memory() / (1024 * 1024))
            .unwrap_or(0)
    }
}

/// Probe reporting whatever value it was last given
#[derive(Debug, Default)]
pub struct ManualMemoryProbe {
    used_mb: AtomicU64,
    gc_requests: AtomicU64,
}

impl ManualMemoryProbe {
    pub fn new(used_mb: u64) -> Self {
        Self {
            used_mb: AtomicU64::new(used_mb),
            gc_requests: AtomicU64::new(0),
        }
    }

    pub fn set_used_mb(&self, used_mb: u64) {
        self.used_mb.store(used_mb, Ordering::SeqCst);
    }

    pub fn gc_requests(&self) -> u64 {
        self.gc_requests.load(Ordering::SeqCst)
    }
}

impl MemoryProbe for ManualMemoryProbe {
    fn used_memory_mb(&self) -> u64 {
        self.used_mb.load(Ordering::SeqCst)
    }

    fn request_gc(&self) -> bool {
        self.gc_requests.fetch_add(1, Ordering::SeqCst);
        true
    }
}
