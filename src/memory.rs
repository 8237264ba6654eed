//! Memory budget and the after-plane callback.
//!
//! The coordinator never reads process memory itself.  It asks a
//! [`MemoryBudget`] once per export for the maximum (an input of the loopback
//! decision) and hands the source to an [`AfterPlaneCallback`] after every
//! plane of blocks.  The stock callback, [`CacheEvictionPolicy`], clears a
//! virtual source's plane cache when available memory runs low.  The signal is
//! best-effort: it reflects the whole system, not just this export.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use sysinfo::System;
use tracing::warn;

use crate::source::CacheControl;

/// Default share of the maximum memory below which the cache is evicted.
pub const DEFAULT_EVICTION_THRESHOLD: f64 = 0.5;

pub trait MemoryBudget: Send + Sync {
    /// Upper bound on memory the export may use, in bytes.
    fn max_memory(&self) -> u64;

    /// Memory currently available, in bytes.
    fn available_memory(&self) -> u64;
}

/// Physical memory of the machine, via `sysinfo`.
pub struct SystemMemoryBudget {
    system: Mutex<System>,
}

impl SystemMemoryBudget {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        Self { system: Mutex::new(system) }
    }
}

impl Default for SystemMemoryBudget {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBudget for SystemMemoryBudget {
    fn max_memory(&self) -> u64 {
        self.system.lock().total_memory()
    }

    fn available_memory(&self) -> u64 {
        let mut system = self.system.lock();
        system.refresh_memory();
        system.available_memory()
    }
}

/// Fixed maximum with a settable availability figure.
#[derive(Debug)]
pub struct FixedMemoryBudget {
    max:       u64,
    available: AtomicU64,
}

impl FixedMemoryBudget {
    pub fn new(max: u64) -> Self {
        Self { max, available: AtomicU64::new(max) }
    }

    pub fn set_available(&self, bytes: u64) {
        self.available.store(bytes, Ordering::Relaxed);
    }
}

impl MemoryBudget for FixedMemoryBudget {
    fn max_memory(&self) -> u64 {
        self.max
    }

    fn available_memory(&self) -> u64 {
        self.available.load(Ordering::Relaxed).min(self.max)
    }
}

// ── After-plane callback ─────────────────────────────────────────────────────

/// Invoked on the coordinating thread after each plane of blocks is written.
pub trait AfterPlaneCallback {
    fn after_plane(&mut self, used_loopback: bool, source: &dyn CacheControl);
}

impl<F: FnMut(bool, &dyn CacheControl)> AfterPlaneCallback for F {
    fn after_plane(&mut self, used_loopback: bool, source: &dyn CacheControl) {
        self(used_loopback, source)
    }
}

/// Clears a virtual source's cache when available memory drops below
/// `threshold × max_memory`.  Planes computed by loopback never touch the
/// original source, so they never trigger eviction.
pub struct CacheEvictionPolicy {
    budget:    Arc<dyn MemoryBudget>,
    threshold: f64,
    evictions: u64,
}

impl CacheEvictionPolicy {
    pub fn new(budget: Arc<dyn MemoryBudget>) -> Self {
        Self::with_threshold(budget, DEFAULT_EVICTION_THRESHOLD)
    }

    pub fn with_threshold(budget: Arc<dyn MemoryBudget>, threshold: f64) -> Self {
        Self { budget, threshold: threshold.clamp(0.0, 1.0), evictions: 0 }
    }

    /// Times the cache was cleared so far.
    pub fn evictions(&self) -> u64 {
        self.evictions
    }
}

impl AfterPlaneCallback for CacheEvictionPolicy {
    fn after_plane(&mut self, used_loopback: bool, source: &dyn CacheControl) {
        if used_loopback || !source.is_virtual() {
            return;
        }
        let max = self.budget.max_memory();
        let available = self.budget.available_memory();
        if (available as f64) < self.threshold * max as f64 {
            warn!(available, max, "available memory low, clearing source cache");
            source.clear_cache();
            self.evictions += 1;
        }
    }
}
