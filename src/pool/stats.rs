//! Port pool statistics
//!
//! Lock-free counters updated by the pool and logged for health reporting.

use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Statistics for the port pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Total ports handed out
    pub total_allocated: AtomicUsize,
    /// Total ports returned
    pub total_released: AtomicUsize,
    /// Allocation attempts that found the pool empty
    pub total_exhausted: AtomicUsize,
    /// Ports currently allocated
    pub in_use_count: AtomicUsize,
}

impl PoolStats {
    /// Create new pool stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a port allocation
    pub fn record_allocated(&self) {
        self.total_allocated.fetch_add(1, Ordering::Relaxed);
        self.in_use_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a port release
    pub fn record_released(&self) {
        self.total_released.fetch_add(1, Ordering::Relaxed);
        self.in_use_count.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record an allocation that failed for lack of ports
    pub fn record_exhausted(&self) {
        self.total_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current stats snapshot
    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            total_allocated: self.total_allocated.load(Ordering::Relaxed),
            total_released: self.total_released.load(Ordering::Relaxed),
            total_exhausted: self.total_exhausted.load(Ordering::Relaxed),
            in_use_count: self.in_use_count.load(Ordering::Relaxed),
        }
    }

    /// Log pool health status
    pub fn log_health(&self) {
        let stats = self.snapshot();
        debug!(
            "Port pool health: in_use={}, allocated={}, released={}, exhausted={}",
            stats.in_use_count, stats.total_allocated, stats.total_released, stats.total_exhausted
        );
    }
}

/// Snapshot of pool statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStatsSnapshot {
    /// Ports handed out since the pool was created
    pub total_allocated: usize,
    /// Ports returned to the pool
    pub total_released: usize,
    /// Allocations refused because no port was free
    pub total_exhausted: usize,
    /// Ports currently leased
    pub in_use_count: usize,
}
