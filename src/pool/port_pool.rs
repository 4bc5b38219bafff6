//! Port pool implementation
//!
//! Tracks which relay-side ports are free. This is the only state shared by
//! every control channel and listener in the process, so all mutation goes
//! through [`PortPool::allocate`] and [`PortPool::release`] under one lock.

use super::guard::PortLease;
use super::stats::PoolStats;
use crate::config::PortRangeConfig;
use crate::error::RelayError;
use crate::helper::{DEFAULT_PORT_RANGE_END, DEFAULT_PORT_RANGE_START};
use rand::Rng;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace, warn};

/// Per-port bookkeeping
#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    /// Index into `available` while the port is free
    position: Option<usize>,
    /// Bumped on every allocation
    generation: u64,
}

/// Dense free-set over the port range
///
/// `available` holds the free ports in arbitrary order so a uniform pick is a
/// random index; `slots` maps each port back to its index for O(1) removal.
#[derive(Debug)]
struct PoolState {
    available: Vec<u16>,
    slots: Vec<Slot>,
}

/// Process-wide pool of relay ports
#[derive(Debug)]
pub struct PortPool {
    /// First port (inclusive)
    start: u16,
    /// Last port (inclusive)
    end: u16,
    /// Free set
    state: Mutex<PoolState>,
    /// Statistics
    stats: PoolStats,
}

impl PortPool {
    /// Create a pool over the given inclusive range, every port available
    pub fn new(range: RangeInclusive<u16>) -> Arc<Self> {
        let (start, end) = (*range.start(), *range.end());
        let available: Vec<u16> = range.collect();
        let slots = available
            .iter()
            .enumerate()
            .map(|(position, _)| Slot {
                position: Some(position),
                generation: 0,
            })
            .collect();

        Arc::new(PortPool {
            start,
            end,
            state: Mutex::new(PoolState { available, slots }),
            stats: PoolStats::new(),
        })
    }

    /// Create a pool over 10000-60000
    pub fn with_default_range() -> Arc<Self> {
        Self::new(DEFAULT_PORT_RANGE_START..=DEFAULT_PORT_RANGE_END)
    }

    /// Create a pool from configuration
    pub fn from_config(config: &PortRangeConfig) -> Arc<Self> {
        Self::new(config.range())
    }

    /// Allocate a uniformly random free port
    pub fn allocate(self: &Arc<Self>) -> Result<PortLease, RelayError> {
        let mut state = self.lock();
        if state.available.is_empty() {
            drop(state);
            self.stats.record_exhausted();
            warn!("Port pool exhausted ({}-{})", self.start, self.end);
            return Err(RelayError::PortExhausted {
                start: self.start,
                end: self.end,
            });
        }

        let index = rand::thread_rng().gen_range(0..state.available.len());
        let (port, generation) = self.take_at(&mut state, index);
        drop(state);

        self.stats.record_allocated();
        trace!("Allocated port {}", port);
        Ok(PortLease::new(port, generation, Arc::clone(self)))
    }

    /// Allocate `port` if it is in range and free, otherwise any free port
    pub fn allocate_preferred(self: &Arc<Self>, port: u16) -> Result<PortLease, RelayError> {
        if let Some(offset) = self.offset(port) {
            let mut state = self.lock();
            let position = state.slots[offset].position;
            if let Some(index) = position {
                let (port, generation) = self.take_at(&mut state, index);
                drop(state);

                self.stats.record_allocated();
                trace!("Allocated requested port {}", port);
                return Ok(PortLease::new(port, generation, Arc::clone(self)));
            }
        }

        debug!("Requested port {} unavailable, picking another", port);
        self.allocate()
    }

    /// Return a port to the pool
    ///
    /// Idempotent: releasing a free or out-of-range port is a no-op.
    /// Returns whether the port changed state.
    pub fn release(&self, port: u16) -> bool {
        let Some(offset) = self.offset(port) else {
            return false;
        };
        let mut state = self.lock();
        let released = Self::put_back(&mut state, offset, port);
        drop(state);

        if released {
            self.stats.record_released();
            trace!("Released port {}", port);
        }
        released
    }

    /// Release on behalf of a lease, only if nobody re-allocated the port since
    pub(super) fn release_lease(&self, port: u16, generation: u64) {
        let Some(offset) = self.offset(port) else {
            return;
        };
        let mut state = self.lock();
        if state.slots[offset].generation != generation {
            return;
        }
        let released = Self::put_back(&mut state, offset, port);
        drop(state);

        if released {
            self.stats.record_released();
            trace!("Released port {}", port);
        }
    }

    /// Check whether a port is currently free
    pub fn is_available(&self, port: u16) -> bool {
        match self.offset(port) {
            Some(offset) => self.lock().slots[offset].position.is_some(),
            None => false,
        }
    }

    /// Number of free ports
    pub fn available_count(&self) -> usize {
        self.lock().available.len()
    }

    /// Total number of ports managed by the pool
    ///
    /// An inverted range manages no ports.
    pub fn capacity(&self) -> usize {
        (self.end as usize + 1).saturating_sub(self.start as usize)
    }

    /// The managed range
    pub fn range(&self) -> RangeInclusive<u16> {
        self.start..=self.end
    }

    /// Pool statistics
    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    fn offset(&self, port: u16) -> Option<usize> {
        if (self.start..=self.end).contains(&port) {
            Some((port - self.start) as usize)
        } else {
            None
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // The state is consistent after every statement, so a poisoned lock is still usable.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_at(&self, state: &mut PoolState, index: usize) -> (u16, u64) {
        let port = state.available.swap_remove(index);
        if let Some(&moved) = state.available.get(index) {
            state.slots[(moved - self.start) as usize].position = Some(index);
        }
        let slot = &mut state.slots[(port - self.start) as usize];
        slot.position = None;
        slot.generation += 1;
        (port, slot.generation)
    }

    fn put_back(state: &mut PoolState, offset: usize, port: u16) -> bool {
        if state.slots[offset].position.is_some() {
            return false;
        }
        state.available.push(port);
        state.slots[offset].position = Some(state.available.len() - 1);
        true
    }
}
