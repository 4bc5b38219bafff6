//! RAII guard for allocated ports
//!
//! Provides automatic return of ports to the pool when dropped.

use super::PortPool;
use std::fmt;
use std::sync::Arc;

/// RAII guard that returns its port to the pool on drop
///
/// The lease remembers the allocation generation, so a lease that outlives a
/// manual [`PortPool::release`] can never free the port from under its next
/// holder.
pub struct PortLease {
    /// The allocated port
    port: u16,
    /// Allocation generation of `port` at the time of the lease
    generation: u64,
    /// Pool to return the port to (None once released)
    pool: Option<Arc<PortPool>>,
}

impl PortLease {
    pub(super) fn new(port: u16, generation: u64, pool: Arc<PortPool>) -> Self {
        PortLease {
            port,
            generation,
            pool: Some(pool),
        }
    }

    /// The leased port number
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Return the port to the pool now
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release_lease(self.port, self.generation);
        }
    }
}

impl fmt::Debug for PortLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortLease")
            .field("port", &self.port)
            .field("generation", &self.generation)
            .finish()
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.release_inner();
    }
}
