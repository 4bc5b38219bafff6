//! Owned registry of spawned tasks
//!
//! Listeners track their sessions and the daemon tracks its backends with a
//! [`TaskSet`]. A task removes itself when it finishes; [`TaskSet::reap`]
//! prunes any entry whose task ended without doing so (a panic), and
//! [`TaskSet::close_all`] waits for everything still registered.

use futures::future::join_all;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::warn;

/// Set of running tasks keyed by id
#[derive(Debug, Default)]
pub struct TaskSet {
    next_id: AtomicU64,
    tasks: Mutex<HashMap<u64, JoinHandle<()>>>,
}

impl TaskSet {
    /// Create an empty set
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Spawn `fut` and register it until it completes
    pub fn spawn<F>(self: &Arc<Self>, fut: F) -> u64
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let set = Arc::clone(self);

        // Registered under the lock so the task's own removal cannot run first.
        let mut tasks = self.lock();
        let handle = tokio::spawn(async move {
            fut.await;
            set.remove(id);
        });
        tasks.insert(id, handle);
        id
    }

    /// Forget a task; idempotent
    pub fn remove(&self, id: u64) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Drop entries whose task has already finished
    ///
    /// Returns how many were pruned.
    pub fn reap(&self) -> usize {
        let mut tasks = self.lock();
        let before = tasks.len();
        tasks.retain(|_, handle| !handle.is_finished());
        before - tasks.len()
    }

    /// Number of registered tasks
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if no task is registered
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Wait for every registered task to finish
    ///
    /// Callers signal their tasks to stop first; this only joins them.
    pub async fn close_all(&self) {
        let handles: Vec<_> = self.lock().drain().map(|(_, handle)| handle).collect();
        for result in join_all(handles).await {
            if let Err(e) = result {
                warn!("Task ended abnormally: {}", e);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
