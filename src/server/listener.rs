//! Public listener seam
//!
//! [`PublicListener`] is what a control channel holds for every service it
//! exposed; [`ListenerCore`] carries the state machine and the teardown
//! shared by the TCP and UDP variants.

use crate::protocol::Protocol;
use crate::shutdown::Shutdown;
use async_trait::async_trait;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::warn;

/// Listener lifecycle: `Starting -> Listening -> Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Socket bound, not yet serving
    Starting,
    /// Serving public traffic
    Listening,
    /// Torn down; ports released
    Closed,
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerState::Starting => write!(f, "starting"),
            ListenerState::Listening => write!(f, "listening"),
            ListenerState::Closed => write!(f, "closed"),
        }
    }
}

/// One exposed public service
#[async_trait]
pub trait PublicListener: Send + Sync + fmt::Debug {
    /// Transport protocol of the public socket
    fn protocol(&self) -> Protocol;

    /// Public port
    fn port(&self) -> u16;

    /// Current lifecycle state
    fn state(&self) -> ListenerState;

    /// Check whether the listener has been torn down
    fn is_closed(&self) -> bool {
        self.state() == ListenerState::Closed
    }

    /// Stop serving and release every port the listener holds
    ///
    /// Idempotent; resolves once sockets are closed and ports are back in
    /// the pool.
    async fn close(&self);
}

/// State and serving task shared by both listener variants
#[derive(Debug)]
pub(crate) struct ListenerCore {
    protocol: Protocol,
    port: u16,
    state: Mutex<ListenerState>,
    shutdown: Shutdown,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ListenerCore {
    pub fn new(protocol: Protocol, port: u16, shutdown: Shutdown) -> Self {
        ListenerCore {
            protocol,
            port,
            state: Mutex::new(ListenerState::Starting),
            shutdown,
            task: Mutex::new(None),
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// A triggered shutdown reads as `Closed` even before the task has exited
    pub fn state(&self) -> ListenerState {
        if self.shutdown.is_triggered() {
            return ListenerState::Closed;
        }
        *lock(&self.state)
    }

    /// Move to `Listening` unless already closed
    pub fn set_listening(&self) {
        let mut state = lock(&self.state);
        if *state == ListenerState::Starting && !self.shutdown.is_triggered() {
            *state = ListenerState::Listening;
        }
    }

    pub fn set_task(&self, handle: JoinHandle<()>) {
        *lock(&self.task) = Some(handle);
    }

    /// Trigger the shutdown and wait for the serving task to finish its teardown
    pub async fn close(&self) {
        self.shutdown.trigger();
        let handle = lock(&self.task).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("{} listener on port {} ended abnormally: {}", self.protocol, self.port, e);
            }
        }
        *lock(&self.state) = ListenerState::Closed;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
