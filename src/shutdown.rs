//! One-shot cancellation handles
//!
//! A [`Shutdown`] is shared by every task that must stop together. Handles
//! form a tree through [`Shutdown::child`]: triggering a parent triggers all
//! of its children, so tearing down a control channel reaches every listener,
//! tunnel accept and pump below it without waiting for the next IO event.

use std::sync::Arc;
use tokio::sync::watch;

/// Cloneable cancellation handle
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    /// Create a new, untriggered handle
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Shutdown { tx: Arc::new(tx) }
    }

    /// Trigger the shutdown
    ///
    /// Returns `true` only for the call that actually flipped the flag.
    pub fn trigger(&self) -> bool {
        self.tx.send_if_modified(|triggered| {
            if *triggered {
                false
            } else {
                *triggered = true;
                true
            }
        })
    }

    /// Check if the shutdown has been triggered
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the shutdown is triggered
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|triggered| *triggered).await;
    }

    /// Create a handle that is triggered together with this one
    ///
    /// Triggering the child leaves the parent untouched. The link to the
    /// parent is dropped once the child is triggered or every handle to it
    /// is gone, so short-lived children do not accumulate.
    pub fn child(&self) -> Shutdown {
        let child = Shutdown::new();
        if self.is_triggered() {
            child.trigger();
            return child;
        }

        let parent = self.clone();
        let linked = Arc::downgrade(&child.tx);
        let mut rx = child.tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = parent.wait() => {
                    if let Some(tx) = linked.upgrade() {
                        Shutdown { tx }.trigger();
                    }
                }
                // Errs once the last child handle drops its sender.
                _ = async { let _ = rx.wait_for(|triggered| *triggered).await; } => {}
            }
        });
        child
    }
}
