//! Cancellation handles for live subscriptions.
//!
//! Every live subscription owned by the engine is driven by one spawned task
//! and represented by one [`Subscription`]. Tearing it down is idempotent:
//! the first `cancel` signals the task and detaches any consumer callback,
//! later calls do nothing. Dropping the handle cancels it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

type Detach = Box<dyn FnOnce() + Send>;

/// Handle to a running subscription task.
pub struct Subscription {
    name: &'static str,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
    detach: Mutex<Option<Detach>>,
    torn_down: AtomicBool,
}

impl Subscription {
    /// Wrap a spawned task that stops when `token` is cancelled.
    #[must_use]
    pub fn new(name: &'static str, token: CancellationToken, task: JoinHandle<()>) -> Self {
        Self {
            name,
            token,
            task: Some(task),
            detach: Mutex::new(None),
            torn_down: AtomicBool::new(false),
        }
    }

    /// Run `detach` synchronously during the first cancellation.
    ///
    /// Used to unhook consumer callbacks so nothing is delivered once
    /// `cancel` has returned, even if the task has not observed the token yet.
    #[must_use]
    pub fn on_cancel(self, detach: impl FnOnce() + Send + 'static) -> Self {
        *self.detach.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(detach));
        self
    }

    /// Tear the subscription down. Returns `true` only for the call that
    /// actually performed the teardown.
    pub fn cancel(&self) -> bool {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.token.cancel();
        let detach = self
            .detach
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(detach) = detach {
            detach();
        }
        debug!(subscription = self.name, "Subscription cancelled");
        true
    }

    /// Whether the subscription has been torn down.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    /// Cancel and wait for the driving task to finish.
    pub async fn shutdown(mut self) {
        self.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
            && e.is_panic()
        {
            error!(subscription = self.name, error = %e, "Subscription task panicked");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("name", &self.name)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}
