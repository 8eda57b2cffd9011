//! A background loop together with the signal that stops it.
//!
//! Every loop in the agent follows cancel-then-await: [`BackgroundTask::stop`]
//! flips the watch channel and then joins the task, so the caller knows the
//! loop has exited before it releases any socket the loop was using.

use std::future::Future;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

/// Receiving side of a stop signal, handed to the spawned loop.
pub type CancelSignal = watch::Receiver<bool>;

/// Resolves once `cancel` has been raised or its sender dropped.
pub async fn cancelled(cancel: &mut CancelSignal) {
    while !*cancel.borrow_and_update() {
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

/// A spawned loop and its stop signal.
#[derive(Debug)]
pub struct BackgroundTask {
    name: &'static str,
    cancel_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    /// Spawns `make(cancel)` on the current runtime.
    pub fn spawn<F, Fut>(name: &'static str, make: F) -> Self
    where
        F: FnOnce(CancelSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let handle = tokio::spawn(make(cancel_rx));
        Self {
            name,
            cancel_tx,
            handle,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Raises the stop signal and waits for the loop to exit.
    pub async fn stop(self) {
        let _ = self.cancel_tx.send(true);
        if let Err(e) = self.handle.await {
            if e.is_panic() {
                warn!("{} task panicked: {e}", self.name);
            }
        }
    }
}
