//! Reacts to liveness prober events.
//!
//! The prober already logs each transition.  Restart recommendations
//! are forwarded to a [`RestartHandler`] and the port is remembered as
//! pending restart until it answers again.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::infrastructure::network::task::{cancelled, BackgroundTask, CancelSignal};
use crate::infrastructure::network::ProberEvent;

/// Restarts the game server behind a monitored UDP port.
///
/// The process supervisor implements this; the agent only decides when.
#[async_trait]
pub trait RestartHandler: Send + Sync {
    async fn restart_server(&self, port: u16, reason: &str) -> Result<(), String>;
}

/// Handler that records the recommendation in the log and does nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingRestartHandler;

#[async_trait]
impl RestartHandler for LoggingRestartHandler {
    async fn restart_server(&self, port: u16, reason: &str) -> Result<(), String> {
        warn!("restart recommended for game server on UDP port {port}: {reason}");
        Ok(())
    }
}

struct MonitorState {
    pending: StdMutex<BTreeSet<u16>>,
    handler: Arc<dyn RestartHandler>,
}

impl MonitorState {
    fn pending(&self) -> std::sync::MutexGuard<'_, BTreeSet<u16>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn handle(&self, event: ProberEvent) {
        match event {
            ProberEvent::Unhealthy {
                port,
                consecutive_failures,
                last_error,
            } => {
                debug!("port {port} unhealthy ({consecutive_failures} failures, {last_error}); waiting for restart threshold");
            }
            ProberEvent::Recovered {
                port,
                response_time_ms,
            } => {
                if self.pending().remove(&port) {
                    info!("port {port} answered in {response_time_ms} ms; restart no longer pending");
                }
            }
            ProberEvent::RestartRecommended { port, reason } => {
                self.pending().insert(port);
                if let Err(e) = self.handler.restart_server(port, &reason).await {
                    error!("restart of game server on port {port} failed: {e}");
                }
            }
        }
    }
}

/// Consumes prober events in the background.
pub struct HealthMonitor {
    state: Arc<MonitorState>,
    task: Mutex<Option<BackgroundTask>>,
}

impl HealthMonitor {
    /// Starts consuming `events`.  The loop ends when stopped or when the
    /// prober drops its sender.
    pub fn start(events: UnboundedReceiver<ProberEvent>, handler: Arc<dyn RestartHandler>) -> Self {
        let state = Arc::new(MonitorState {
            pending: StdMutex::new(BTreeSet::new()),
            handler,
        });
        let loop_state = Arc::clone(&state);
        let task = BackgroundTask::spawn("health-monitor", move |cancel| {
            monitor_loop(loop_state, events, cancel)
        });
        Self {
            state,
            task: Mutex::new(Some(task)),
        }
    }

    /// Ports with an outstanding restart recommendation, ascending.
    pub fn pending_restarts(&self) -> Vec<u16> {
        self.state.pending().iter().copied().collect()
    }

    pub fn is_pending_restart(&self, port: u16) -> bool {
        self.state.pending().contains(&port)
    }

    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Idempotent.
    pub async fn stop(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.stop().await;
        }
    }
}

async fn monitor_loop(
    state: Arc<MonitorState>,
    mut events: UnboundedReceiver<ProberEvent>,
    mut cancel: CancelSignal,
) {
    loop {
        let event = tokio::select! {
            _ = cancelled(&mut cancel) => return,
            event = events.recv() => event,
        };
        match event {
            Some(event) => state.handle(event).await,
            None => return,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
