//! Link supervision: reconnect, authenticate, publish, serve replay requests.
//!
//! The supervisor owns the link's event receiver.  Each pass of its loop is
//! one connect cycle:
//!
//! 1. Connect, retrying every `reconnect_interval` until the service answers.
//! 2. On `Connected`, send the handshake.
//! 3. On `HandshakeAccepted`, replay the cached status, or publish the
//!    configured identity when nothing was cached yet.
//! 4. On any `Disconnected` the agent did not ask for, wait one interval and
//!    start over.
//!
//! A rejected handshake closes the session and is retried the same way.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gsm_core::protocol::messages::{ReplayRequest, ReplayUploadStatus};
use gsm_core::ServerIdentity;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::infrastructure::network::task::{cancelled, BackgroundTask, CancelSignal};
use crate::infrastructure::network::{DisconnectReason, LinkError, LinkEvent, ServerManagerLink};

// ── Replay requests ───────────────────────────────────────────────────────────

/// Reports upload progress for one replay request back to the chat service.
#[derive(Debug, Clone)]
pub struct ReplayReporter {
    link: ServerManagerLink,
    match_id: i32,
    account_id: i32,
}

impl ReplayReporter {
    pub fn match_id(&self) -> i32 {
        self.match_id
    }

    pub fn account_id(&self) -> i32 {
        self.account_id
    }

    /// Sends one status update.  Delivery is best effort.
    pub async fn report(&self, status: ReplayUploadStatus, download_link: Option<&str>) {
        self.link
            .send_replay_status_update(self.match_id, self.account_id, status, download_link)
            .await;
    }
}

/// Serves replay requests from the chat service.
///
/// Each request runs on its own task; a slow upload does not hold up the
/// link's other events.
#[async_trait]
pub trait ReplayRequestHandler: Send + Sync {
    async fn handle_replay_request(&self, request: ReplayRequest, reporter: ReplayReporter);
}

/// Handler for hosts that keep no replays: answers every request with
/// `NotFound`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoReplayStore;

#[async_trait]
impl ReplayRequestHandler for NoReplayStore {
    async fn handle_replay_request(&self, request: ReplayRequest, reporter: ReplayReporter) {
        debug!("no replay store; match {} reported as not found", request.match_id);
        reporter.report(ReplayUploadStatus::NotFound, None).await;
    }
}

// ── Supervisor ────────────────────────────────────────────────────────────────

/// Where to connect and what to announce.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub host: String,
    pub port: u16,
    pub server_id: i32,
    pub session_id: String,
    pub identity: ServerIdentity,
    pub reconnect_interval: Duration,
}

/// How one connect cycle ended.
#[derive(Debug)]
enum SessionEnd {
    Cancelled,
    EventsClosed,
    Lost(DisconnectReason),
    Rejected,
}

struct Session {
    link: ServerManagerLink,
    config: SupervisorConfig,
    replays: Arc<dyn ReplayRequestHandler>,
}

/// Runs the link's connect cycles in the background.
#[derive(Debug)]
pub struct LinkSupervisor {
    link: ServerManagerLink,
    task: Mutex<Option<BackgroundTask>>,
}

impl LinkSupervisor {
    /// Starts supervising `link`.  `events` must be the receiver returned
    /// alongside it by [`ServerManagerLink::new`].
    pub fn start(
        link: ServerManagerLink,
        events: UnboundedReceiver<LinkEvent>,
        config: SupervisorConfig,
        replays: Arc<dyn ReplayRequestHandler>,
    ) -> Self {
        let session = Session {
            link: link.clone(),
            config,
            replays,
        };
        let task = BackgroundTask::spawn("link-supervisor", move |cancel| {
            supervise(session, events, cancel)
        });
        Self {
            link,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn link(&self) -> &ServerManagerLink {
        &self.link
    }

    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Stops reconnecting, announces the server as stopping and closes the
    /// session.  Idempotent.
    pub async fn shutdown(&self) {
        let Some(task) = self.task.lock().await.take() else {
            return;
        };
        task.stop().await;

        match self.link.send_stopping_status().await {
            Ok(true) => {}
            Ok(false) => debug!("no status was published; skipping stopping status"),
            Err(LinkError::NotConnected) => debug!("chat link down; skipping stopping status"),
            Err(e) => warn!("stopping status not delivered: {e}"),
        }
        self.link.disconnect().await;
        info!("link supervisor stopped");
    }
}

async fn supervise(
    session: Session,
    mut events: UnboundedReceiver<LinkEvent>,
    mut cancel: CancelSignal,
) {
    let interval = session.config.reconnect_interval;
    loop {
        if !session.connect_with_retry(&mut cancel).await {
            return;
        }
        match session.run(&mut events, &mut cancel).await {
            SessionEnd::Cancelled => return,
            SessionEnd::EventsClosed => {
                warn!("chat link event channel closed; supervisor exiting");
                return;
            }
            SessionEnd::Lost(reason) => {
                warn!("chat link lost ({reason:?}); reconnecting in {interval:?}");
            }
            SessionEnd::Rejected => info!("retrying handshake in {interval:?}"),
        }

        tokio::select! {
            _ = cancelled(&mut cancel) => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

impl Session {
    /// Returns `false` when cancelled before a connection was made.
    async fn connect_with_retry(&self, cancel: &mut CancelSignal) -> bool {
        let SupervisorConfig { host, port, .. } = &self.config;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            // Not raced against `cancel`: an abandoned connect would leave
            // the link half-open.  `connect_timeout` bounds it instead.
            match self.link.connect(host, *port).await {
                Ok(()) | Err(LinkError::AlreadyConnected) => return true,
                Err(e) => warn!("chat connect attempt {attempt} failed: {e}"),
            }
            tokio::select! {
                _ = cancelled(cancel) => return false,
                _ = tokio::time::sleep(self.config.reconnect_interval) => {}
            }
        }
    }

    async fn run(
        &self,
        events: &mut UnboundedReceiver<LinkEvent>,
        cancel: &mut CancelSignal,
    ) -> SessionEnd {
        // Dropping the set aborts replay work still running for this cycle.
        let mut replays: JoinSet<()> = JoinSet::new();

        loop {
            let event = tokio::select! {
                _ = cancelled(cancel) => return SessionEnd::Cancelled,
                Some(done) = replays.join_next(), if !replays.is_empty() => {
                    if let Err(e) = done {
                        if e.is_panic() {
                            warn!("replay handler panicked: {e}");
                        }
                    }
                    continue;
                }
                event = events.recv() => event,
            };
            let Some(event) = event else {
                return SessionEnd::EventsClosed;
            };

            match event {
                LinkEvent::Connected { peer } => {
                    debug!("chat link up ({peer:?}); sending handshake");
                    let SupervisorConfig {
                        server_id,
                        session_id,
                        ..
                    } = &self.config;
                    if let Err(e) = self.link.send_handshake(*server_id, session_id).await {
                        warn!("handshake for server {server_id} not sent: {e}");
                    }
                }
                LinkEvent::HandshakeAccepted => self.publish_status().await,
                LinkEvent::HandshakeRejected { reason } => {
                    warn!("server {} rejected: {reason}", self.config.server_id);
                    self.link.disconnect().await;
                    return SessionEnd::Rejected;
                }
                LinkEvent::ReplayRequested(request) => {
                    let reporter = ReplayReporter {
                        link: self.link.clone(),
                        match_id: request.match_id,
                        account_id: request.account_id,
                    };
                    let handler = Arc::clone(&self.replays);
                    replays.spawn(async move {
                        handler.handle_replay_request(request, reporter).await;
                    });
                }
                LinkEvent::ShutdownNotice => info!("chat service is shutting down"),
                LinkEvent::HeartbeatReceived => {}
                LinkEvent::Disconnected { reason } if reason.is_requested() => {
                    debug!("ignoring disconnect requested by the agent");
                }
                LinkEvent::Disconnected { reason } => return SessionEnd::Lost(reason),
            }
        }
    }

    async fn publish_status(&self) {
        let server_id = self.config.server_id;
        let result = match self.link.resend_cached_status().await {
            Ok(true) => Ok(()),
            Ok(false) => {
                self.link
                    .send_server_info(server_id, &self.config.identity)
                    .await
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => info!("status published for server {server_id}"),
            Err(e) => warn!("status for server {server_id} not published: {e}"),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
