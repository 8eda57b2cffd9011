//! Persistent TCP session between the agent and the chat service.
//!
//! # Lifecycle
//!
//! ```text
//! connect ──▶ Connected ──send_handshake──▶ (0x1700 arrives) ──▶ accepted
//!                                                 │
//!                                   send_server_info ──▶ keepalive armed
//! ```
//!
//! One [`ServerManagerLink`] owns two background loops:
//!
//! - the **receive loop** drains frames with a [`FrameReader`] and turns
//!   them into [`LinkEvent`]s.  It is the only authority on connection death.
//! - the **keepalive loop** sends a ping every `keepalive_interval` once the
//!   first status has been published.  It stops after
//!   `keepalive_failure_limit` consecutive send failures and never tears
//!   the session down itself.
//!
//! Teardown always runs cancel, then await, then release.  Keepalive stops
//! first, then the receive loop, then a best-effort termination frame is
//! written and the socket is released.  `Disconnected` is emitted exactly
//! once per connect cycle, whichever side ended it.

use std::future::Future;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gsm_core::protocol::messages::{
    HandshakeRequest, ReplayRequest, ReplayStatusUpdate, ReplayUploadStatus, RunningFlag,
    PROTOCOL_VERSION,
};
use gsm_core::{
    decode_message, encode_message, Frame, KeepaliveTransition, LinkSession, LinkStateError,
    ProtocolError, ServerIdentity, ServerManagerMessage,
};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{self, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::framing::{write_frame, FrameReadError, FrameReader};
use super::task::{cancelled, BackgroundTask, CancelSignal};

/// Errors returned by link operations.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link is not connected")]
    NotConnected,

    #[error("link is already connected or connecting")]
    AlreadyConnected,

    #[error("failed to connect to chat service at {addr}: {source}")]
    ConnectFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connection closed by chat service")]
    ConnectionClosed,

    #[error("send failed: {0}")]
    SendFailed(#[source] std::io::Error),

    #[error("frame codec error: {0}")]
    Decode(#[from] ProtocolError),
}

impl From<LinkStateError> for LinkError {
    fn from(e: LinkStateError) -> Self {
        match e {
            LinkStateError::NotConnected => Self::NotConnected,
            LinkStateError::AlreadyConnected => Self::AlreadyConnected,
        }
    }
}

/// Why a connect cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// [`ServerManagerLink::disconnect`] was called.
    Requested,
    /// EOF, reset, or a termination frame from the peer.
    RemoteClosed,
    /// The chat service announced it is shutting down.
    ShutdownNotice,
    /// A socket read failed for a reason other than the peer closing.
    ReadFailed(String),
    /// The peer sent bytes that cannot be decoded.
    ProtocolError(String),
}

impl DisconnectReason {
    /// Whether the agent itself asked for the disconnect.
    pub fn is_requested(&self) -> bool {
        matches!(self, Self::Requested)
    }
}

/// Events delivered to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected { peer: Option<SocketAddr> },
    HandshakeAccepted,
    HandshakeRejected { reason: String },
    ReplayRequested(ReplayRequest),
    ShutdownNotice,
    HeartbeatReceived,
    Disconnected { reason: DisconnectReason },
}

/// Timing and protocol constants for one link.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub connect_timeout: Duration,
    /// Upper bound for a single write, and the idle period after which the
    /// receive loop logs that nothing has arrived.
    pub io_timeout: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_failure_limit: u32,
    pub protocol_version: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            io_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(15),
            keepalive_failure_limit: 3,
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

// ── Shared state ──────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct LinkTasks {
    receive: Option<BackgroundTask>,
    keepalive: Option<BackgroundTask>,
}

#[derive(Debug)]
struct LinkShared {
    config: LinkConfig,
    session: Mutex<LinkSession>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    /// Serializes connect, keepalive arming and teardown.
    tasks: Mutex<LinkTasks>,
    /// True between a successful connect and its teardown.
    cycle_open: AtomicBool,
    events: mpsc::UnboundedSender<LinkEvent>,
}

/// Handle to the chat-service session.  Cheap to clone; all clones drive the
/// same socket.
#[derive(Debug, Clone)]
pub struct ServerManagerLink {
    shared: Arc<LinkShared>,
}

impl ServerManagerLink {
    /// Creates a disconnected link and the receiver for its events.
    pub fn new(config: LinkConfig) -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = LinkShared {
            config,
            session: Mutex::new(LinkSession::new()),
            writer: Mutex::new(None),
            tasks: Mutex::new(LinkTasks::default()),
            cycle_open: AtomicBool::new(false),
            events: tx,
        };
        (
            Self {
                shared: Arc::new(shared),
            },
            rx,
        )
    }

    pub fn config(&self) -> &LinkConfig {
        &self.shared.config
    }

    pub async fn is_connected(&self) -> bool {
        self.shared.session.lock().await.is_connected()
    }

    pub async fn is_handshake_accepted(&self) -> bool {
        self.shared.session.lock().await.is_handshake_accepted()
    }

    /// Server id announced by the current session's handshake.
    pub async fn server_id(&self) -> Option<i32> {
        self.shared.session.lock().await.server_id()
    }

    /// Identity cached by the last status publication, kept across reconnects.
    pub async fn last_announced(&self) -> Option<(i32, ServerIdentity)> {
        self.shared
            .session
            .lock()
            .await
            .last_status()
            .map(|s| (s.server_id, s.identity.clone()))
    }

    pub async fn keepalive_active(&self) -> bool {
        self.shared.session.lock().await.keepalive_active()
    }

    /// Opens the TCP session and starts the receive loop.
    ///
    /// # Errors
    ///
    /// - [`LinkError::AlreadyConnected`] if a session is open or opening.
    /// - [`LinkError::ConnectFailed`] if the socket cannot be opened within
    ///   `connect_timeout`.  The link is left disconnected.
    pub async fn connect(&self, host: &str, port: u16) -> Result<(), LinkError> {
        let shared = &self.shared;
        let mut tasks = shared.tasks.lock().await;
        shared.session.lock().await.begin_connect()?;

        let addr = format!("{host}:{port}");
        let stream = match timeout(shared.config.connect_timeout, TcpStream::connect(&addr)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                shared.session.lock().await.connect_failed();
                return Err(LinkError::ConnectFailed { addr, source });
            }
            Err(_) => {
                shared.session.lock().await.connect_failed();
                let source = std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("no answer within {:?}", shared.config.connect_timeout),
                );
                return Err(LinkError::ConnectFailed { addr, source });
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            warn!("could not enable TCP_NODELAY on chat link: {e}");
        }
        let peer = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();

        *shared.writer.lock().await = Some(write_half);
        shared.session.lock().await.connected();
        shared.cycle_open.store(true, Ordering::SeqCst);
        info!("connected to chat service at {addr}");
        shared.emit(LinkEvent::Connected { peer });

        let receiver = Arc::clone(shared);
        tasks.receive = Some(BackgroundTask::spawn("link-receive", move |cancel| {
            receive_loop(receiver, read_half, cancel)
        }));
        Ok(())
    }

    /// Sends the identity handshake.  Acceptance arrives later as
    /// [`LinkEvent::HandshakeAccepted`].
    ///
    /// # Errors
    ///
    /// [`LinkError::NotConnected`] without an open session, or a send/encode
    /// error.
    pub async fn send_handshake(&self, server_id: i32, session_id: &str) -> Result<(), LinkError> {
        self.shared.session.lock().await.require_connected()?;
        let msg = ServerManagerMessage::Handshake(HandshakeRequest {
            server_id,
            session_id: session_id.to_string(),
            protocol_version: self.shared.config.protocol_version,
        });
        self.shared.send(msg).await?;
        self.shared.session.lock().await.record_handshake_sent(server_id)?;
        debug!("handshake sent for server {server_id}");
        Ok(())
    }

    /// Publishes the running status for `identity` and arms the keepalive
    /// loop after the first successful publication.
    ///
    /// `username` and `server_name` are normalized before sending, and the
    /// normalized identity is cached for [`Self::resend_cached_status`].
    ///
    /// # Errors
    ///
    /// [`LinkError::NotConnected`] without an open session, or a send/encode
    /// error.
    pub async fn send_server_info(
        &self,
        server_id: i32,
        identity: &ServerIdentity,
    ) -> Result<(), LinkError> {
        let identity = identity.normalized();
        self.shared
            .session
            .lock()
            .await
            .cache_status(server_id, identity.clone())?;
        self.shared
            .send(ServerManagerMessage::ServerStatus(
                identity.to_status(server_id, RunningFlag::Running),
            ))
            .await?;
        debug!("status published for server {server_id}");
        self.shared.arm_keepalive().await;
        Ok(())
    }

    /// Replays the cached status.  Returns `false` when nothing was ever
    /// published.
    ///
    /// # Errors
    ///
    /// [`LinkError::NotConnected`] without an open session, or a send error.
    pub async fn resend_cached_status(&self) -> Result<bool, LinkError> {
        let Some((server_id, identity)) = self.cached_for_send().await? else {
            return Ok(false);
        };
        self.shared
            .send(ServerManagerMessage::ServerStatus(
                identity.to_status(server_id, RunningFlag::Running),
            ))
            .await?;
        self.shared.arm_keepalive().await;
        Ok(true)
    }

    /// Re-sends the cached identity flagged as stopping.  Returns `false`
    /// when nothing was ever published.
    ///
    /// # Errors
    ///
    /// [`LinkError::NotConnected`] without an open session, or a send error.
    pub async fn send_stopping_status(&self) -> Result<bool, LinkError> {
        let Some((server_id, identity)) = self.cached_for_send().await? else {
            return Ok(false);
        };
        self.shared
            .send(ServerManagerMessage::ServerStatus(
                identity.to_status(server_id, RunningFlag::Stopping),
            ))
            .await?;
        info!("stopping status sent for server {server_id}");
        Ok(true)
    }

    /// Reports a replay upload state.  Best effort: failures are logged and
    /// swallowed.
    pub async fn send_replay_status_update(
        &self,
        match_id: i32,
        account_id: i32,
        status: ReplayUploadStatus,
        download_link: Option<&str>,
    ) {
        if let Err(e) = self.shared.session.lock().await.require_connected() {
            warn!("replay status for match {match_id} dropped: {e}");
            return;
        }
        let msg = ServerManagerMessage::ReplayStatus(ReplayStatusUpdate::new(
            match_id,
            account_id,
            status,
            download_link,
        ));
        match self.shared.send(msg).await {
            Ok(()) => debug!("replay status {status:?} sent for match {match_id}"),
            Err(e) => warn!("replay status for match {match_id} not delivered: {e}"),
        }
    }

    /// Ends the session.  Idempotent; emits `Disconnected` only if a session
    /// was open.
    pub async fn disconnect(&self) {
        self.shared.teardown(DisconnectReason::Requested, false).await;
    }

    async fn cached_for_send(&self) -> Result<Option<(i32, ServerIdentity)>, LinkError> {
        let session = self.shared.session.lock().await;
        session.require_connected()?;
        Ok(session
            .last_status()
            .map(|s| (s.server_id, s.identity.clone())))
    }
}

impl LinkShared {
    fn emit(&self, event: LinkEvent) {
        if self.events.send(event).is_err() {
            debug!("link event dropped: receiver closed");
        }
    }

    /// Encodes and writes one frame, bounded by `io_timeout`.
    async fn send(&self, msg: ServerManagerMessage) -> Result<(), LinkError> {
        let bytes = encode_message(&msg)?;
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(LinkError::NotConnected)?;
        match timeout(self.config.io_timeout, write_frame(writer, &bytes)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(LinkError::SendFailed(e)),
            Err(_) => Err(LinkError::SendFailed(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("write did not complete within {:?}", self.config.io_timeout),
            ))),
        }
    }

    async fn arm_keepalive(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;
        if !self.cycle_open.load(Ordering::SeqCst) {
            return;
        }
        if self.session.lock().await.status_published() == KeepaliveTransition::Start {
            let shared = Arc::clone(self);
            tasks.keepalive = Some(BackgroundTask::spawn("link-keepalive", move |cancel| {
                keepalive_loop(shared, cancel)
            }));
            debug!("keepalive armed every {:?}", self.config.keepalive_interval);
        }
    }

    /// Closes the current cycle.  `from_receiver` is set when the receive
    /// loop itself ends the session and so cannot be awaited.
    async fn teardown(&self, reason: DisconnectReason, from_receiver: bool) {
        let mut tasks = self.tasks.lock().await;
        if !self.cycle_open.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(keepalive) = tasks.keepalive.take() {
            keepalive.stop().await;
        }
        if let Some(receive) = tasks.receive.take() {
            if !from_receiver {
                receive.stop().await;
            }
        }

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Ok(bytes) = encode_message(&ServerManagerMessage::Termination) {
                match timeout(self.config.io_timeout, write_frame(&mut writer, &bytes)).await {
                    Ok(Ok(())) => debug!("termination frame sent"),
                    Ok(Err(e)) => debug!("termination frame not sent: {e}"),
                    Err(_) => debug!("termination frame timed out"),
                }
            }
            let _ = timeout(self.config.io_timeout, writer.shutdown()).await;
        }

        self.session.lock().await.reset();
        info!("chat link closed: {reason:?}");
        self.emit(LinkEvent::Disconnected { reason });
    }

    /// Applies one inbound frame.  `Break` ends the session.
    async fn dispatch(&self, frame: Frame) -> ControlFlow<DisconnectReason> {
        let msg = match decode_message(&frame) {
            Ok(msg) => msg,
            Err(ProtocolError::UnknownCommand(code)) => {
                debug!(
                    "skipping unknown command 0x{code:04X} ({} payload bytes)",
                    frame.payload.len()
                );
                return ControlFlow::Continue(());
            }
            Err(e) => {
                warn!("malformed frame from chat service: {e}");
                return ControlFlow::Break(DisconnectReason::ProtocolError(e.to_string()));
            }
        };

        match msg {
            ServerManagerMessage::HandshakeAccepted(_) => {
                if self.session.lock().await.record_accept() {
                    info!("handshake accepted by chat service");
                    self.emit(LinkEvent::HandshakeAccepted);
                } else {
                    debug!("duplicate handshake accept ignored");
                }
            }
            ServerManagerMessage::HandshakeRejected { reason } => {
                warn!("handshake rejected by chat service: {reason}");
                self.emit(LinkEvent::HandshakeRejected { reason });
            }
            ServerManagerMessage::ReplayRequest(request) => {
                debug!(
                    "replay requested for match {} by account {}",
                    request.match_id, request.account_id
                );
                self.emit(LinkEvent::ReplayRequested(request));
            }
            ServerManagerMessage::ShutdownNotice => {
                info!("chat service announced shutdown");
                self.emit(LinkEvent::ShutdownNotice);
                return ControlFlow::Break(DisconnectReason::ShutdownNotice);
            }
            ServerManagerMessage::Ping => {
                debug!("heartbeat from chat service");
                self.emit(LinkEvent::HeartbeatReceived);
            }
            ServerManagerMessage::Termination => {
                info!("chat service terminated the session");
                return ControlFlow::Break(DisconnectReason::RemoteClosed);
            }
            ServerManagerMessage::Handshake(_)
            | ServerManagerMessage::ServerStatus(_)
            | ServerManagerMessage::ReplayStatus(_) => {
                debug!("ignoring outbound-only command 0x{:04X}", frame.command);
            }
        }
        ControlFlow::Continue(())
    }
}

// ── Background loops ──────────────────────────────────────────────────────────

async fn receive_loop(shared: Arc<LinkShared>, read_half: OwnedReadHalf, mut cancel: CancelSignal) {
    let mut reader = FrameReader::new(read_half);
    let idle = shared.config.io_timeout;

    let reason = loop {
        let next = tokio::select! {
            _ = cancelled(&mut cancel) => return,
            next = timeout(idle, reader.next_frame()) => next,
        };

        let frame = match next {
            Err(_) => {
                debug!("no frame from chat service for {idle:?}");
                continue;
            }
            Ok(Ok(frame)) => frame,
            Ok(Err(FrameReadError::ConnectionClosed { buffered })) => {
                if buffered > 0 {
                    warn!("chat service closed the connection mid-frame ({buffered} bytes pending)");
                }
                break DisconnectReason::RemoteClosed;
            }
            Ok(Err(FrameReadError::Io(e))) if is_peer_reset(&e) => {
                break DisconnectReason::RemoteClosed;
            }
            Ok(Err(FrameReadError::Io(e))) => {
                warn!("read from chat service failed: {e}");
                break DisconnectReason::ReadFailed(e.to_string());
            }
            Ok(Err(FrameReadError::Decode(e))) => {
                warn!("undecodable frame from chat service: {e}");
                break DisconnectReason::ProtocolError(e.to_string());
            }
        };

        if let ControlFlow::Break(reason) = shared.dispatch(frame).await {
            break reason;
        }
    };

    // A concurrent `disconnect` holds the task lock while it cancels this
    // loop; yield to it instead of waiting for the lock.
    tokio::select! {
        _ = cancelled(&mut cancel) => {}
        _ = shared.teardown(reason, true) => {}
    }
}

fn is_peer_reset(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
    )
}

async fn keepalive_loop(shared: Arc<LinkShared>, mut cancel: CancelSignal) {
    let link: &LinkShared = &shared;
    let exit = run_keepalive(
        link.config.keepalive_interval,
        link.config.keepalive_failure_limit,
        &mut cancel,
        move || link.send(ServerManagerMessage::Ping),
    )
    .await;

    if exit == KeepaliveExit::FailureLimit {
        link.session.lock().await.keepalive_stopped();
        warn!(
            "keepalive stopped after {} consecutive failures",
            link.config.keepalive_failure_limit
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeepaliveExit {
    Cancelled,
    FailureLimit,
}

/// Calls `send_ping` every `interval` until cancelled or until
/// `failure_limit` consecutive sends fail.  The first ping goes out one
/// interval after start.
async fn run_keepalive<F, Fut>(
    interval: Duration,
    failure_limit: u32,
    cancel: &mut CancelSignal,
    mut send_ping: F,
) -> KeepaliveExit
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), LinkError>>,
{
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    let mut failures = 0u32;
    loop {
        tokio::select! {
            _ = cancelled(cancel) => return KeepaliveExit::Cancelled,
            _ = ticker.tick() => {}
        }

        let sent = tokio::select! {
            _ = cancelled(cancel) => return KeepaliveExit::Cancelled,
            sent = send_ping() => sent,
        };
        match sent {
            Ok(()) => {
                failures = 0;
                debug!("keepalive ping sent");
            }
            Err(e) => {
                failures += 1;
                warn!("keepalive ping failed ({failures}/{failure_limit}): {e}");
                if failures >= failure_limit {
                    return KeepaliveExit::FailureLimit;
                }
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::watch;

    fn make_link() -> (ServerManagerLink, mpsc::UnboundedReceiver<LinkEvent>) {
        ServerManagerLink::new(LinkConfig {
            connect_timeout: Duration::from_secs(2),
            ..Default::default()
        })
    }

    #[test]
    fn test_link_config_default_timings() {
        let cfg = LinkConfig::default();
        assert_eq!(cfg.keepalive_interval, Duration::from_secs(15));
        assert_eq!(cfg.io_timeout, Duration::from_secs(30));
        assert_eq!(cfg.keepalive_failure_limit, 3);
        assert_eq!(cfg.protocol_version, PROTOCOL_VERSION);
    }

    #[test]
    fn test_link_state_errors_map_to_link_errors() {
        assert!(matches!(
            LinkError::from(LinkStateError::NotConnected),
            LinkError::NotConnected
        ));
        assert!(matches!(
            LinkError::from(LinkStateError::AlreadyConnected),
            LinkError::AlreadyConnected
        ));
    }

    #[tokio::test]
    async fn test_sends_without_connection_return_not_connected() {
        // Arrange
        let (link, _rx) = make_link();

        // Act
        let handshake = link.send_handshake(1, "token").await;
        let status = link.send_server_info(1, &ServerIdentity::default()).await;
        let stopping = link.send_stopping_status().await;

        // Assert
        assert!(matches!(handshake, Err(LinkError::NotConnected)));
        assert!(matches!(status, Err(LinkError::NotConnected)));
        assert!(matches!(stopping, Err(LinkError::NotConnected)));
        assert!(link.last_announced().await.is_none());
    }

    #[tokio::test]
    async fn test_replay_status_without_connection_is_swallowed() {
        let (link, mut rx) = make_link();

        link.send_replay_status_update(1, 2, ReplayUploadStatus::NotFound, None)
            .await;

        assert!(rx.try_recv().is_err(), "no event for a dropped replay status");
    }

    #[tokio::test]
    async fn test_disconnect_without_connection_emits_nothing() {
        let (link, mut rx) = make_link();

        link.disconnect().await;
        link.disconnect().await;

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connect_refused_leaves_link_reusable() {
        // Arrange: grab a free port, then close the listener
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let (link, mut rx) = make_link();

        // Act
        let result = link.connect("127.0.0.1", port).await;

        // Assert
        assert!(matches!(result, Err(LinkError::ConnectFailed { .. })));
        assert!(!link.is_connected().await);
        assert!(rx.try_recv().is_err(), "a failed connect emits no events");
        let retry = link.connect("127.0.0.1", port).await;
        assert!(
            matches!(retry, Err(LinkError::ConnectFailed { .. })),
            "a failed connect must not leave the link half-open"
        );
    }

    #[tokio::test]
    async fn test_keepalive_stops_after_failure_limit() {
        // Arrange
        let (_tx, mut cancel) = watch::channel(false);
        let attempts = AtomicU32::new(0);

        // Act
        let exit = timeout(
            Duration::from_secs(2),
            run_keepalive(Duration::from_millis(10), 3, &mut cancel, || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(LinkError::ConnectionClosed) }
            }),
        )
        .await
        .expect("keepalive must give up on its own");

        // Assert
        assert_eq!(exit, KeepaliveExit::FailureLimit);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_keepalive_success_resets_failure_count() {
        // Arrange: fail, fail, succeed, then fail forever
        let (_tx, mut cancel) = watch::channel(false);
        let attempts = AtomicU32::new(0);

        // Act
        let exit = timeout(
            Duration::from_secs(2),
            run_keepalive(Duration::from_millis(5), 3, &mut cancel, || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 2 {
                        Ok(())
                    } else {
                        Err(LinkError::ConnectionClosed)
                    }
                }
            }),
        )
        .await
        .expect("keepalive must give up on its own");

        // Assert: 2 failures, 1 success, then 3 more failures
        assert_eq!(exit, KeepaliveExit::FailureLimit);
        assert_eq!(attempts.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_keepalive_cancel_interrupts_long_interval() {
        // Arrange
        let (tx, mut cancel) = watch::channel(false);
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(20)).await;
            let _ = tx.send(true);
        });

        // Act
        let exit = timeout(
            Duration::from_secs(2),
            run_keepalive(Duration::from_secs(3600), 3, &mut cancel, || async {
                Ok::<(), LinkError>(())
            }),
        )
        .await
        .expect("cancellation must not wait for the interval");

        // Assert
        assert_eq!(exit, KeepaliveExit::Cancelled);
    }

    #[tokio::test]
    async fn test_keepalive_send_failures_stop_keepalive_without_disconnect() {
        // Arrange: an open session whose read side stays up
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (link, mut rx) = ServerManagerLink::new(LinkConfig {
            keepalive_interval: Duration::from_millis(20),
            keepalive_failure_limit: 2,
            ..Default::default()
        });
        let (connected, accepted) = tokio::join!(link.connect("127.0.0.1", port), listener.accept());
        connected.unwrap();
        let (_service, _) = accepted.unwrap();
        assert!(matches!(rx.recv().await, Some(LinkEvent::Connected { .. })));
        link.send_server_info(7, &ServerIdentity::default()).await.unwrap();
        assert!(link.keepalive_active().await);

        // Act: every later write fails with NotConnected
        let _writer = link.shared.writer.lock().await.take();
        let stopped = timeout(Duration::from_secs(2), async {
            while link.keepalive_active().await {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;

        // Assert
        assert!(stopped.is_ok(), "keepalive must stop at the failure limit");
        let extra = timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(!matches!(extra, Ok(Some(_))), "unexpected event: {extra:?}");
        assert!(link.is_connected().await);
        link.disconnect().await;
    }

    #[tokio::test]
    async fn test_keepalive_cancel_interrupts_stalled_send() {
        // Arrange: the first send never completes within the test
        let (tx, mut cancel) = watch::channel(false);
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(50)).await;
            let _ = tx.send(true);
        });

        // Act
        let exit = timeout(
            Duration::from_secs(2),
            run_keepalive(Duration::from_millis(10), 3, &mut cancel, || async {
                time::sleep(Duration::from_secs(30)).await;
                Ok::<(), LinkError>(())
            }),
        )
        .await
        .expect("cancellation must not wait for the send");

        // Assert
        assert_eq!(exit, KeepaliveExit::Cancelled);
    }

    #[test]
    fn test_only_requested_reason_is_requested() {
        assert!(DisconnectReason::Requested.is_requested());
        assert!(!DisconnectReason::RemoteClosed.is_requested());
        assert!(!DisconnectReason::ShutdownNotice.is_requested());
    }
}
