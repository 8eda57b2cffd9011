//! Periodic UDP liveness prober.
//!
//! Every `poll_interval` the prober snapshots the monitored ports and probes
//! them one after another through a [`Pinger`].  Results are folded into a
//! per-port [`HealthRecord`]; the transitions it reports become
//! [`ProberEvent`]s.
//!
//! The record map sits behind one `std::sync::Mutex`.  The lock is taken to
//! snapshot ports and to apply a result, never across a probe.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use gsm_core::protocol::liveness::{PING_MARKER, PONG_MARKER};
use gsm_core::{HealthPolicy, HealthRecord, HealthTransition, ServerHealth};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{self, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::task::{cancelled, BackgroundTask, CancelSignal};

/// Why a single probe failed.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("empty reply")]
    EmptyReply,

    #[error("unexpected reply marker 0x{0:02X}")]
    WrongMarker(u8),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Sends one liveness ping and measures the round trip.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Pinger: Send + Sync {
    async fn ping(&self, port: u16, timeout: Duration) -> Result<Duration, ProbeError>;
}

/// [`Pinger`] over a fresh UDP socket per probe.
#[derive(Debug, Clone)]
pub struct UdpPinger {
    host: IpAddr,
}

impl UdpPinger {
    pub fn new(host: IpAddr) -> Self {
        Self { host }
    }
}

impl Default for UdpPinger {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }
}

#[async_trait]
impl Pinger for UdpPinger {
    async fn ping(&self, port: u16, limit: Duration) -> Result<Duration, ProbeError> {
        let bind: SocketAddr = match self.host {
            IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect((self.host, port)).await?;

        let started = Instant::now();
        socket.send(&[PING_MARKER]).await?;

        let mut buf = [0u8; 64];
        let n = timeout(limit, socket.recv(&mut buf))
            .await
            .map_err(|_| ProbeError::Timeout(limit))??;
        let elapsed = started.elapsed();

        match buf[..n].first() {
            None => Err(ProbeError::EmptyReply),
            Some(&PONG_MARKER) => Ok(elapsed),
            Some(&other) => Err(ProbeError::WrongMarker(other)),
        }
    }
}

/// Health transitions reported to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum ProberEvent {
    Unhealthy {
        port: u16,
        consecutive_failures: u32,
        last_error: String,
    },
    Recovered {
        port: u16,
        response_time_ms: u64,
    },
    RestartRecommended {
        port: u16,
        reason: String,
    },
}

impl ProberEvent {
    pub fn port(&self) -> u16 {
        match self {
            Self::Unhealthy { port, .. }
            | Self::Recovered { port, .. }
            | Self::RestartRecommended { port, .. } => *port,
        }
    }

    fn from_transition(port: u16, transition: HealthTransition) -> Self {
        match transition {
            HealthTransition::Unhealthy {
                consecutive_failures,
                last_error,
            } => Self::Unhealthy {
                port,
                consecutive_failures,
                last_error,
            },
            HealthTransition::Recovered { response_time_ms } => Self::Recovered {
                port,
                response_time_ms,
            },
            HealthTransition::RestartRecommended { reason, .. } => {
                Self::RestartRecommended { port, reason }
            }
        }
    }
}

/// Polling cadence and thresholds.
#[derive(Debug, Clone)]
pub struct ProberConfig {
    pub poll_interval: Duration,
    pub probe_timeout: Duration,
    pub policy: HealthPolicy,
}

impl Default for ProberConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            policy: HealthPolicy::default(),
        }
    }
}

struct ProberShared {
    config: ProberConfig,
    pinger: Arc<dyn Pinger>,
    records: std::sync::Mutex<BTreeMap<u16, HealthRecord>>,
    events: mpsc::UnboundedSender<ProberEvent>,
}

/// Polls monitored ports and tracks their health.
pub struct LivenessProber {
    shared: Arc<ProberShared>,
    task: Mutex<Option<BackgroundTask>>,
}

impl LivenessProber {
    /// Creates a stopped prober with no monitored ports.
    pub fn new(
        config: ProberConfig,
        pinger: Arc<dyn Pinger>,
    ) -> (Self, mpsc::UnboundedReceiver<ProberEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = ProberShared {
            config,
            pinger,
            records: std::sync::Mutex::new(BTreeMap::new()),
            events: tx,
        };
        (
            Self {
                shared: Arc::new(shared),
                task: Mutex::new(None),
            },
            rx,
        )
    }

    pub fn config(&self) -> &ProberConfig {
        &self.shared.config
    }

    /// Starts the polling loop.  The first cycle runs immediately.
    pub async fn start(&self) {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            debug!("liveness prober already running");
            return;
        }
        let shared = Arc::clone(&self.shared);
        *task = Some(BackgroundTask::spawn("liveness-prober", move |cancel| {
            poll_loop(shared, cancel)
        }));
        info!(
            "liveness prober started: every {:?}, timeout {:?}, threshold {}",
            self.shared.config.poll_interval,
            self.shared.config.probe_timeout,
            self.shared.config.policy.failure_threshold
        );
    }

    /// Stops polling and forgets every record.
    pub async fn stop(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.stop().await;
            info!("liveness prober stopped");
        }
        self.shared.records().clear();
    }

    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Starts monitoring `port`.  Returns `false` if it was already monitored.
    pub fn add_server(&self, port: u16) -> bool {
        let mut records = self.shared.records();
        if records.contains_key(&port) {
            return false;
        }
        records.insert(port, HealthRecord::new(port));
        debug!("monitoring game UDP port {port}");
        true
    }

    /// Stops monitoring `port`.  Returns `false` if it was not monitored.
    pub fn remove_server(&self, port: u16) -> bool {
        let removed = self.shared.records().remove(&port).is_some();
        if removed {
            debug!("no longer monitoring game UDP port {port}");
        }
        removed
    }

    pub fn monitored_ports(&self) -> Vec<u16> {
        self.shared.records().keys().copied().collect()
    }

    /// Snapshot of every record, ordered by port.
    pub fn get_health_status(&self) -> Vec<ServerHealth> {
        let policy = self.shared.config.policy;
        self.shared
            .records()
            .values()
            .map(|r| r.snapshot(&policy))
            .collect()
    }

    pub fn get_server_health(&self, port: u16) -> Option<ServerHealth> {
        let policy = self.shared.config.policy;
        self.shared.records().get(&port).map(|r| r.snapshot(&policy))
    }

    /// Runs one poll cycle now, independent of the timer.
    pub async fn probe_now(&self) {
        self.shared.poll_once().await;
    }
}

impl ProberShared {
    fn records(&self) -> MutexGuard<'_, BTreeMap<u16, HealthRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn poll_once(&self) {
        let ports: Vec<u16> = self.records().keys().copied().collect();
        for port in ports {
            let result = self.pinger.ping(port, self.config.probe_timeout).await;
            self.apply(port, result);
        }
    }

    fn apply(&self, port: u16, result: Result<Duration, ProbeError>) {
        let policy = self.config.policy;
        let transitions = {
            let mut records = self.records();
            let Some(record) = records.get_mut(&port) else {
                debug!("port {port} removed during probe; result dropped");
                return;
            };
            match &result {
                Ok(rtt) => record
                    .record_success(&policy, *rtt, SystemTime::now())
                    .into_iter()
                    .collect::<Vec<_>>(),
                Err(e) => record.record_failure(&policy, &e.to_string()),
            }
        };

        match &result {
            Ok(rtt) => debug!("port {port} answered in {rtt:?}"),
            Err(e) => debug!("probe of port {port} failed: {e}"),
        }

        for transition in transitions {
            let event = ProberEvent::from_transition(port, transition);
            match &event {
                ProberEvent::Unhealthy {
                    consecutive_failures,
                    last_error,
                    ..
                } => warn!(
                    "port {port} unhealthy after {consecutive_failures} failures: {last_error}"
                ),
                ProberEvent::Recovered {
                    response_time_ms, ..
                } => info!("port {port} recovered ({response_time_ms} ms)"),
                ProberEvent::RestartRecommended { reason, .. } => {
                    warn!("restart recommended for port {port}: {reason}")
                }
            }
            if self.events.send(event).is_err() {
                debug!("prober event dropped: receiver closed");
            }
        }
    }
}

async fn poll_loop(shared: Arc<ProberShared>, mut cancel: CancelSignal) {
    let mut ticker = time::interval(shared.config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancelled(&mut cancel) => break,
            _ = ticker.tick() => {}
        }
        tokio::select! {
            _ = cancelled(&mut cancel) => break,
            _ = shared.poll_once() => {}
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
