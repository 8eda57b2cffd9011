//! UDP liveness responder.
//!
//! One responder runs per managed game server, on the port given by
//! [`gsm_core::liveness_port`].  Every datagram of at least one byte is
//! answered with the response header, the echoed request, the current Unix
//! time in milliseconds and the configured region (see
//! [`gsm_core::protocol::liveness`]).  Empty datagrams are dropped.
//!
//! The receive loop owns the socket; [`LivenessResponder::stop`] cancels
//! the loop and waits for it, which closes the socket.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use gsm_core::protocol::liveness::{encode_response, is_valid_request, SELF_TEST_PROBE};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::task::{cancelled, BackgroundTask, CancelSignal};

/// Largest datagram the responder reads; longer requests are truncated by
/// the OS and echoed as received.
const MAX_DATAGRAM: usize = 2048;

const SELF_TEST_TIMEOUT: Duration = Duration::from_secs(1);
const SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Error type for responder start-up.
#[derive(Debug, Error)]
pub enum ResponderError {
    /// The UDP socket could not be bound.
    #[error("failed to bind liveness socket on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Where a responder listens and what it reports.
#[derive(Debug, Clone)]
pub struct ResponderConfig {
    pub bind_ip: IpAddr,
    pub port: u16,
    /// Region string echoed in every reply.
    pub region: String,
}

#[derive(Debug, Default)]
struct ResponderStats {
    packets_received: AtomicU64,
    /// Milliseconds since the Unix epoch; 0 means never.
    last_activity_ms: AtomicU64,
}

/// A running liveness responder.
#[derive(Debug)]
pub struct LivenessResponder {
    local_addr: SocketAddr,
    stats: Arc<ResponderStats>,
    task: Mutex<Option<BackgroundTask>>,
}

impl LivenessResponder {
    /// Binds the socket and starts answering pings.
    ///
    /// # Errors
    ///
    /// Returns [`ResponderError::BindFailed`] if the port cannot be bound.
    pub async fn bind(config: ResponderConfig) -> Result<Self, ResponderError> {
        let addr = SocketAddr::new(config.bind_ip, config.port);
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| ResponderError::BindFailed { addr, source })?;
        let local_addr = socket
            .local_addr()
            .map_err(|source| ResponderError::BindFailed { addr, source })?;

        let stats = Arc::new(ResponderStats::default());
        let loop_stats = Arc::clone(&stats);
        let region = config.region;
        let task = BackgroundTask::spawn("liveness-responder", move |cancel| {
            respond_loop(socket, region, loop_stats, cancel)
        });

        info!("liveness responder listening on UDP {local_addr}");
        Ok(Self {
            local_addr,
            stats,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Datagrams received since start, valid or not.
    pub fn packets_received(&self) -> u64 {
        self.stats.packets_received.load(Ordering::Relaxed)
    }

    /// Time of the most recent datagram.
    pub fn last_activity(&self) -> Option<SystemTime> {
        match self.stats.last_activity_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(UNIX_EPOCH + Duration::from_millis(ms)),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Sends the fixed self-test probe to the responder's own port over
    /// loopback and reports whether any reply arrived within one second.
    pub async fn check_health(&self) -> bool {
        if !self.is_running().await {
            return false;
        }
        match self_test(self.local_addr).await {
            Ok(n) => {
                debug!("self-test on {} answered with {n} bytes", self.local_addr);
                true
            }
            Err(e) => {
                warn!("self-test on {} failed: {e}", self.local_addr);
                false
            }
        }
    }

    /// Stops the receive loop and closes the socket.  Idempotent.
    pub async fn stop(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.stop().await;
            info!("liveness responder on {} stopped", self.local_addr);
        }
    }
}

async fn self_test(local_addr: SocketAddr) -> std::io::Result<usize> {
    let target = loopback_target(local_addr);
    let bind: SocketAddr = if target.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(target).await?;
    socket.send(&SELF_TEST_PROBE).await?;

    let mut buf = [0u8; MAX_DATAGRAM];
    let n = timeout(SELF_TEST_TIMEOUT, socket.recv(&mut buf))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "no self-test reply"))??;
    if n == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "empty self-test reply",
        ));
    }
    Ok(n)
}

/// Maps a wildcard bind address to the matching loopback address.
fn loopback_target(local_addr: SocketAddr) -> SocketAddr {
    let ip = match local_addr.ip() {
        IpAddr::V4(v4) if v4.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(v6) if v6.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    SocketAddr::new(ip, local_addr.port())
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

async fn respond_loop(
    socket: UdpSocket,
    region: String,
    stats: Arc<ResponderStats>,
    mut cancel: CancelSignal,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let received = tokio::select! {
            _ = cancelled(&mut cancel) => break,
            received = socket.recv_from(&mut buf) => received,
        };
        let (len, src) = match received {
            Ok(pair) => pair,
            Err(e) => {
                debug!("liveness recv error: {e}");
                continue;
            }
        };

        let now = unix_millis();
        stats.packets_received.fetch_add(1, Ordering::Relaxed);
        stats.last_activity_ms.store(now.max(1), Ordering::Relaxed);

        let request = &buf[..len];
        if !is_valid_request(request) {
            debug!("dropping {len}-byte liveness datagram from {src}");
            continue;
        }

        let reply = encode_response(request, now, &region);
        match timeout(SEND_TIMEOUT, socket.send_to(&reply, src)).await {
            Ok(Ok(_)) => debug!("answered {len}-byte liveness ping from {src}"),
            Ok(Err(e)) => warn!("liveness reply to {src} failed: {e}"),
            Err(_) => warn!("liveness reply to {src} timed out"),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use gsm_core::protocol::liveness::{decode_response, PING_MARKER, RESPONSE_HEADER};

    async fn start_local(region: &str) -> LivenessResponder {
        LivenessResponder::bind(ResponderConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            region: region.to_string(),
        })
        .await
        .expect("bind responder")
    }

    async fn client_for(responder: &LivenessResponder) -> UdpSocket {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(responder.local_addr()).await.unwrap();
        client
    }

    #[test]
    fn test_loopback_target_replaces_wildcard() {
        let v4: SocketAddr = "0.0.0.0:11234".parse().unwrap();
        let v6: SocketAddr = "[::]:11234".parse().unwrap();
        let fixed: SocketAddr = "10.1.2.3:11234".parse().unwrap();

        assert_eq!(loopback_target(v4), SocketAddr::from((Ipv4Addr::LOCALHOST, 11234)));
        assert_eq!(loopback_target(v6), SocketAddr::from((Ipv6Addr::LOCALHOST, 11234)));
        assert_eq!(loopback_target(fixed), fixed);
    }

    #[tokio::test]
    async fn test_echo_reply_carries_request_timestamp_and_region() {
        // Arrange
        let responder = start_local("EU-West").await;
        let client = client_for(&responder).await;
        let request = [PING_MARKER, 0xCA, 0xFE];
        let before = unix_millis();

        // Act
        client.send(&request).await.unwrap();
        let mut buf = [0u8; 512];
        let n = timeout(Duration::from_secs(2), client.recv(&mut buf))
            .await
            .expect("reply in time")
            .unwrap();

        // Assert
        assert_eq!(&buf[..2], &RESPONSE_HEADER);
        let decoded = decode_response(&buf[..n], request.len()).unwrap();
        assert_eq!(decoded.echoed, request.to_vec());
        assert_eq!(decoded.region, "EU-West");
        assert!(decoded.timestamp_ms >= before);
        responder.stop().await;
    }

    #[tokio::test]
    async fn test_empty_datagram_is_counted_but_not_answered() {
        // Arrange
        let responder = start_local("US").await;
        let client = client_for(&responder).await;

        // Act
        client.send(&[]).await.unwrap();
        let mut buf = [0u8; 64];
        let reply = timeout(Duration::from_millis(200), client.recv(&mut buf)).await;

        // Assert
        assert!(reply.is_err(), "empty datagram must not be answered");
        assert_eq!(responder.packets_received(), 1);
        assert!(responder.last_activity().is_some());
        responder.stop().await;
    }

    #[tokio::test]
    async fn test_new_responder_has_no_activity() {
        let responder = start_local("US").await;
        assert_eq!(responder.packets_received(), 0);
        assert!(responder.last_activity().is_none());
        responder.stop().await;
    }

    #[tokio::test]
    async fn test_check_health_passes_while_running_and_fails_after_stop() {
        // Arrange
        let responder = start_local("SEA").await;

        // Act
        let running = responder.check_health().await;
        responder.stop().await;
        responder.stop().await;
        let stopped = responder.check_health().await;

        // Assert
        assert!(running);
        assert!(!stopped);
        assert!(!responder.is_running().await);
    }

    #[tokio::test]
    async fn test_bind_on_taken_port_reports_bind_failed() {
        let first = start_local("EU").await;

        let second = LivenessResponder::bind(ResponderConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: first.local_addr().port(),
            region: "EU".to_string(),
        })
        .await;

        assert!(matches!(second, Err(ResponderError::BindFailed { .. })));
        first.stop().await;
    }
}
