//! Integration tests for the UDP liveness responder and prober over real
//! loopback sockets.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use gsm_agent::infrastructure::network::{
    LivenessProber, LivenessResponder, ProberConfig, ProberEvent, ResponderConfig, UdpPinger,
};
use gsm_core::protocol::liveness::{
    decode_response, PING_MARKER, PONG_MARKER, RESPONSE_HEADER, TIMESTAMP_SIZE,
};
use gsm_core::{HealthPolicy, RestartPolicy};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

/// A game-side endpoint that answers every datagram with the pong marker.
async fn spawn_pong_server(socket: UdpSocket) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = [0u8; 64];
        while let Ok((_, src)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&[PONG_MARKER], src).await;
        }
    })
}

/// A loopback port with nothing bound to it.
async fn closed_port() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.local_addr().unwrap().port()
}

fn prober_with_threshold(threshold: u32) -> (LivenessProber, UnboundedReceiver<ProberEvent>) {
    let config = ProberConfig {
        poll_interval: Duration::from_secs(3600),
        probe_timeout: Duration::from_millis(300),
        policy: HealthPolicy {
            failure_threshold: threshold,
            restart_policy: RestartPolicy::OncePerEpisode,
        },
    };
    LivenessProber::new(config, Arc::new(UdpPinger::new(IpAddr::V4(Ipv4Addr::LOCALHOST))))
}

// ── Responder ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_responder_answers_single_byte_ping() {
    // Arrange
    let responder = LivenessResponder::bind(ResponderConfig {
        bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        region: "USE".to_string(),
    })
    .await
    .unwrap();
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(responder.local_addr()).await.unwrap();

    // Act
    client.send(&[PING_MARKER]).await.unwrap();
    let mut buf = [0u8; 128];
    let n = timeout(WAIT, client.recv(&mut buf)).await.unwrap().unwrap();

    // Assert
    assert_eq!(&buf[..2], &RESPONSE_HEADER);
    assert!(n >= RESPONSE_HEADER.len() + 1 + TIMESTAMP_SIZE + 1 + "USE".len());
    let reply = decode_response(&buf[..n], 1).unwrap();
    assert_eq!(reply.echoed, vec![PING_MARKER]);
    assert_eq!(reply.region, "USE");
    assert_eq!(responder.packets_received(), 1);
    responder.stop().await;
}

#[tokio::test]
async fn test_responder_on_wildcard_passes_self_test() {
    // Arrange
    let responder = LivenessResponder::bind(ResponderConfig {
        bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        port: 0,
        region: "EU".to_string(),
    })
    .await
    .unwrap();

    // Act
    let healthy = responder.check_health().await;

    // Assert
    assert!(healthy);
    assert_eq!(responder.packets_received(), 1);
    responder.stop().await;
}

// ── Prober ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_prober_counts_dead_port_and_still_probes_live_one() {
    // Arrange
    let pong = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let live_port = pong.local_addr().unwrap().port();
    let server = spawn_pong_server(pong).await;
    let dead_port = closed_port().await;
    let (prober, _events) = prober_with_threshold(3);
    assert!(prober.add_server(live_port));
    assert!(prober.add_server(dead_port));

    // Act
    prober.probe_now().await;

    // Assert
    let live = prober.get_server_health(live_port).unwrap();
    assert!(live.is_healthy);
    assert_eq!(live.consecutive_failures, 0);
    assert!(live.last_success.is_some());
    assert!(live.last_response_time_ms.is_some());

    let dead = prober.get_server_health(dead_port).unwrap();
    assert_eq!(dead.consecutive_failures, 1);
    assert!(dead.last_error.is_some());
    assert!(dead.is_healthy, "one failure is below the threshold");
    server.abort();
}

#[tokio::test]
async fn test_prober_reports_unhealthy_restart_and_recovery() {
    // Arrange
    let port = closed_port().await;
    let (prober, mut events) = prober_with_threshold(1);
    prober.add_server(port);

    // Act: two failures reach the threshold and then twice the threshold
    prober.probe_now().await;
    prober.probe_now().await;
    let pong = UdpSocket::bind(("127.0.0.1", port)).await.unwrap();
    let server = spawn_pong_server(pong).await;
    prober.probe_now().await;

    // Assert
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert_eq!(seen.len(), 3, "events: {seen:?}");
    assert!(matches!(
        seen[0],
        ProberEvent::Unhealthy {
            consecutive_failures: 1,
            ..
        }
    ));
    assert!(matches!(seen[1], ProberEvent::RestartRecommended { .. }));
    assert!(matches!(seen[2], ProberEvent::Recovered { .. }));
    assert!(seen.iter().all(|e| e.port() == port));
    assert!(prober.get_server_health(port).unwrap().is_healthy);
    server.abort();
}

#[tokio::test]
async fn test_started_prober_polls_immediately_and_stops_cleanly() {
    // Arrange
    let pong = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = pong.local_addr().unwrap().port();
    let server = spawn_pong_server(pong).await;
    let (prober, _events) = prober_with_threshold(3);
    prober.add_server(port);

    // Act
    prober.start().await;
    let polled = timeout(WAIT, async {
        loop {
            if prober
                .get_server_health(port)
                .is_some_and(|h| h.last_success.is_some())
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    prober.stop().await;

    // Assert
    assert!(polled.is_ok(), "first cycle must not wait for the interval");
    assert!(!prober.is_running().await);
    assert!(prober.monitored_ports().is_empty());
    server.abort();
}
