//! Criterion benchmarks for the Server-Manager frame codec.
//!
//! Run with:
//! ```bash
//! cargo bench --package gsm-core --bench codec_bench
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use gsm_core::protocol::codec::{decode_frame, decode_message, encode_message};
use gsm_core::protocol::liveness::{encode_response, PING_MARKER};
use gsm_core::protocol::messages::{
    HandshakeRequest, ReplayStatusUpdate, ReplayUploadStatus, RunningFlag, ServerManagerMessage,
    ServerStatusMessage,
};

// ── Message fixtures ──────────────────────────────────────────────────────────

fn make_handshake() -> ServerManagerMessage {
    ServerManagerMessage::Handshake(HandshakeRequest {
        server_id: 1201,
        session_id: "6f1c2b9e-7d0a-4c55-9a38-0e4f5d2a1b77".to_string(),
        protocol_version: 70,
    })
}

fn make_status() -> ServerManagerMessage {
    ServerManagerMessage::ServerStatus(ServerStatusMessage {
        server_id: 1201,
        username: "eu-host-01:".to_string(),
        region: "EU".to_string(),
        server_name: "Frankfurt 3 0".to_string(),
        version: "4.10.1".to_string(),
        ip: "203.0.113.7".to_string(),
        udp_ping_port: 11234,
        running: RunningFlag::Running,
    })
}

fn make_replay_status() -> ServerManagerMessage {
    ServerManagerMessage::ReplayStatus(ReplayStatusUpdate {
        match_id: 99_001,
        account_id: 4242,
        status: ReplayUploadStatus::UploadComplete,
        download_link: Some("https://replays.example/99001.rep".to_string()),
    })
}

fn fixtures() -> Vec<(&'static str, ServerManagerMessage)> {
    vec![
        ("ping", ServerManagerMessage::Ping),
        ("handshake", make_handshake()),
        ("server_status", make_status()),
        ("replay_status", make_replay_status()),
    ]
}

// ── Benchmarks ────────────────────────────────────────────────────────────────

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    for (name, msg) in fixtures() {
        group.bench_with_input(BenchmarkId::from_parameter(name), &msg, |b, msg| {
            b.iter(|| encode_message(black_box(msg)).unwrap())
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    for (name, msg) in fixtures() {
        let bytes = encode_message(&msg).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(name), &bytes, |b, bytes| {
            b.iter(|| {
                let (frame, _) = decode_frame(black_box(bytes)).unwrap();
                decode_message(&frame).unwrap()
            })
        });
    }
    group.finish();
}

fn bench_liveness_response(c: &mut Criterion) {
    let request = [PING_MARKER, 0x10, 0x20, 0x30];
    c.bench_function("liveness_encode_response", |b| {
        b.iter(|| encode_response(black_box(&request), black_box(1_700_000_000_000), "EU"))
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_liveness_response);
criterion_main!(benches);
