//! Wire format of the UDP liveness protocol.
//!
//! Two exchanges share this module:
//!
//! **Responder** (embedded next to each game server):
//! ```text
//! request : [0x01][opaque client bytes...]
//! response: [0x00 0x01][echoed request][timestamp_ms:8 LE][region_len:1][region]
//! ```
//!
//! **Prober** (run by the agent against each monitored port):
//! ```text
//! request : [0x01]
//! response: [0x02]
//! ```

use crate::protocol::codec::ProtocolError;

/// First byte of every liveness request.
pub const PING_MARKER: u8 = 0x01;

/// Single-byte reply the prober expects.
pub const PONG_MARKER: u8 = 0x02;

/// Header that opens every responder reply.
pub const RESPONSE_HEADER: [u8; 2] = [0x00, 0x01];

/// Fixed packet the responder sends to itself during a self-test.
pub const SELF_TEST_PROBE: [u8; 6] = [0x00, 0x01, 0xDE, 0xAD, 0xBE, 0xEF];

/// Smallest request the responder answers.
pub const MIN_REQUEST_LEN: usize = 1;

/// Timestamp field width in a responder reply.
pub const TIMESTAMP_SIZE: usize = 8;

/// A decoded responder reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessResponse {
    pub echoed: Vec<u8>,
    pub timestamp_ms: u64,
    pub region: String,
}

/// Whether `request` is long enough to deserve a reply.
pub fn is_valid_request(request: &[u8]) -> bool {
    request.len() >= MIN_REQUEST_LEN
}

/// Builds the responder's reply to `request`.
///
/// Regions longer than 255 bytes are cut at the last character boundary that
/// fits the one-byte length field.
pub fn encode_response(request: &[u8], timestamp_ms: u64, region: &str) -> Vec<u8> {
    let region = truncate_utf8(region, u8::MAX as usize);
    let mut buf =
        Vec::with_capacity(RESPONSE_HEADER.len() + request.len() + TIMESTAMP_SIZE + 1 + region.len());
    buf.extend_from_slice(&RESPONSE_HEADER);
    buf.extend_from_slice(request);
    buf.extend_from_slice(&timestamp_ms.to_le_bytes());
    buf.push(region.len() as u8);
    buf.extend_from_slice(region.as_bytes());
    buf
}

/// Parses a responder reply, given the length of the request that produced it.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedPayload`] if the header is wrong or a
/// field runs past the end of the datagram.
pub fn decode_response(reply: &[u8], request_len: usize) -> Result<LivenessResponse, ProtocolError> {
    let header_len = RESPONSE_HEADER.len();
    if reply.len() < header_len || reply[..header_len] != RESPONSE_HEADER {
        return Err(ProtocolError::MalformedPayload(
            "liveness reply does not start with the response header".to_string(),
        ));
    }

    let ts_off = header_len + request_len;
    let region_len_off = ts_off + TIMESTAMP_SIZE;
    if reply.len() < region_len_off + 1 {
        return Err(ProtocolError::MalformedPayload(format!(
            "liveness reply of {} bytes is too short for a {request_len}-byte echo",
            reply.len()
        )));
    }

    let echoed = reply[header_len..ts_off].to_vec();
    let mut ts = [0u8; TIMESTAMP_SIZE];
    ts.copy_from_slice(&reply[ts_off..region_len_off]);
    let region_len = reply[region_len_off] as usize;
    let region_off = region_len_off + 1;
    let region_bytes = reply.get(region_off..region_off + region_len).ok_or_else(|| {
        ProtocolError::MalformedPayload(format!("region of length {region_len} exceeds reply"))
    })?;
    let region = std::str::from_utf8(region_bytes)
        .map_err(|e| ProtocolError::MalformedPayload(format!("invalid UTF-8 region: {e}")))?
        .to_string();

    Ok(LivenessResponse {
        echoed,
        timestamp_ms: u64::from_le_bytes(ts),
        region,
    })
}

fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
