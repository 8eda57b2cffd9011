//! Binary codec for Server-Manager frames.
//!
//! Wire format:
//! ```text
//! [length:2][command:2][payload:length-2]
//! ```
//! All multi-byte integers are little-endian.  `length` is the byte count of
//! command + payload, so the smallest valid frame is four bytes long.
//!
//! The codec is split in two layers:
//!
//! - [`encode_frame`] / [`decode_frame`] deal only with the length prefix and
//!   command code, which is all a stream reader needs to find frame
//!   boundaries.
//! - [`encode_message`] / [`decode_message`] map a frame to and from a typed
//!   [`ServerManagerMessage`], following the per-command payload layout.
//!
//! A replay status link runs to the end of the frame, so an empty link and
//! no link encode to the same bytes; both decode as `None`.
//! [`ReplayStatusUpdate::new`] normalizes to that form.

use thiserror::Error;

use crate::protocol::messages::{
    CommandCode, HandshakeRequest, ReplayRequest, ReplayStatusUpdate, ReplayUploadStatus,
    RunningFlag, ServerManagerMessage, ServerStatusMessage, COMMAND_SIZE, LENGTH_PREFIX_SIZE,
    MAX_PREFIXED_STRING_LEN,
};

/// Errors that can occur during frame encoding or decoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The buffer does not yet hold a complete frame.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The command code is not one this codec understands.
    #[error("unknown command: 0x{0:04X}")]
    UnknownCommand(u16),

    /// The payload could not be parsed, or a field cannot be encoded.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The encoded body would not fit the 16-bit length prefix.
    #[error("frame too large: {0} bytes exceeds the 65535-byte limit")]
    FrameTooLarge(usize),
}

/// One undecoded frame: the command code plus its raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: u16,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(command: CommandCode, payload: Vec<u8>) -> Self {
        Self {
            command: command as u16,
            payload,
        }
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Frames `payload` under `command`, prefixing the little-endian body length.
///
/// # Errors
///
/// Returns [`ProtocolError::FrameTooLarge`] if command + payload exceed
/// `u16::MAX` bytes.
///
/// # Examples
///
/// ```rust
/// use gsm_core::protocol::codec::{decode_frame, encode_frame};
///
/// let bytes = encode_frame(0x2A00, &[]).unwrap();
/// assert_eq!(bytes, vec![0x02, 0x00, 0x00, 0x2A]);
/// let (frame, consumed) = decode_frame(&bytes).unwrap();
/// assert_eq!(frame.command, 0x2A00);
/// assert_eq!(consumed, 4);
/// ```
pub fn encode_frame(command: u16, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let body_len = COMMAND_SIZE + payload.len();
    let length = u16::try_from(body_len).map_err(|_| ProtocolError::FrameTooLarge(body_len))?;

    let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + body_len);
    buf.extend_from_slice(&length.to_le_bytes());
    buf.extend_from_slice(&command.to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Encodes a typed message into a complete frame.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedPayload`] if a length-prefixed string is
/// longer than 255 bytes, or [`ProtocolError::FrameTooLarge`] if the frame
/// overflows the length prefix.
pub fn encode_message(msg: &ServerManagerMessage) -> Result<Vec<u8>, ProtocolError> {
    let payload = encode_payload(msg)?;
    encode_frame(msg.command() as u16, &payload)
}

/// Decodes one frame from the beginning of `bytes`.
///
/// Returns the frame and the total number of bytes consumed (prefix + body),
/// so a stream reader can drain its buffer.
///
/// # Errors
///
/// Returns [`ProtocolError::InsufficientData`] while the buffer holds less
/// than one full frame, and [`ProtocolError::MalformedPayload`] if the length
/// prefix is too small to hold a command code.
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame, usize), ProtocolError> {
    if bytes.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::InsufficientData {
            needed: LENGTH_PREFIX_SIZE,
            available: bytes.len(),
        });
    }

    let length = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
    if length < COMMAND_SIZE {
        return Err(ProtocolError::MalformedPayload(format!(
            "frame length {length} cannot hold a command code"
        )));
    }

    let total = LENGTH_PREFIX_SIZE + length;
    if bytes.len() < total {
        return Err(ProtocolError::InsufficientData {
            needed: total,
            available: bytes.len(),
        });
    }

    let command = u16::from_le_bytes([bytes[2], bytes[3]]);
    let payload = bytes[LENGTH_PREFIX_SIZE + COMMAND_SIZE..total].to_vec();
    Ok((Frame { command, payload }, total))
}

/// Interprets a frame's payload according to its command code.
///
/// # Errors
///
/// Returns [`ProtocolError::UnknownCommand`] for codes outside
/// [`CommandCode`], and [`ProtocolError::MalformedPayload`] if the payload
/// does not match the command's layout.
pub fn decode_message(frame: &Frame) -> Result<ServerManagerMessage, ProtocolError> {
    let command =
        CommandCode::try_from(frame.command).map_err(ProtocolError::UnknownCommand)?;
    let p = frame.payload.as_slice();

    match command {
        CommandCode::Handshake => decode_handshake(p).map(ServerManagerMessage::Handshake),
        CommandCode::HandshakeAccepted => Ok(ServerManagerMessage::HandshakeAccepted(p.to_vec())),
        CommandCode::HandshakeRejected => Ok(ServerManagerMessage::HandshakeRejected {
            reason: read_trailing_string(p, 0)?,
        }),
        CommandCode::ServerStatus => decode_server_status(p).map(ServerManagerMessage::ServerStatus),
        CommandCode::ReplayStatus => decode_replay_status(p).map(ServerManagerMessage::ReplayStatus),
        CommandCode::ReplayRequest => {
            decode_replay_request(p).map(ServerManagerMessage::ReplayRequest)
        }
        CommandCode::ShutdownNotice => Ok(ServerManagerMessage::ShutdownNotice),
        CommandCode::Ping => Ok(ServerManagerMessage::Ping),
        CommandCode::Termination => Ok(ServerManagerMessage::Termination),
    }
}

// ── Payload encoding ──────────────────────────────────────────────────────────

fn encode_payload(msg: &ServerManagerMessage) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::new();
    match msg {
        ServerManagerMessage::Handshake(m) => encode_handshake(&mut buf, m)?,
        ServerManagerMessage::HandshakeAccepted(opaque) => buf.extend_from_slice(opaque),
        ServerManagerMessage::HandshakeRejected { reason } => buf.extend_from_slice(reason.as_bytes()),
        ServerManagerMessage::ServerStatus(m) => encode_server_status(&mut buf, m)?,
        ServerManagerMessage::ReplayStatus(m) => encode_replay_status(&mut buf, m),
        ServerManagerMessage::ReplayRequest(m) => encode_replay_request(&mut buf, m),
        ServerManagerMessage::ShutdownNotice
        | ServerManagerMessage::Ping
        | ServerManagerMessage::Termination => {} // empty payload
    }
    Ok(buf)
}

fn encode_handshake(buf: &mut Vec<u8>, m: &HandshakeRequest) -> Result<(), ProtocolError> {
    buf.extend_from_slice(&m.server_id.to_le_bytes());
    write_prefixed_string(buf, &m.session_id, "Handshake.session_id")?;
    buf.extend_from_slice(&m.protocol_version.to_le_bytes());
    Ok(())
}

fn encode_server_status(buf: &mut Vec<u8>, m: &ServerStatusMessage) -> Result<(), ProtocolError> {
    buf.extend_from_slice(&m.server_id.to_le_bytes());
    write_prefixed_string(buf, &m.username, "ServerStatus.username")?;
    write_prefixed_string(buf, &m.region, "ServerStatus.region")?;
    write_prefixed_string(buf, &m.server_name, "ServerStatus.server_name")?;
    write_prefixed_string(buf, &m.version, "ServerStatus.version")?;
    write_prefixed_string(buf, &m.ip, "ServerStatus.ip")?;
    buf.extend_from_slice(&m.udp_ping_port.to_le_bytes());
    buf.push(m.running as u8);
    Ok(())
}

fn encode_replay_status(buf: &mut Vec<u8>, m: &ReplayStatusUpdate) {
    buf.extend_from_slice(&m.match_id.to_le_bytes());
    buf.extend_from_slice(&m.account_id.to_le_bytes());
    buf.push(m.status as u8);
    if m.status.carries_download_link() {
        if let Some(link) = &m.download_link {
            buf.extend_from_slice(link.as_bytes());
        }
    }
}

fn encode_replay_request(buf: &mut Vec<u8>, m: &ReplayRequest) {
    buf.extend_from_slice(&m.match_id.to_le_bytes());
    buf.extend_from_slice(&m.account_id.to_le_bytes());
    buf.extend_from_slice(m.extension.as_bytes());
}

// ── Payload decoding ──────────────────────────────────────────────────────────

fn decode_handshake(p: &[u8]) -> Result<HandshakeRequest, ProtocolError> {
    // 4 (server_id) + 1 (len) + session + 4 (version) >= 9
    require_len(p, 9, "Handshake")?;
    let server_id = read_i32(p, 0)?;
    let (session_id, end) = read_prefixed_string(p, 4)?;
    let protocol_version = read_u32(p, end)?;
    Ok(HandshakeRequest {
        server_id,
        session_id,
        protocol_version,
    })
}

fn decode_server_status(p: &[u8]) -> Result<ServerStatusMessage, ProtocolError> {
    // 4 (server_id) + 5 × 1 (string lengths) + 2 (port) + 1 (flag) >= 12
    require_len(p, 12, "ServerStatus")?;
    let server_id = read_i32(p, 0)?;
    let (username, off) = read_prefixed_string(p, 4)?;
    let (region, off) = read_prefixed_string(p, off)?;
    let (server_name, off) = read_prefixed_string(p, off)?;
    let (version, off) = read_prefixed_string(p, off)?;
    let (ip, off) = read_prefixed_string(p, off)?;
    require_len(p, off + 3, "ServerStatus.trailer")?;
    let udp_ping_port = u16::from_le_bytes([p[off], p[off + 1]]);
    let running = RunningFlag::try_from(p[off + 2])
        .map_err(|v| ProtocolError::MalformedPayload(format!("unknown running flag: {v}")))?;
    Ok(ServerStatusMessage {
        server_id,
        username,
        region,
        server_name,
        version,
        ip,
        udp_ping_port,
        running,
    })
}

fn decode_replay_status(p: &[u8]) -> Result<ReplayStatusUpdate, ProtocolError> {
    // 4 (match) + 4 (account) + 1 (status)
    require_len(p, 9, "ReplayStatus")?;
    let match_id = read_i32(p, 0)?;
    let account_id = read_i32(p, 4)?;
    let status = ReplayUploadStatus::try_from(p[8]).map_err(|v| {
        ProtocolError::MalformedPayload(format!("unknown replay upload status: 0x{v:02X}"))
    })?;
    let download_link = if status.carries_download_link() && p.len() > 9 {
        Some(read_trailing_string(p, 9)?)
    } else {
        None
    };
    Ok(ReplayStatusUpdate {
        match_id,
        account_id,
        status,
        download_link,
    })
}

fn decode_replay_request(p: &[u8]) -> Result<ReplayRequest, ProtocolError> {
    require_len(p, 8, "ReplayRequest")?;
    Ok(ReplayRequest {
        match_id: read_i32(p, 0)?,
        account_id: read_i32(p, 4)?,
        extension: read_trailing_string(p, 8)?,
    })
}

// ── Utility helpers ───────────────────────────────────────────────────────────

fn require_len(buf: &[u8], needed: usize, context: &str) -> Result<(), ProtocolError> {
    if buf.len() < needed {
        Err(ProtocolError::MalformedPayload(format!(
            "{context}: need {needed} bytes, got {}",
            buf.len()
        )))
    } else {
        Ok(())
    }
}

fn read_i32(buf: &[u8], offset: usize) -> Result<i32, ProtocolError> {
    require_len(buf, offset + 4, "i32 field")?;
    Ok(i32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ]))
}

fn read_u32(buf: &[u8], offset: usize) -> Result<u32, ProtocolError> {
    require_len(buf, offset + 4, "u32 field")?;
    Ok(u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ]))
}

/// Writes a one-byte length prefix followed by the UTF-8 string bytes.
fn write_prefixed_string(buf: &mut Vec<u8>, s: &str, field: &str) -> Result<(), ProtocolError> {
    let bytes = s.as_bytes();
    if bytes.len() > MAX_PREFIXED_STRING_LEN {
        return Err(ProtocolError::MalformedPayload(format!(
            "{field}: {} bytes exceeds the {MAX_PREFIXED_STRING_LEN}-byte string limit",
            bytes.len()
        )));
    }
    buf.push(bytes.len() as u8);
    buf.extend_from_slice(bytes);
    Ok(())
}

/// Reads a one-byte length prefix and then that many UTF-8 bytes.
/// Returns the string and the offset of the byte after it.
fn read_prefixed_string(buf: &[u8], offset: usize) -> Result<(String, usize), ProtocolError> {
    if buf.len() < offset + 1 {
        return Err(ProtocolError::MalformedPayload(format!(
            "need 1 byte for string length at offset {offset}"
        )));
    }
    let len = buf[offset] as usize;
    let start = offset + 1;
    if buf.len() < start + len {
        return Err(ProtocolError::MalformedPayload(format!(
            "string of length {len} at offset {start} exceeds buffer"
        )));
    }
    Ok((utf8(&buf[start..start + len])?, start + len))
}

/// Reads everything from `offset` to the end of the payload as UTF-8.
fn read_trailing_string(buf: &[u8], offset: usize) -> Result<String, ProtocolError> {
    utf8(buf.get(offset..).unwrap_or_default())
}

fn utf8(bytes: &[u8]) -> Result<String, ProtocolError> {
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|e| ProtocolError::MalformedPayload(format!("invalid UTF-8: {e}")))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
