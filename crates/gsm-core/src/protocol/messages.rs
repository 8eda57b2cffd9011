//! Message types for the Server-Manager ↔ chat-service protocol.
//!
//! Every message travels inside one [`Frame`](crate::protocol::codec::Frame):
//!
//! ```text
//! [length:2 LE][command:2 LE][payload:length-2]
//! ```
//!
//! `length` counts the command and payload bytes but not itself.
//!
//! # Command codes
//!
//! | Direction | Message            | Code     |
//! |-----------|--------------------|----------|
//! | out       | Handshake          | `0x1600` |
//! | out       | Server status      | `0x1602` |
//! | out       | Replay status      | `0x1603` |
//! | in        | Handshake accepted | `0x1700` |
//! | in        | Handshake rejected | `0x1701` |
//! | in        | Replay request     | `0x1704` |
//! | in        | Shutdown notice    | `0x1705` |
//! | both      | Ping               | `0x2A00` |
//! | out       | Termination        | `0x0003` |
//!
//! # String fields
//!
//! A string that is followed by another field carries a one-byte length
//! prefix.  The last string of a message (`download_link`, reject reason,
//! replay file extension) runs to the end of the frame instead.

/// Protocol version announced in the handshake.
pub const PROTOCOL_VERSION: u32 = 70;

/// Size of the little-endian length prefix in front of every frame.
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// Size of the command code at the start of every frame body.
pub const COMMAND_SIZE: usize = 2;

/// Largest string a one-byte length prefix can describe.
pub const MAX_PREFIXED_STRING_LEN: usize = u8::MAX as usize;

// ── Command codes ─────────────────────────────────────────────────────────────

/// Two-byte command codes carried at the start of every frame body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CommandCode {
    Termination = 0x0003,
    Handshake = 0x1600,
    ServerStatus = 0x1602,
    ReplayStatus = 0x1603,
    HandshakeAccepted = 0x1700,
    HandshakeRejected = 0x1701,
    ReplayRequest = 0x1704,
    ShutdownNotice = 0x1705,
    Ping = 0x2A00,
}

impl TryFrom<u16> for CommandCode {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0003 => Ok(Self::Termination),
            0x1600 => Ok(Self::Handshake),
            0x1602 => Ok(Self::ServerStatus),
            0x1603 => Ok(Self::ReplayStatus),
            0x1700 => Ok(Self::HandshakeAccepted),
            0x1701 => Ok(Self::HandshakeRejected),
            0x1704 => Ok(Self::ReplayRequest),
            0x1705 => Ok(Self::ShutdownNotice),
            0x2A00 => Ok(Self::Ping),
            other => Err(other),
        }
    }
}

// ── Enumerations carried in payloads ──────────────────────────────────────────

/// Upload state of a match replay, reported with [`ReplayStatusUpdate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReplayUploadStatus {
    NotFound = 0x01,
    AlreadyUploaded = 0x02,
    InQueue = 0x03,
    Uploading = 0x04,
    HaveReplay = 0x05,
    UploadingNow = 0x06,
    UploadComplete = 0x07,
}

impl ReplayUploadStatus {
    /// Whether a frame with this status carries a download link.
    pub fn carries_download_link(self) -> bool {
        matches!(self, Self::UploadComplete | Self::AlreadyUploaded)
    }
}

impl TryFrom<u8> for ReplayUploadStatus {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::NotFound),
            0x02 => Ok(Self::AlreadyUploaded),
            0x03 => Ok(Self::InQueue),
            0x04 => Ok(Self::Uploading),
            0x05 => Ok(Self::HaveReplay),
            0x06 => Ok(Self::UploadingNow),
            0x07 => Ok(Self::UploadComplete),
            other => Err(other),
        }
    }
}

/// Trailing flag of the status update: whether the manager is running or
/// on its way down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum RunningFlag {
    #[default]
    Running = 0,
    Stopping = 1,
}

impl TryFrom<u8> for RunningFlag {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Running),
            1 => Ok(Self::Stopping),
            other => Err(other),
        }
    }
}

// ── Payload structs ───────────────────────────────────────────────────────────

/// Identity handshake sent right after the TCP connection opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub server_id: i32,
    pub session_id: String,
    pub protocol_version: u32,
}

/// Presence publication for one managed game server.
///
/// `username` and `server_name` are sent exactly as given here; the link
/// normalizes them (see [`crate::domain::identity`]) before building this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStatusMessage {
    pub server_id: i32,
    pub username: String,
    pub region: String,
    pub server_name: String,
    pub version: String,
    pub ip: String,
    pub udp_ping_port: u16,
    pub running: RunningFlag,
}

/// Best-effort replay upload telemetry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayStatusUpdate {
    pub match_id: i32,
    pub account_id: i32,
    pub status: ReplayUploadStatus,
    /// Only encoded when [`ReplayUploadStatus::carries_download_link`] holds.
    /// Build with [`ReplayStatusUpdate::new`] so the value survives a
    /// round trip: the wire has no way to tell an empty link from none.
    pub download_link: Option<String>,
}

impl ReplayStatusUpdate {
    /// Drops the link when `status` does not carry one or when it is empty.
    pub fn new(
        match_id: i32,
        account_id: i32,
        status: ReplayUploadStatus,
        download_link: Option<&str>,
    ) -> Self {
        let download_link = download_link
            .filter(|link| status.carries_download_link() && !link.is_empty())
            .map(str::to_string);
        Self {
            match_id,
            account_id,
            status,
            download_link,
        }
    }
}

/// A request from the chat service for a match replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayRequest {
    pub match_id: i32,
    pub account_id: i32,
    /// Requested file extension, empty when the service did not name one.
    pub extension: String,
}

// ── Top-level message enum ────────────────────────────────────────────────────

/// Every message understood on the Server-Manager link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerManagerMessage {
    Handshake(HandshakeRequest),
    /// Accept payload is opaque; it is kept verbatim.
    HandshakeAccepted(Vec<u8>),
    HandshakeRejected { reason: String },
    ServerStatus(ServerStatusMessage),
    ReplayStatus(ReplayStatusUpdate),
    ReplayRequest(ReplayRequest),
    ShutdownNotice,
    Ping,
    Termination,
}

impl ServerManagerMessage {
    /// Returns the command code this message is framed with.
    pub fn command(&self) -> CommandCode {
        match self {
            Self::Handshake(_) => CommandCode::Handshake,
            Self::HandshakeAccepted(_) => CommandCode::HandshakeAccepted,
            Self::HandshakeRejected { .. } => CommandCode::HandshakeRejected,
            Self::ServerStatus(_) => CommandCode::ServerStatus,
            Self::ReplayStatus(_) => CommandCode::ReplayStatus,
            Self::ReplayRequest(_) => CommandCode::ReplayRequest,
            Self::ShutdownNotice => CommandCode::ShutdownNotice,
            Self::Ping => CommandCode::Ping,
            Self::Termination => CommandCode::Termination,
        }
    }
}
