//! Identity announced by the Server-Manager in its status updates.
//!
//! The chat service expects two fields in a fixed textual shape: the
//! username ends with a colon and the server name ends with a `" 0"` marker.
//! Both normalizations are idempotent.

use crate::protocol::messages::{RunningFlag, ServerStatusMessage};

const USERNAME_SUFFIX: &str = ":";
const SERVER_NAME_SUFFIX: &str = " 0";

/// Everything the status update says about a managed game server apart from
/// its numeric id.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerIdentity {
    pub username: String,
    pub region: String,
    pub server_name: String,
    pub version: String,
    pub ip: String,
    pub udp_ping_port: u16,
}

impl ServerIdentity {
    /// Returns a copy with `username` and `server_name` normalized.
    pub fn normalized(&self) -> Self {
        Self {
            username: normalize_username(&self.username),
            server_name: normalize_server_name(&self.server_name),
            ..self.clone()
        }
    }

    /// Builds the wire status message for `server_id`.
    pub fn to_status(&self, server_id: i32, running: RunningFlag) -> ServerStatusMessage {
        ServerStatusMessage {
            server_id,
            username: self.username.clone(),
            region: self.region.clone(),
            server_name: self.server_name.clone(),
            version: self.version.clone(),
            ip: self.ip.clone(),
            udp_ping_port: self.udp_ping_port,
            running,
        }
    }
}

/// Appends a trailing `:` unless the username already ends with one.
pub fn normalize_username(username: &str) -> String {
    with_suffix(username, USERNAME_SUFFIX)
}

/// Appends a trailing `" 0"` unless the server name already ends with it.
pub fn normalize_server_name(server_name: &str) -> String {
    with_suffix(server_name, SERVER_NAME_SUFFIX)
}

fn with_suffix(value: &str, suffix: &str) -> String {
    if value.ends_with(suffix) {
        value.to_string()
    } else {
        format!("{value}{suffix}")
    }
}
