//! TOML-based configuration for the agent.
//!
//! ```toml
//! [agent]
//! log_level = "info"
//!
//! [chat]
//! host = "chat.example.net"
//! port = 11031
//!
//! [identity]
//! server_id = 1201
//! username = "eu-host-01"
//! region = "EU"
//! server_name = "Frankfurt 3"
//!
//! [liveness]
//! game_ports = [11235, 11236]
//! monitored_ports = [11335, 11336]
//! restart_policy = "once-per-episode"
//! ```
//!
//! Every field has a serde default, so a partial file (or no file at all)
//! yields a usable configuration.  [`AgentConfig::validate`] rejects values
//! the runtime cannot work with.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use gsm_core::protocol::messages::PROTOCOL_VERSION;
use gsm_core::{liveness_port, HealthPolicy, RestartPolicy, ServerIdentity};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::infrastructure::network::{LinkConfig, ProberConfig};

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level agent configuration stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AgentConfig {
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub liveness: LivenessConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSection {
    /// `tracing` filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Chat-service link settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatConfig {
    #[serde(default = "default_chat_host")]
    pub host: String,
    #[serde(default = "default_chat_port")]
    pub port: u16,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_io_timeout_secs")]
    pub io_timeout_secs: u64,
    #[serde(default = "default_reconnect_interval_secs")]
    pub reconnect_interval_secs: u64,
    #[serde(default = "default_keepalive_failure_limit")]
    pub keepalive_failure_limit: u32,
}

/// What the agent announces about its game server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdentityConfig {
    #[serde(default)]
    pub server_id: i32,
    /// Empty means "generate one at start-up".
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub server_name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_ip")]
    pub ip: String,
}

/// UDP responder and prober settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LivenessConfig {
    /// Game ports of the managed servers; each gets a responder on its
    /// derived liveness port.
    #[serde(default)]
    pub game_ports: Vec<u16>,
    /// UDP ports of the game processes themselves, polled for health.  Each
    /// must answer `0x01` with `0x02`, which the agent's own responders do
    /// not, so none of these may be a derived liveness port.
    #[serde(default)]
    pub monitored_ports: Vec<u16>,
    #[serde(default)]
    pub proxy_enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Host the prober pings.
    #[serde(default = "default_probe_host")]
    pub probe_host: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_log_level() -> String {
    "info".to_string()
}
fn default_chat_host() -> String {
    "127.0.0.1".to_string()
}
fn default_chat_port() -> u16 {
    11031
}
fn default_protocol_version() -> u32 {
    PROTOCOL_VERSION
}
fn default_keepalive_interval_secs() -> u64 {
    15
}
fn default_io_timeout_secs() -> u64 {
    30
}
fn default_reconnect_interval_secs() -> u64 {
    5
}
fn default_keepalive_failure_limit() -> u32 {
    3
}
fn default_version() -> String {
    "0.0.0".to_string()
}
fn default_ip() -> String {
    "127.0.0.1".to_string()
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_probe_host() -> String {
    "127.0.0.1".to_string()
}
fn default_poll_interval_secs() -> u64 {
    30
}
fn default_probe_timeout_secs() -> u64 {
    5
}
fn default_failure_threshold() -> u32 {
    gsm_core::domain::health::DEFAULT_FAILURE_THRESHOLD
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            host: default_chat_host(),
            port: default_chat_port(),
            protocol_version: default_protocol_version(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            io_timeout_secs: default_io_timeout_secs(),
            reconnect_interval_secs: default_reconnect_interval_secs(),
            keepalive_failure_limit: default_keepalive_failure_limit(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            server_id: 0,
            session_id: String::new(),
            username: String::new(),
            region: String::new(),
            server_name: String::new(),
            version: default_version(),
            ip: default_ip(),
        }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            game_ports: Vec::new(),
            monitored_ports: Vec::new(),
            proxy_enabled: false,
            bind_address: default_bind_address(),
            probe_host: default_probe_host(),
            poll_interval_secs: default_poll_interval_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            failure_threshold: default_failure_threshold(),
            restart_policy: RestartPolicy::default(),
        }
    }
}

// ── Derived runtime settings ──────────────────────────────────────────────────

impl AgentConfig {
    /// Checks every value the runtime depends on.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.chat.host.trim().is_empty() {
            return invalid("chat.host must not be empty".to_string());
        }
        for (name, value) in [
            ("chat.keepalive_interval_secs", self.chat.keepalive_interval_secs),
            ("chat.io_timeout_secs", self.chat.io_timeout_secs),
            ("chat.reconnect_interval_secs", self.chat.reconnect_interval_secs),
            ("liveness.poll_interval_secs", self.liveness.poll_interval_secs),
            ("liveness.probe_timeout_secs", self.liveness.probe_timeout_secs),
        ] {
            if value == 0 {
                return invalid(format!("{name} must be greater than zero"));
            }
        }
        if self.chat.keepalive_failure_limit == 0 {
            return invalid("chat.keepalive_failure_limit must be greater than zero".to_string());
        }
        if self.liveness.failure_threshold == 0 {
            return invalid("liveness.failure_threshold must be greater than zero".to_string());
        }
        self.bind_ip()?;
        self.probe_ip()?;
        for &port in &self.liveness.game_ports {
            if liveness_port(port, self.liveness.proxy_enabled).is_none() {
                return invalid(format!(
                    "game port {port} has no valid liveness port (proxy_enabled = {})",
                    self.liveness.proxy_enabled
                ));
            }
        }
        let responders = self.liveness_ports();
        if let Some(port) = self
            .liveness
            .monitored_ports
            .iter()
            .find(|p| responders.contains(p))
        {
            return invalid(format!(
                "liveness.monitored_ports contains {port}, which is an agent liveness port"
            ));
        }
        Ok(())
    }

    /// Liveness ports derived from `game_ports`, skipping any without one.
    pub fn liveness_ports(&self) -> Vec<u16> {
        self.liveness
            .game_ports
            .iter()
            .filter_map(|&p| liveness_port(p, self.liveness.proxy_enabled))
            .collect()
    }

    /// Game-side ports the prober polls.  Never includes a port the agent
    /// itself answers on.
    pub fn monitored_ports(&self) -> Vec<u16> {
        let responders = self.liveness_ports();
        self.liveness
            .monitored_ports
            .iter()
            .copied()
            .filter(|p| !responders.contains(p))
            .collect()
    }

    pub fn bind_ip(&self) -> Result<IpAddr, ConfigError> {
        parse_ip("liveness.bind_address", &self.liveness.bind_address)
    }

    pub fn probe_ip(&self) -> Result<IpAddr, ConfigError> {
        parse_ip("liveness.probe_host", &self.liveness.probe_host)
    }

    pub fn link_config(&self) -> LinkConfig {
        let io_timeout = Duration::from_secs(self.chat.io_timeout_secs);
        LinkConfig {
            connect_timeout: io_timeout,
            io_timeout,
            keepalive_interval: Duration::from_secs(self.chat.keepalive_interval_secs),
            keepalive_failure_limit: self.chat.keepalive_failure_limit,
            protocol_version: self.chat.protocol_version,
        }
    }

    pub fn prober_config(&self) -> ProberConfig {
        ProberConfig {
            poll_interval: Duration::from_secs(self.liveness.poll_interval_secs),
            probe_timeout: Duration::from_secs(self.liveness.probe_timeout_secs),
            policy: HealthPolicy {
                failure_threshold: self.liveness.failure_threshold,
                restart_policy: self.liveness.restart_policy,
            },
        }
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.chat.reconnect_interval_secs)
    }

    /// Identity announced in status updates.  `udp_ping_port` is the
    /// liveness port of the first game port, or 0 without one.
    pub fn server_identity(&self) -> ServerIdentity {
        ServerIdentity {
            username: self.identity.username.clone(),
            region: self.identity.region.clone(),
            server_name: self.identity.server_name.clone(),
            version: self.identity.version.clone(),
            ip: self.identity.ip.clone(),
            udp_ping_port: self.liveness_ports().first().copied().unwrap_or(0),
        }
    }
}

fn parse_ip(field: &str, value: &str) -> Result<IpAddr, ConfigError> {
    value
        .parse()
        .map_err(|e| ConfigError::Invalid(format!("{field} '{value}' is not an IP address: {e}")))
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Loads `AgentConfig` from `path`.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] if the file cannot be read and
/// [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_from(path: &Path) -> Result<AgentConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(toml::from_str(&content)?)
}

/// Loads `AgentConfig` from `path`, returning `AgentConfig::default()` if
/// the file does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_or_default(path: &Path) -> Result<AgentConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AgentConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Persists `config` to `path`, creating the parent directory if needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_to(path: &Path, config: &AgentConfig) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
