//! Game-server fleet agent entry point.
//!
//! Runs next to a group of game servers and:
//!
//! - answers UDP liveness pings for each of them,
//! - polls the game processes' own UDP ports and recommends restarts for
//!   servers that stop answering,
//! - keeps an authenticated session with the chat service and publishes the
//!   host's status on it.
//!
//! # Usage
//!
//! ```text
//! gsm-agent [OPTIONS]
//!
//! Options:
//!   --config    <PATH>   TOML config file [default: gsm-agent.toml]
//!   --chat-host <HOST>   Overrides [chat] host
//!   --chat-port <PORT>   Overrides [chat] port
//!   --log-level <LEVEL>  Overrides [agent] log_level
//! ```
//!
//! `RUST_LOG`, when set, wins over both the config file and `--log-level`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gsm_agent::application::health_monitor::{HealthMonitor, LoggingRestartHandler};
use gsm_agent::application::link_supervisor::{LinkSupervisor, NoReplayStore, SupervisorConfig};
use gsm_agent::infrastructure::network::{
    LivenessProber, LivenessResponder, ResponderConfig, ServerManagerLink, UdpPinger,
};
use gsm_agent::infrastructure::storage::config::{load_or_default, AgentConfig};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Game-server fleet agent.
#[derive(Debug, Parser)]
#[command(
    name = "gsm-agent",
    about = "Chat-service link and UDP liveness agent for game-server hosts",
    version
)]
struct Cli {
    /// Path of the TOML configuration file.  A missing file means defaults.
    #[arg(long, default_value = "gsm-agent.toml", env = "GSM_CONFIG")]
    config: PathBuf,

    /// Chat-service host, overriding the config file.
    #[arg(long)]
    chat_host: Option<String>,

    /// Chat-service port, overriding the config file.
    #[arg(long)]
    chat_port: Option<u16>,

    /// Log filter used when `RUST_LOG` is not set.
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    /// Loads the config file and applies the command-line overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// merged configuration is invalid.
    fn into_agent_config(self) -> anyhow::Result<AgentConfig> {
        let loaded = load_or_default(&self.config)
            .with_context(|| format!("loading config from {}", self.config.display()))?;
        let config = self.apply_overrides(loaded);
        config.validate().context("invalid configuration")?;
        Ok(config)
    }

    fn apply_overrides(self, mut config: AgentConfig) -> AgentConfig {
        if let Some(host) = self.chat_host {
            config.chat.host = host;
        }
        if let Some(port) = self.chat_port {
            config.chat.port = port;
        }
        if let Some(level) = self.log_level {
            config.agent.log_level = level;
        }
        if config.identity.session_id.trim().is_empty() {
            config.identity.session_id = uuid::Uuid::new_v4().to_string();
        }
        config
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Cli::parse().into_agent_config()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(&config.agent.log_level))
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(
        "gsm-agent starting: server {} -> chat {}:{}",
        config.identity.server_id, config.chat.host, config.chat.port
    );

    // ── Liveness responders ───────────────────────────────────────────────────
    let bind_ip = config.bind_ip()?;
    let mut responders = Vec::new();
    for port in config.liveness_ports() {
        let responder_config = ResponderConfig {
            bind_ip,
            port,
            region: config.identity.region.clone(),
        };
        match LivenessResponder::bind(responder_config).await {
            Ok(responder) => responders.push(responder),
            Err(e) => error!("{e}; game server on liveness port {port} will look down"),
        }
    }

    // ── Liveness prober and health monitor ────────────────────────────────────
    let pinger = Arc::new(UdpPinger::new(config.probe_ip()?));
    let (prober, prober_events) = LivenessProber::new(config.prober_config(), pinger);
    for port in config.monitored_ports() {
        prober.add_server(port);
    }
    let monitor = HealthMonitor::start(prober_events, Arc::new(LoggingRestartHandler));
    prober.start().await;

    // ── Chat-service link ─────────────────────────────────────────────────────
    let (link, link_events) = ServerManagerLink::new(config.link_config());
    let supervisor = LinkSupervisor::start(
        link,
        link_events,
        SupervisorConfig {
            host: config.chat.host.clone(),
            port: config.chat.port,
            server_id: config.identity.server_id,
            session_id: config.identity.session_id.clone(),
            identity: config.server_identity(),
            reconnect_interval: config.reconnect_interval(),
        },
        Arc::new(NoReplayStore),
    );

    let listening: Vec<SocketAddr> = responders.iter().map(|r| r.local_addr()).collect();
    info!("gsm-agent running; liveness responders on {listening:?}");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    info!("received Ctrl+C; shutting down");

    supervisor.shutdown().await;
    prober.stop().await;
    monitor.stop().await;
    for responder in &responders {
        responder.stop().await;
    }

    info!("gsm-agent stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
