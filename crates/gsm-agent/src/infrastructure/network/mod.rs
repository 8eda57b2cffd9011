//! Network infrastructure for the agent.
//!
//! # Sub-modules
//!
//! - **`server_manager_link`** – The persistent TCP session with the chat
//!   service: handshake, status publication, keepalive and the receive loop.
//!
//! - **`framing`** – Cancel-safe frame reader and writer over any
//!   `AsyncRead`/`AsyncWrite`.
//!
//! - **`liveness_responder`** – Answers UDP liveness pings next to a game
//!   server.
//!
//! - **`liveness_prober`** – Polls every monitored port and reports health
//!   transitions.
//!
//! - **`task`** – A spawned loop paired with its cancellation signal.

pub mod framing;
pub mod liveness_prober;
pub mod liveness_responder;
pub mod server_manager_link;
pub mod task;

pub use liveness_prober::{LivenessProber, Pinger, ProbeError, ProberConfig, ProberEvent, UdpPinger};
pub use liveness_responder::{LivenessResponder, ResponderConfig, ResponderError};
pub use server_manager_link::{
    DisconnectReason, LinkConfig, LinkError, LinkEvent, ServerManagerLink,
};
