//! # gsm-core
//!
//! Shared library for the game-server fleet agent.
//!
//! - **`protocol`** – the Server-Manager frame codec (`[length:2][command:2][payload]`,
//!   little-endian) and the UDP liveness wire format.
//! - **`domain`** – the link state machine, announced server identity,
//!   liveness port derivation and per-port health bookkeeping.
//!
//! The crate has no runtime or socket dependencies; `gsm-agent` drives it.

pub mod domain;
pub mod protocol;

pub use domain::health::{HealthPolicy, HealthRecord, HealthTransition, RestartPolicy, ServerHealth};
pub use domain::identity::ServerIdentity;
pub use domain::link_state::{KeepaliveTransition, LinkPhase, LinkSession, LinkStateError};
pub use domain::ports::{liveness_port, PROXY_PORT_OFFSET};
pub use protocol::codec::{decode_frame, decode_message, encode_frame, encode_message, Frame, ProtocolError};
pub use protocol::messages::ServerManagerMessage;
