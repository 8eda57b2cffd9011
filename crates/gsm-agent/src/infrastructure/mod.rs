//! Infrastructure layer for the agent.
//!
//! Contains the OS-facing adapters: the TCP chat link, the UDP liveness
//! sockets, and TOML configuration storage.
//!
//! **Dependency rule**: this layer may depend on `gsm_core`, but MUST NOT be
//! imported by the domain types in `gsm_core`.

pub mod network;
pub mod storage;
