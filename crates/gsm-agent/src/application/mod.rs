//! Application layer use cases for the agent.
//!
//! Use cases here drive the network infrastructure and hand decisions that
//! belong to the host process (serving a replay, restarting a game server)
//! to traits, so the binary and the tests can plug in their own.
//!
//! # Sub-modules
//!
//! - **`link_supervisor`** – Keeps the chat-service link up: connects with a
//!   fixed retry interval, authenticates, publishes status, answers replay
//!   requests and reconnects after the peer drops the session.
//!
//! - **`health_monitor`** – Consumes liveness prober events and forwards
//!   restart recommendations to a [`health_monitor::RestartHandler`].

pub mod health_monitor;
pub mod link_supervisor;
