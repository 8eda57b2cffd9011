//! Domain types for the Server-Manager agent.
//!
//! Nothing in here touches a socket or a clock source the caller did not
//! pass in, so the link and health rules can be tested without I/O.

pub mod health;
pub mod identity;
pub mod link_state;

/// Liveness port derivation.
pub mod ports;
