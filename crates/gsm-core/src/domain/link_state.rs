//! State machine of one Server-Manager link, free of any I/O.
//!
//! ```text
//! Disconnected ─begin_connect─▶ Connecting ─connected─▶ Connected{accepted: false}
//!      ▲                            │                         │ record_accept
//!      │                      connect_failed                  ▼
//!      └──────────── reset ◀──────────────────────── Connected{accepted: true}
//! ```
//!
//! The async link owns one `LinkSession` behind a mutex and asks it before
//! every side effect.  In particular, publishing a status is the transition
//! that arms the keepalive loop, so the rule "keepalive starts once, after the
//! first successful status send" is tested here rather than through sockets.

use thiserror::Error;

use crate::domain::identity::ServerIdentity;

/// Rejections raised by the state machine.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LinkStateError {
    #[error("link is not connected")]
    NotConnected,
    #[error("link is already connected or connecting")]
    AlreadyConnected,
}

/// Connection phase of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkPhase {
    #[default]
    Disconnected,
    Connecting,
    Connected {
        handshake_accepted: bool,
    },
}

/// What the caller must do with the keepalive loop after a status send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveTransition {
    Start,
    AlreadyRunning,
}

/// The last status the caller published, kept across reconnects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnouncedStatus {
    pub server_id: i32,
    pub identity: ServerIdentity,
}

/// Mutable state of one link.
#[derive(Debug, Default)]
pub struct LinkSession {
    phase: LinkPhase,
    server_id: Option<i32>,
    last_status: Option<AnnouncedStatus>,
    keepalive_active: bool,
}

impl LinkSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> LinkPhase {
        self.phase
    }

    pub fn server_id(&self) -> Option<i32> {
        self.server_id
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.phase, LinkPhase::Connected { .. })
    }

    pub fn is_handshake_accepted(&self) -> bool {
        matches!(
            self.phase,
            LinkPhase::Connected {
                handshake_accepted: true
            }
        )
    }

    pub fn last_status(&self) -> Option<&AnnouncedStatus> {
        self.last_status.as_ref()
    }

    pub fn keepalive_active(&self) -> bool {
        self.keepalive_active
    }

    /// `Disconnected → Connecting`.
    ///
    /// # Errors
    ///
    /// [`LinkStateError::AlreadyConnected`] from any other phase.
    pub fn begin_connect(&mut self) -> Result<(), LinkStateError> {
        match self.phase {
            LinkPhase::Disconnected => {
                self.phase = LinkPhase::Connecting;
                Ok(())
            }
            _ => Err(LinkStateError::AlreadyConnected),
        }
    }

    /// `Connecting → Disconnected` after a failed connect attempt.
    pub fn connect_failed(&mut self) {
        if self.phase == LinkPhase::Connecting {
            self.phase = LinkPhase::Disconnected;
        }
    }

    /// `Connecting → Connected{accepted: false}`.
    pub fn connected(&mut self) {
        self.phase = LinkPhase::Connected {
            handshake_accepted: false,
        };
    }

    /// Succeeds only while connected.
    ///
    /// # Errors
    ///
    /// [`LinkStateError::NotConnected`] in any other phase.
    pub fn require_connected(&self) -> Result<(), LinkStateError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(LinkStateError::NotConnected)
        }
    }

    /// Remembers the identity announced by the handshake.
    ///
    /// # Errors
    ///
    /// [`LinkStateError::NotConnected`] unless connected.
    pub fn record_handshake_sent(&mut self, server_id: i32) -> Result<(), LinkStateError> {
        self.require_connected()?;
        self.server_id = Some(server_id);
        Ok(())
    }

    /// Marks the handshake as accepted. Returns `true` only on the transition
    /// itself, so a duplicate accept does not re-fire the event.
    pub fn record_accept(&mut self) -> bool {
        match self.phase {
            LinkPhase::Connected {
                handshake_accepted: false,
            } => {
                self.phase = LinkPhase::Connected {
                    handshake_accepted: true,
                };
                true
            }
            _ => false,
        }
    }

    /// Caches the status about to be published so a reconnect can replay it.
    ///
    /// # Errors
    ///
    /// [`LinkStateError::NotConnected`] unless connected; nothing is cached then.
    pub fn cache_status(
        &mut self,
        server_id: i32,
        identity: ServerIdentity,
    ) -> Result<(), LinkStateError> {
        self.require_connected()?;
        self.last_status = Some(AnnouncedStatus {
            server_id,
            identity,
        });
        Ok(())
    }

    /// Called after a status frame was written successfully.
    pub fn status_published(&mut self) -> KeepaliveTransition {
        if self.keepalive_active || !self.is_connected() {
            KeepaliveTransition::AlreadyRunning
        } else {
            self.keepalive_active = true;
            KeepaliveTransition::Start
        }
    }

    /// Called when the keepalive loop exits on its own.
    pub fn keepalive_stopped(&mut self) {
        self.keepalive_active = false;
    }

    /// Returns to `Disconnected`, forgetting the session but keeping the last
    /// announced status for replay.
    pub fn reset(&mut self) {
        self.phase = LinkPhase::Disconnected;
        self.server_id = None;
        self.keepalive_active = false;
    }
}
