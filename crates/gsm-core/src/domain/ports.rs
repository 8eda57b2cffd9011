//! Port arithmetic for liveness responders.

/// Offset added to the liveness port when the game server sits behind the
/// local proxy layer.
pub const PROXY_PORT_OFFSET: u16 = 10_000;

/// Derives the UDP liveness port for a game server listening on `game_port`.
///
/// The responder binds one below the game port, shifted by
/// [`PROXY_PORT_OFFSET`] when `proxy_enabled`.  Returns `None` when the
/// result would fall outside `1..=65535`.
///
/// ```rust
/// use gsm_core::domain::ports::liveness_port;
///
/// assert_eq!(liveness_port(11235, false), Some(11234));
/// assert_eq!(liveness_port(11235, true), Some(21234));
/// ```
pub fn liveness_port(game_port: u16, proxy_enabled: bool) -> Option<u16> {
    let base = game_port.checked_sub(1).filter(|p| *p > 0)?;
    if proxy_enabled {
        base.checked_add(PROXY_PORT_OFFSET)
    } else {
        Some(base)
    }
}
