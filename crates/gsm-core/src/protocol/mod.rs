//! Protocol module: Server-Manager message types, the frame codec, and the
//! UDP liveness wire format.

pub mod codec;
pub mod liveness;
pub mod messages;

pub use codec::{decode_frame, decode_message, encode_frame, encode_message, Frame, ProtocolError};
pub use messages::*;
