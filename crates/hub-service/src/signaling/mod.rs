//! Signaling wire protocol.

pub mod codec;
pub mod messages;

pub use codec::{decode, encode, FrameError};
pub use messages::{ClientRequest, InboundFrame, ServerMessage};
