//! Signaling transport.
//!
//! WebSocket endpoint that turns each socket into a hub connection: text
//! frames go to the `HubActor` in arrival order, encoded replies come back
//! through the connection's outbound channel.

pub mod websocket;

pub use websocket::{handle_socket, signaling_router, SignalingState};
