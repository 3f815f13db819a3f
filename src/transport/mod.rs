//! The `transport` module is responsible for handling network communication
//! with clients via WebSockets.
//!
//! It defines the frames exchanged between clients and the server, the codec
//! that turns them into WebSocket messages, and the server itself, which
//! drives the broker on behalf of each connected socket.

pub mod codec;
pub mod message;
pub mod websocket;

pub use codec::{FrameCodec, JsonCodec};
pub use message::{ClientMessage, PayloadEncoding, ServerMessage};
pub use websocket::{TransportOptions, bind, start_websocket_server};
