//! Frame encoding between WebSocket messages and protocol frames.

use tungstenite::protocol::Message as WsMessage;

use crate::transport::message::{ClientMessage, ServerMessage};
use crate::utils::error::TransportError;

/// Converts protocol frames to and from WebSocket payloads.
pub trait FrameCodec: Send + Sync {
    fn decode(&self, data: &[u8]) -> Result<ClientMessage, TransportError>;

    fn encode(&self, message: &ServerMessage) -> Result<WsMessage, TransportError>;
}

/// JSON text frames tagged by `"type"`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl FrameCodec for JsonCodec {
    fn decode(&self, data: &[u8]) -> Result<ClientMessage, TransportError> {
        Ok(serde_json::from_slice(data)?)
    }

    fn encode(&self, message: &ServerMessage) -> Result<WsMessage, TransportError> {
        let text = serde_json::to_string(message)?;
        Ok(WsMessage::Text(text.into()))
    }
}
