use base64::prelude::{BASE64_STANDARD, Engine};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::broker::message::{Delivery, QoS};
use crate::utils::error::DisconnectReason;

/// Frames a client sends to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Must be the first frame on a new socket. An empty `client_id` asks
    /// the broker to assign one.
    #[serde(rename = "connect")]
    Connect {
        #[serde(default)]
        client_id: String,
        username: String,
        password: String,
    },
    #[serde(rename = "subscribe")]
    Subscribe {
        filter: String,
        #[serde(default)]
        qos: QoS,
    },
    #[serde(rename = "unsubscribe")]
    Unsubscribe { filter: String },
    #[serde(rename = "publish")]
    Publish {
        topic: String,
        payload: String,
        #[serde(default, skip_serializing_if = "PayloadEncoding::is_utf8")]
        encoding: PayloadEncoding,
        #[serde(default)]
        qos: QoS,
        #[serde(default)]
        retain: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        packet_id: Option<u16>,
    },
    /// Acknowledges a QoS 1 or 2 delivery.
    #[serde(rename = "puback")]
    Puback { packet_id: u16 },
    /// Releases a QoS 2 publish id so it can be reused.
    #[serde(rename = "pubrel")]
    Pubrel { packet_id: u16 },
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "disconnect")]
    Disconnect,
}

/// Frames the broker sends to a client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// `code` is `"success"` or a refusal reason code. On success
    /// `client_id` carries the identifier the broker registered.
    #[serde(rename = "connack")]
    Connack {
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },
    /// `granted_qos` is `None` when the filter was refused.
    #[serde(rename = "suback")]
    Suback {
        filter: String,
        granted_qos: Option<QoS>,
    },
    #[serde(rename = "unsuback")]
    Unsuback { filter: String },
    #[serde(rename = "puback")]
    Puback { packet_id: u16 },
    #[serde(rename = "pubrec")]
    Pubrec { packet_id: u16 },
    #[serde(rename = "pubcomp")]
    Pubcomp { packet_id: u16 },
    #[serde(rename = "message")]
    Message {
        topic: String,
        payload: String,
        #[serde(default, skip_serializing_if = "PayloadEncoding::is_utf8")]
        encoding: PayloadEncoding,
        qos: QoS,
        retain: bool,
        dup: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        packet_id: Option<u16>,
    },
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(rename = "disconnect")]
    Disconnect { reason: DisconnectReason },
}

pub const CONNACK_SUCCESS: &str = "success";

/// How the `payload` string of a `publish` or `message` frame carries its
/// bytes. Payloads that are not valid UTF-8 travel as standard base64.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadEncoding {
    #[default]
    Utf8,
    Base64,
}

impl PayloadEncoding {
    pub fn is_utf8(&self) -> bool {
        matches!(self, PayloadEncoding::Utf8)
    }

    /// Text form of `payload`, as UTF-8 when possible.
    pub fn encode(payload: &[u8]) -> (String, PayloadEncoding) {
        match std::str::from_utf8(payload) {
            Ok(text) => (text.to_owned(), PayloadEncoding::Utf8),
            Err(_) => (BASE64_STANDARD.encode(payload), PayloadEncoding::Base64),
        }
    }

    pub fn decode(&self, payload: String) -> Result<Bytes, base64::DecodeError> {
        match self {
            PayloadEncoding::Utf8 => Ok(Bytes::from(payload)),
            PayloadEncoding::Base64 => BASE64_STANDARD.decode(payload).map(Bytes::from),
        }
    }
}

impl From<Delivery> for ServerMessage {
    fn from(delivery: Delivery) -> Self {
        let (payload, encoding) = PayloadEncoding::encode(&delivery.message.payload);
        ServerMessage::Message {
            payload,
            encoding,
            topic: delivery.message.topic,
            qos: delivery.qos,
            retain: delivery.message.retain,
            dup: delivery.dup,
            packet_id: delivery.packet_id,
        }
    }
}
