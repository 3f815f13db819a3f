//! Message definitions for the broker
//!
//! `Message` is the immutable unit a client publishes. `Delivery` is what
//! the broker pushes onto a subscriber's queue: the message plus the QoS it
//! is delivered at and the per-connection packet id used for acknowledgement.
//!
//! Notes on fields:
//! - `topic`: concrete topic used for routing (never contains wildcards)
//! - `payload`: opaque bytes
//! - `qos`: delivery guarantee requested by the publisher
//! - `retain`: whether the broker keeps this as the topic's retained message

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Delivery guarantee level.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    /// The lower of two levels; used when a subscription downgrades a publish.
    pub fn downgrade(self, cap: QoS) -> QoS {
        self.min(cap)
    }
}

impl TryFrom<u8> for QoS {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(format!("invalid qos level {other}")),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        qos as u8
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QoS::AtMostOnce => f.write_str("AtMostOnce"),
            QoS::AtLeastOnce => f.write_str("AtLeastOnce"),
            QoS::ExactlyOnce => f.write_str("ExactlyOnce"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

/// A message queued for one subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub message: Message,
    /// Effective QoS: the publish QoS capped by the subscription QoS.
    pub qos: QoS,
    /// Set only for QoS 1 and 2 deliveries.
    pub packet_id: Option<u16>,
    /// True when this is a re-send of an unacknowledged delivery.
    pub dup: bool,
    /// True when replayed from the retained store on subscribe.
    pub retained: bool,
    /// Milliseconds since the UNIX epoch when the broker queued it.
    pub timestamp: i64,
}

impl Delivery {
    pub fn new(message: Message, qos: QoS) -> Self {
        Self {
            message,
            qos,
            packet_id: None,
            dup: false,
            retained: false,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.message.topic
    }
}
