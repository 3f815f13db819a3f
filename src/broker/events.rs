//! Broker events
//!
//! The broker reports what happens to it through an `EventSink`. Sinks must
//! not block: the broker calls `emit` inline on its hot paths.

use std::net::SocketAddr;

use tokio::sync::mpsc;

use crate::broker::message::QoS;
use crate::utils::error::DisconnectReason;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    ConnectionOpened {
        client_id: String,
        endpoint: Option<SocketAddr>,
    },
    ConnectionClosed {
        client_id: String,
        reason: DisconnectReason,
    },
    SubscriptionCreated {
        client_id: String,
        filter: String,
        qos: QoS,
    },
    /// Emitted once per accepted publish, not once per delivery.
    /// `sequence` counts publishes since broker start, starting at 1.
    MessagePublished {
        client_id: String,
        topic: String,
        qos: QoS,
        retain: bool,
        sequence: u64,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: BrokerEvent);
}

impl<F> EventSink for F
where
    F: Fn(BrokerEvent) + Send + Sync,
{
    fn emit(&self, event: BrokerEvent) {
        self(event)
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: BrokerEvent) {}
}

/// Forwards events into an unbounded channel. Events are dropped once the
/// receiver is gone.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<BrokerEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BrokerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: BrokerEvent) {
        let _ = self.tx.send(event);
    }
}
