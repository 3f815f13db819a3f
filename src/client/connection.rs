//! Connection representation
//!
//! A `Connection` is the broker's side of one admitted client: its identity,
//! lifecycle state, and the bounded queue the broker pushes deliveries into.
//! The matching `ConnectionHandle` is returned to whoever drives the client
//! (the WebSocket session, or a test) and owns the receiving end.
//!
//! Lifecycle: `Connecting -> Authenticated -> Active -> Disconnected`.
//! `Disconnected` is terminal; a reconnecting client gets a new `Connection`.
//! Closing cancels the connection's token, which unblocks any publisher
//! waiting on a full queue and stops the handle from yielding more messages.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broker::message::{Delivery, QoS};
use crate::client::inflight::Inflight;
use crate::utils::error::{DeliveryError, DisconnectReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticated,
    Active,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid connection state transition from {from:?} to {to:?}")]
pub struct InvalidTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

#[derive(Debug)]
pub struct Connection {
    id: String,
    session_id: Uuid,
    endpoint: Option<SocketAddr>,
    state: Mutex<ConnectionState>,
    sender: mpsc::Sender<Delivery>,
    cancel: CancellationToken,
    close_reason: Arc<Mutex<Option<DisconnectReason>>>,
    inflight: Mutex<Inflight>,
    /// Serializes queueing so a retained replay cannot interleave with live
    /// deliveries.
    order: tokio::sync::Mutex<()>,
    connected_at: i64,
}

impl Connection {
    /// Create a connection in the `Connecting` state with a delivery queue of
    /// `capacity` messages.
    pub fn new(
        id: impl Into<String>,
        endpoint: Option<SocketAddr>,
        capacity: usize,
    ) -> (Self, ConnectionHandle) {
        let id = id.into();
        let session_id = Uuid::new_v4();
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let cancel = CancellationToken::new();
        let close_reason = Arc::new(Mutex::new(None));

        let handle = ConnectionHandle {
            client_id: id.clone(),
            session_id,
            receiver,
            cancel: cancel.clone(),
            close_reason: close_reason.clone(),
        };

        let connection = Self {
            id,
            session_id,
            endpoint,
            state: Mutex::new(ConnectionState::Connecting),
            sender,
            cancel,
            close_reason,
            inflight: Mutex::new(Inflight::new()),
            order: tokio::sync::Mutex::new(()),
            connected_at: chrono::Utc::now().timestamp_millis(),
        };

        (connection, handle)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn endpoint(&self) -> Option<SocketAddr> {
        self.endpoint
    }

    pub fn connected_at(&self) -> i64 {
        self.connected_at
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    /// `Connecting -> Authenticated`, after a successful credential check.
    pub fn authenticate(&self) -> Result<(), InvalidTransition> {
        self.transition(ConnectionState::Connecting, ConnectionState::Authenticated)
    }

    /// `Authenticated -> Active`, once registered in the connection table.
    pub fn activate(&self) -> Result<(), InvalidTransition> {
        self.transition(ConnectionState::Authenticated, ConnectionState::Active)
    }

    /// Move to `Disconnected` from any other state. Returns false if the
    /// connection was already closed; the first reason recorded wins.
    pub fn close(&self, reason: DisconnectReason) -> bool {
        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Disconnected {
                return false;
            }
            *state = ConnectionState::Disconnected;
        }
        self.close_reason.lock().get_or_insert(reason);
        self.cancel.cancel();
        true
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        *self.close_reason.lock()
    }

    /// Queue `delivery`, waiting at most `timeout` for the delivery order
    /// lock and room in the queue together. QoS 1 and 2 deliveries are
    /// tracked in flight until acknowledged.
    pub async fn deliver(&self, delivery: Delivery, timeout: Duration) -> Result<(), DeliveryError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let order = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(DeliveryError::Closed),
            order = tokio::time::timeout_at(deadline, self.order.lock()) => match order {
                Ok(order) => order,
                Err(_) => return Err(DeliveryError::Timeout),
            },
        };
        let result = self.enqueue(delivery, deadline).await;
        drop(order);
        result
    }

    /// Take the delivery order lock. Deliveries queued through the returned
    /// guard reach the subscriber before any `deliver` call that starts
    /// while it is held.
    pub async fn ordered(&self) -> OrderedDelivery<'_> {
        OrderedDelivery {
            connection: self,
            _order: self.order.lock().await,
        }
    }

    async fn enqueue(
        &self,
        mut delivery: Delivery,
        deadline: tokio::time::Instant,
    ) -> Result<(), DeliveryError> {
        if !self.is_active() {
            return Err(DeliveryError::Closed);
        }

        let packet_id = if delivery.qos > QoS::AtMostOnce {
            match self.inflight.lock().track(&mut delivery) {
                Some(id) => Some(id),
                None => return Err(DeliveryError::Timeout),
            }
        } else {
            None
        };

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(DeliveryError::Closed),
            sent = tokio::time::timeout_at(deadline, self.sender.send(delivery)) => match sent {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(DeliveryError::Closed),
                Err(_) => Err(DeliveryError::Timeout),
            },
        };

        if result.is_err() {
            if let Some(id) = packet_id {
                self.inflight.lock().acknowledge(id);
            }
        }
        result
    }

    /// Subscriber acknowledged `packet_id`.
    pub fn acknowledge(&self, packet_id: u16) -> bool {
        self.inflight.lock().acknowledge(packet_id)
    }

    pub fn inflight_len(&self) -> usize {
        self.inflight.lock().len()
    }

    /// Re-send overdue deliveries without blocking. A full queue skips the
    /// re-send; the entry is picked up again on the next sweep.
    /// Returns `(resent, dropped)`.
    pub fn resend_expired(
        &self,
        now: Instant,
        ack_timeout: Duration,
        max_retries: u8,
    ) -> (usize, usize) {
        if !self.is_active() {
            return (0, 0);
        }

        let sweep = self.inflight.lock().sweep(now, ack_timeout, max_retries);
        let mut resent = 0;
        for delivery in sweep.resend {
            let packet_id = delivery.packet_id;
            match self.sender.try_send(delivery) {
                Ok(()) => {
                    if let Some(id) = packet_id {
                        self.inflight.lock().mark_resent(id, now);
                    }
                    resent += 1;
                }
                Err(TrySendError::Full(_)) => {}
                Err(TrySendError::Closed(_)) => break,
            }
        }
        (resent, sweep.dropped.len())
    }

    /// Record an incoming QoS 2 packet id; false means it is a retransmission.
    pub fn begin_incoming(&self, packet_id: u16) -> bool {
        self.inflight.lock().begin_incoming(packet_id)
    }

    pub fn release_incoming(&self, packet_id: u16) -> bool {
        self.inflight.lock().release_incoming(packet_id)
    }

    fn transition(
        &self,
        from: ConnectionState,
        to: ConnectionState,
    ) -> Result<(), InvalidTransition> {
        let mut state = self.state.lock();
        if *state != from {
            return Err(InvalidTransition { from: *state, to });
        }
        *state = to;
        Ok(())
    }
}

/// Holds a connection's delivery order lock; see `Connection::ordered`.
pub struct OrderedDelivery<'a> {
    connection: &'a Connection,
    _order: tokio::sync::MutexGuard<'a, ()>,
}

impl OrderedDelivery<'_> {
    pub async fn deliver(&self, delivery: Delivery, timeout: Duration) -> Result<(), DeliveryError> {
        let deadline = tokio::time::Instant::now() + timeout;
        self.connection.enqueue(delivery, deadline).await
    }
}

/// The client-facing end of a connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    client_id: String,
    session_id: Uuid,
    receiver: mpsc::Receiver<Delivery>,
    cancel: CancellationToken,
    close_reason: Arc<Mutex<Option<DisconnectReason>>>,
}

impl ConnectionHandle {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Next queued delivery, or `None` once the connection is closed.
    pub async fn recv(&mut self) -> Option<Delivery> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            delivery = self.receiver.recv() => delivery,
        }
    }

    /// Non-blocking variant of `recv`.
    pub fn try_recv(&mut self) -> Option<Delivery> {
        if self.cancel.is_cancelled() {
            return None;
        }
        self.receiver.try_recv().ok()
    }

    /// Resolves when the broker closes this connection.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        *self.close_reason.lock()
    }
}
