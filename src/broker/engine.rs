//! Broker engine
//!
//! This module contains the broker core responsible for:
//! - admitting connections after a credential check
//! - managing subscriptions, including wildcard filters
//! - routing published messages to matching subscribers with QoS downgrade
//! - keeping retained messages and replaying them to new subscribers
//! - tracking QoS 1/2 deliveries and retrying until acknowledged
//!
//! Concurrency and usage notes:
//! - The broker is shared as `Arc<Broker>`. The connection table, the
//!   subscription registry and the retained store each sit behind their own
//!   lock. When more than one is held the order is always connections, then
//!   registry, then retained.
//! - No lock is held while waiting on a subscriber queue: a publish takes a
//!   snapshot of its recipients, releases the locks, then delivers.
//! - Subscribe holds the connection's delivery order lock from the registry
//!   insert until its retained replay is queued, so a concurrent publish
//!   never lands ahead of an older retained copy.
//! - A subscriber whose queue stays full past the delivery timeout is
//!   disconnected; the publish still succeeds for everyone else.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::broker::credentials::CredentialStore;
use crate::broker::events::{BrokerEvent, EventSink, NullSink};
use crate::broker::message::{Delivery, Message, QoS};
use crate::broker::registry::{OverlapPolicy, Subscription, SubscriptionRegistry};
use crate::broker::topic;
use crate::client::{Connection, ConnectionHandle};
use crate::persistence::RetainedStore;
use crate::utils::error::{
    ConnectError, DeliveryError, DisconnectReason, PublishError, SubscribeError,
};

/// Longest accepted client identifier, in bytes.
pub const MAX_CLIENT_ID_LEN: usize = 256;

/// What to do when a client connects with an identifier that is already active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateClientIdPolicy {
    /// Close the existing connection and admit the new one.
    #[default]
    Takeover,
    /// Refuse the new connection.
    Reject,
}

#[derive(Debug, Clone)]
pub struct BrokerOptions {
    /// Per-connection delivery queue size.
    pub queue_capacity: usize,
    /// How long a publish waits for room in one subscriber's queue.
    pub delivery_timeout: Duration,
    pub max_connections: usize,
    /// Highest QoS the broker grants to a subscription.
    pub max_qos: QoS,
    pub duplicate_client_id: DuplicateClientIdPolicy,
    pub overlapping_qos: OverlapPolicy,
    /// An empty retained publish removes the topic's retained message.
    pub clear_retained_on_empty: bool,
    pub ack_timeout: Duration,
    pub max_retries: u8,
    /// How often the retry loop looks for unacknowledged deliveries.
    pub retry_interval: Duration,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            delivery_timeout: Duration::from_millis(1000),
            max_connections: 10_000,
            max_qos: QoS::ExactlyOnce,
            duplicate_client_id: DuplicateClientIdPolicy::Takeover,
            overlapping_qos: OverlapPolicy::Maximum,
            clear_retained_on_empty: true,
            ack_timeout: Duration::from_millis(5000),
            max_retries: 5,
            retry_interval: Duration::from_millis(1000),
        }
    }
}

/// Result of an accepted publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishAck {
    /// Position of this publish in the broker's processing order, from 1.
    /// Zero for a suppressed duplicate.
    pub sequence: u64,
    /// Number of deliveries the subscription match produced.
    pub matched: usize,
    /// Deliveries that made it into a subscriber queue.
    pub delivered: usize,
    /// Subscribers disconnected because their queue stayed full.
    pub timed_out: Vec<String>,
    /// A QoS 2 retransmission whose packet id was still held; not routed again.
    pub duplicate: bool,
}

pub struct Broker {
    options: BrokerOptions,
    credentials: CredentialStore,
    events: Arc<dyn EventSink>,
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    registry: RwLock<SubscriptionRegistry>,
    retained: RwLock<RetainedStore>,
    published: AtomicU64,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("options", &self.options)
            .field("connections", &self.connections.read().len())
            .field("subscriptions", &self.registry.read().len())
            .field("retained", &self.retained.read().len())
            .finish()
    }
}

impl Broker {
    pub fn new(credentials: CredentialStore, options: BrokerOptions) -> Self {
        let retained = RetainedStore::new(options.clear_retained_on_empty);
        Self {
            options,
            credentials,
            events: Arc::new(NullSink),
            connections: RwLock::new(HashMap::new()),
            registry: RwLock::new(SubscriptionRegistry::new()),
            retained: RwLock::new(retained),
            published: AtomicU64::new(0),
        }
    }

    /// Replace the event sink. Events are emitted inline and must not block.
    pub fn with_event_sink<S: EventSink + 'static>(mut self, sink: S) -> Self {
        self.events = Arc::new(sink);
        self
    }

    pub fn options(&self) -> &BrokerOptions {
        &self.options
    }

    /// Admit a client. See `connect_from`.
    pub fn connect(
        &self,
        client_id: &str,
        username: &str,
        password: &str,
    ) -> Result<ConnectionHandle, ConnectError> {
        self.connect_from(client_id, username, password, None)
    }

    /// Admit a client connecting from `endpoint`.
    ///
    /// On bad credentials the connection is closed before it is ever
    /// registered. An empty `client_id` gets a generated one, readable from
    /// the returned handle.
    pub fn connect_from(
        &self,
        client_id: &str,
        username: &str,
        password: &str,
        endpoint: Option<SocketAddr>,
    ) -> Result<ConnectionHandle, ConnectError> {
        if client_id.len() > MAX_CLIENT_ID_LEN || client_id.contains('\0') {
            return Err(ConnectError::InvalidClientId);
        }
        let client_id = if client_id.is_empty() {
            format!("client-{}", Uuid::new_v4())
        } else {
            client_id.to_string()
        };

        let (conn, handle) = Connection::new(&client_id, endpoint, self.options.queue_capacity);

        if !self.credentials.authenticate(username, password) {
            conn.close(DisconnectReason::BadCredentials);
            debug!("Rejected {client_id}: bad user name or password");
            return Err(ConnectError::BadUserNameOrPassword);
        }
        conn.authenticate()?;

        let conn = Arc::new(conn);
        let replaced = {
            let mut connections = self.connections.write();
            let replaced = if connections.contains_key(&client_id) {
                if self.options.duplicate_client_id == DuplicateClientIdPolicy::Reject {
                    conn.close(DisconnectReason::ClientClosed);
                    return Err(ConnectError::ClientIdInUse(client_id));
                }
                let previous = connections.remove(&client_id);
                if let Some(previous) = &previous {
                    previous.close(DisconnectReason::SessionTakenOver);
                }
                self.registry.write().remove_all(&client_id);
                previous
            } else if connections.len() >= self.options.max_connections {
                conn.close(DisconnectReason::ClientClosed);
                return Err(ConnectError::ServerUnavailable);
            } else {
                None
            };

            conn.activate()?;
            connections.insert(client_id.clone(), conn.clone());
            replaced
        };

        if replaced.is_some() {
            debug!("Client {client_id} took over an existing session");
            self.events.emit(BrokerEvent::ConnectionClosed {
                client_id: client_id.clone(),
                reason: DisconnectReason::SessionTakenOver,
            });
        }

        self.events.emit(BrokerEvent::ConnectionOpened {
            client_id,
            endpoint,
        });

        Ok(handle)
    }

    /// Client-initiated disconnect.
    pub fn disconnect(&self, client_id: &str) -> bool {
        self.close_connection(client_id, None, DisconnectReason::ClientClosed)
    }

    /// Disconnect whatever connection currently holds `client_id`.
    pub fn disconnect_with(&self, client_id: &str, reason: DisconnectReason) -> bool {
        self.close_connection(client_id, None, reason)
    }

    /// Disconnect `client_id` only if its current connection is `session_id`.
    /// Used by transports so a stale session cannot tear down its successor.
    pub fn disconnect_session(
        &self,
        client_id: &str,
        session_id: Uuid,
        reason: DisconnectReason,
    ) -> bool {
        self.close_connection(client_id, Some(session_id), reason)
    }

    /// Subscribe `client_id` to `filter`. Returns the granted QoS: the
    /// requested level capped by the broker's `max_qos`.
    ///
    /// Retained messages matching the filter are queued to the subscriber
    /// before this returns, each at its own QoS capped by the granted QoS.
    pub async fn subscribe(
        &self,
        client_id: &str,
        filter: &str,
        qos: QoS,
    ) -> Result<QoS, SubscribeError> {
        topic::validate_filter(filter)
            .map_err(|f| SubscribeError::InvalidFilter(f.to_string()))?;

        let granted = qos.downgrade(self.options.max_qos);

        let conn = self
            .active_connection(client_id)
            .ok_or_else(|| SubscribeError::NotConnected(client_id.to_string()))?;

        // held until the replay is queued, so a publish that sees the new
        // subscription delivers after the retained copies
        let order = conn.ordered().await;

        let retained = {
            let connections = self.connections.read();
            let current = connections
                .get(client_id)
                .is_some_and(|c| c.session_id() == conn.session_id() && c.is_active());
            if !current {
                return Err(SubscribeError::NotConnected(client_id.to_string()));
            }

            let mut registry = self.registry.write();
            registry.add(client_id, filter, granted);
            self.retained.read().load_matching(filter)
        };

        self.events.emit(BrokerEvent::SubscriptionCreated {
            client_id: client_id.to_string(),
            filter: filter.to_string(),
            qos: granted,
        });

        for message in retained {
            let qos = message.qos.downgrade(granted);
            let mut delivery = Delivery::new(message, qos);
            delivery.retained = true;

            match order.deliver(delivery, self.options.delivery_timeout).await {
                Ok(()) => {}
                Err(DeliveryError::Timeout) => {
                    warn!("Retained replay to {client_id} timed out; disconnecting");
                    self.disconnect_session(
                        client_id,
                        conn.session_id(),
                        DisconnectReason::DeliveryTimeout,
                    );
                    break;
                }
                Err(DeliveryError::Closed) => break,
            }
        }
        drop(order);

        Ok(granted)
    }

    /// Remove one subscription. Returns false if it did not exist.
    pub fn unsubscribe(&self, client_id: &str, filter: &str) -> Result<bool, SubscribeError> {
        let connections = self.connections.read();
        if !connections.get(client_id).is_some_and(|c| c.is_active()) {
            return Err(SubscribeError::NotConnected(client_id.to_string()));
        }
        let removed = self.registry.write().remove(client_id, filter);
        Ok(removed)
    }

    /// Publish without a packet id. See `publish_packet`.
    pub async fn publish(
        &self,
        client_id: &str,
        message: Message,
    ) -> Result<PublishAck, PublishError> {
        self.publish_packet(client_id, message, None).await
    }

    /// Route `message` from `client_id` to every matching subscriber.
    ///
    /// Each subscriber receives it at `min(message.qos, subscription qos)`.
    /// A retained message is stored (or cleared) before routing. For a QoS 2
    /// publish carrying `packet_id`, a retransmission of an id not yet
    /// released is acknowledged but not routed again.
    pub async fn publish_packet(
        &self,
        client_id: &str,
        message: Message,
        packet_id: Option<u16>,
    ) -> Result<PublishAck, PublishError> {
        if !topic::is_valid_topic(&message.topic) {
            return Err(PublishError::InvalidTopic(message.topic));
        }

        let publisher = self
            .active_connection(client_id)
            .ok_or_else(|| PublishError::NotConnected(client_id.to_string()))?;

        if let (QoS::ExactlyOnce, Some(id)) = (message.qos, packet_id) {
            if !publisher.begin_incoming(id) {
                trace!("Duplicate QoS 2 publish {id} from {client_id}");
                return Ok(PublishAck {
                    duplicate: true,
                    ..PublishAck::default()
                });
            }
        }

        let sequence = self.published.fetch_add(1, Ordering::SeqCst) + 1;

        if message.retain {
            let outcome = self.retained.write().store_message(&message);
            trace!("Retained {} -> {:?}", message.topic, outcome);
        }

        self.events.emit(BrokerEvent::MessagePublished {
            client_id: client_id.to_string(),
            topic: message.topic.clone(),
            qos: message.qos,
            retain: message.retain,
            sequence,
        });

        let recipients: Vec<(Arc<Connection>, QoS)> = {
            let connections = self.connections.read();
            let registry = self.registry.read();
            registry
                .matching(&message.topic, self.options.overlapping_qos)
                .into_iter()
                .filter_map(|(id, qos)| connections.get(&id).map(|c| (c.clone(), qos)))
                .collect()
        };

        // existing subscribers get the live message, not a retained copy
        let live = message.clone().with_retain(false);
        let timeout = self.options.delivery_timeout;
        let attempts = recipients.iter().map(|(conn, sub_qos)| {
            let delivery = Delivery::new(live.clone(), message.qos.downgrade(*sub_qos));
            async move { (conn, conn.deliver(delivery, timeout).await) }
        });
        let outcomes = join_all(attempts).await;

        let mut ack = PublishAck {
            sequence,
            matched: recipients.len(),
            ..PublishAck::default()
        };
        for (conn, outcome) in outcomes {
            match outcome {
                Ok(()) => ack.delivered += 1,
                Err(DeliveryError::Timeout) => {
                    warn!("Delivery to {} timed out; disconnecting", conn.id());
                    if self.disconnect_session(
                        conn.id(),
                        conn.session_id(),
                        DisconnectReason::DeliveryTimeout,
                    ) {
                        ack.timed_out.push(conn.id().to_string());
                    }
                }
                Err(DeliveryError::Closed) => {
                    trace!("Skipped delivery to closed connection {}", conn.id());
                }
            }
        }

        Ok(ack)
    }

    /// Subscriber acknowledged the delivery `packet_id`.
    pub fn acknowledge(&self, client_id: &str, packet_id: u16) -> bool {
        match self.active_connection(client_id) {
            Some(conn) => conn.acknowledge(packet_id),
            None => false,
        }
    }

    /// Publisher released a QoS 2 packet id; later publishes may reuse it.
    pub fn release(&self, client_id: &str, packet_id: u16) -> bool {
        match self.active_connection(client_id) {
            Some(conn) => conn.release_incoming(packet_id),
            None => false,
        }
    }

    /// Re-send every delivery whose acknowledgement is overdue at `now`.
    /// Returns the number of re-sent deliveries.
    pub fn retry_pending(&self, now: Instant) -> usize {
        let connections: Vec<Arc<Connection>> =
            self.connections.read().values().cloned().collect();

        let mut total = 0;
        for conn in connections {
            let (resent, dropped) =
                conn.resend_expired(now, self.options.ack_timeout, self.options.max_retries);
            if resent > 0 {
                debug!("Re-sent {resent} unacknowledged deliveries to {}", conn.id());
            }
            if dropped > 0 {
                warn!(
                    "Dropped {dropped} deliveries to {} after {} retries",
                    conn.id(),
                    self.options.max_retries
                );
            }
            total += resent;
        }
        total
    }

    /// Periodically re-send unacknowledged deliveries. Runs until the task is
    /// dropped or aborted. A zero `retry_interval` is treated as 1ms.
    pub async fn start_retry_loop(broker: Arc<Broker>) {
        let period = broker.options.retry_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            broker.retry_pending(Instant::now());
        }
    }

    /// Close every connection.
    pub fn shutdown(&self) {
        let ids: Vec<String> = self.connections.read().keys().cloned().collect();
        for id in ids {
            self.close_connection(&id, None, DisconnectReason::ServerShutdown);
        }
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.active_connection(client_id).is_some()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    pub fn subscriptions_of(&self, client_id: &str) -> Vec<Subscription> {
        self.registry.read().subscriptions_of(client_id)
    }

    pub fn subscription_count(&self) -> usize {
        self.registry.read().len()
    }

    pub fn retained_message(&self, topic: &str) -> Option<Message> {
        self.retained
            .read()
            .get(topic)
            .map(|entry| entry.message.clone())
    }

    pub fn retained_count(&self) -> usize {
        self.retained.read().len()
    }

    /// Total publishes accepted since start.
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    fn active_connection(&self, client_id: &str) -> Option<Arc<Connection>> {
        self.connections
            .read()
            .get(client_id)
            .filter(|c| c.is_active())
            .cloned()
    }

    fn close_connection(
        &self,
        client_id: &str,
        session_id: Option<Uuid>,
        reason: DisconnectReason,
    ) -> bool {
        let removed = {
            let mut connections = self.connections.write();
            let current = connections
                .get(client_id)
                .is_some_and(|c| session_id.is_none_or(|s| c.session_id() == s));
            if !current {
                return false;
            }
            let Some(conn) = connections.remove(client_id) else {
                return false;
            };
            conn.close(reason);
            let dropped = self.registry.write().remove_all(client_id);
            trace!("Removed {dropped} subscriptions of {client_id}");
            conn
        };

        debug!("Client {} disconnected: {reason}", removed.id());
        self.events.emit(BrokerEvent::ConnectionClosed {
            client_id: client_id.to_string(),
            reason,
        });
        true
    }
}
