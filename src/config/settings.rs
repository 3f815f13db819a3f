use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;

use crate::broker::credentials::{Credential, CredentialStore};
use crate::broker::engine::{BrokerOptions, DuplicateClientIdPolicy};
use crate::broker::message::QoS;
use crate::broker::registry::OverlapPolicy;

/// Top-level configuration settings for the application.
///
/// Includes the listener, the broker's operating parameters and the
/// accepted credentials.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub credentials: Vec<Credential>,
}

/// Where and how the server listens.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub listen_port: u16,
    /// Pending-connection backlog passed to `listen`.
    pub connection_backlog: u32,
    /// How long a new socket has to send its `connect` frame.
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    pub max_connections: usize,
    pub queue_capacity: usize,
    pub delivery_timeout_ms: u64,
    pub max_qos: QoS,
    pub duplicate_client_id: DuplicateClientIdPolicy,
    pub overlapping_qos: OverlapPolicy,
    pub clear_retained_on_empty: bool,
    pub ack_timeout_ms: u64,
    pub max_retries: u8,
    pub retry_interval_ms: u64,
}

/// Partial configuration settings loaded from files or environment.
///
/// Missing values are filled from `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub credentials: Option<Vec<Credential>>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub listen_port: Option<u16>,
    pub connection_backlog: Option<u32>,
    pub connect_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub max_connections: Option<usize>,
    pub queue_capacity: Option<usize>,
    pub delivery_timeout_ms: Option<u64>,
    pub max_qos: Option<QoS>,
    pub duplicate_client_id: Option<DuplicateClientIdPolicy>,
    pub overlapping_qos: Option<OverlapPolicy>,
    pub clear_retained_on_empty: Option<bool>,
    pub ack_timeout_ms: Option<u64>,
    pub max_retries: Option<u8>,
    pub retry_interval_ms: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "0.0.0.0".to_string(),
                listen_port: 1883,
                connection_backlog: 100,
                connect_timeout_ms: 5000,
            },
            broker: BrokerSettings {
                max_connections: 10_000,
                queue_capacity: 256,
                delivery_timeout_ms: 1000,
                max_qos: QoS::ExactlyOnce,
                duplicate_client_id: DuplicateClientIdPolicy::Takeover,
                overlapping_qos: OverlapPolicy::Maximum,
                clear_retained_on_empty: true,
                ack_timeout_ms: 5000,
                max_retries: 5,
                retry_interval_ms: 1000,
            },
            credentials: Vec::new(),
        }
    }
}

impl Settings {
    /// Fill every value missing from `partial` with its default.
    pub fn merge(partial: PartialSettings) -> Self {
        let default = Settings::default();
        let server = partial.server.unwrap_or_default();
        let broker = partial.broker.unwrap_or_default();

        Settings {
            server: ServerSettings {
                host: server.host.unwrap_or(default.server.host),
                listen_port: server.listen_port.unwrap_or(default.server.listen_port),
                connection_backlog: server
                    .connection_backlog
                    .unwrap_or(default.server.connection_backlog),
                connect_timeout_ms: server
                    .connect_timeout_ms
                    .unwrap_or(default.server.connect_timeout_ms),
            },
            broker: BrokerSettings {
                max_connections: broker
                    .max_connections
                    .unwrap_or(default.broker.max_connections),
                queue_capacity: broker
                    .queue_capacity
                    .unwrap_or(default.broker.queue_capacity),
                delivery_timeout_ms: broker
                    .delivery_timeout_ms
                    .unwrap_or(default.broker.delivery_timeout_ms),
                max_qos: broker.max_qos.unwrap_or(default.broker.max_qos),
                duplicate_client_id: broker
                    .duplicate_client_id
                    .unwrap_or(default.broker.duplicate_client_id),
                overlapping_qos: broker
                    .overlapping_qos
                    .unwrap_or(default.broker.overlapping_qos),
                clear_retained_on_empty: broker
                    .clear_retained_on_empty
                    .unwrap_or(default.broker.clear_retained_on_empty),
                ack_timeout_ms: broker
                    .ack_timeout_ms
                    .unwrap_or(default.broker.ack_timeout_ms),
                max_retries: broker.max_retries.unwrap_or(default.broker.max_retries),
                retry_interval_ms: broker
                    .retry_interval_ms
                    .unwrap_or(default.broker.retry_interval_ms),
            },
            credentials: partial.credentials.unwrap_or(default.credentials),
        }
    }

    /// Reject values the server cannot run with: zero timeouts, intervals
    /// and queue sizes.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("server.connect_timeout_ms", self.server.connect_timeout_ms),
            ("broker.delivery_timeout_ms", self.broker.delivery_timeout_ms),
            ("broker.ack_timeout_ms", self.broker.ack_timeout_ms),
            ("broker.retry_interval_ms", self.broker.retry_interval_ms),
            ("broker.queue_capacity", self.broker.queue_capacity as u64),
            ("broker.max_connections", self.broker.max_connections as u64),
            (
                "server.connection_backlog",
                u64::from(self.server.connection_backlog),
            ),
        ];

        match positive.iter().find(|(_, value)| *value == 0) {
            Some((key, _)) => Err(ConfigError::Message(format!(
                "{key} must be greater than 0"
            ))),
            None => Ok(()),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.server.connect_timeout_ms)
    }

    pub fn broker_options(&self) -> BrokerOptions {
        let broker = &self.broker;
        BrokerOptions {
            queue_capacity: broker.queue_capacity,
            delivery_timeout: Duration::from_millis(broker.delivery_timeout_ms),
            max_connections: broker.max_connections,
            max_qos: broker.max_qos,
            duplicate_client_id: broker.duplicate_client_id,
            overlapping_qos: broker.overlapping_qos,
            clear_retained_on_empty: broker.clear_retained_on_empty,
            ack_timeout: Duration::from_millis(broker.ack_timeout_ms),
            max_retries: broker.max_retries,
            retry_interval: Duration::from_millis(broker.retry_interval_ms),
        }
    }

    pub fn credential_store(&self) -> CredentialStore {
        CredentialStore::from_credentials(self.credentials.iter().cloned())
    }
}
