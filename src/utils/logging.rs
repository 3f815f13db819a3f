use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::broker::events::{BrokerEvent, EventSink};

/// Initialize tracing/logging for the application.
///
/// `RUST_LOG` wins when it is set and parses; otherwise every target logs
/// at `default_level`.
pub fn init(default_level: &str) {
    // try_init so tests can call this more than once
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_level))
        .with_target(false)
        .try_init();
}

pub(crate) fn env_filter(default_level: &str) -> EnvFilter {
    let lvl = match default_level.to_lowercase().as_str() {
        "error" => tracing::Level::ERROR,
        "warn" | "warning" => tracing::Level::WARN,
        "debug" => tracing::Level::DEBUG,
        "trace" => tracing::Level::TRACE,
        _ => tracing::Level::INFO,
    };

    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::default().add_directive(LevelFilter::from_level(lvl).into())
    })
}

/// Event sink that writes every broker event as an `info` record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: BrokerEvent) {
        match event {
            BrokerEvent::ConnectionOpened {
                client_id,
                endpoint,
            } => match endpoint {
                Some(addr) => info!(%client_id, %addr, "Client connected"),
                None => info!(%client_id, "Client connected"),
            },
            BrokerEvent::ConnectionClosed { client_id, reason } => {
                info!(%client_id, %reason, "Client disconnected");
            }
            BrokerEvent::SubscriptionCreated {
                client_id,
                filter,
                qos,
            } => {
                info!(%client_id, %filter, %qos, "Subscribed");
            }
            BrokerEvent::MessagePublished {
                client_id,
                topic,
                qos,
                retain,
                sequence,
            } => {
                info!(
                    message_number = sequence,
                    %client_id,
                    %topic,
                    %qos,
                    retain,
                    "Message published"
                );
            }
        }
    }
}
