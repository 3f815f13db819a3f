//! The `utils` module collects the definitions shared across `topicmq`:
//! the error types and the logging setup.

pub mod error;
pub mod logging;

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::error::{ConnectError, DisconnectReason};
    use super::logging::{self, TracingSink};
    use crate::broker::events::{BrokerEvent, EventSink};
    use crate::broker::message::QoS;

    #[test]
    fn logging_init_accepts_levels() {
        logging::init("info");
        logging::init("debug");
        logging::init("bogus");
    }

    #[test]
    #[serial]
    fn env_filter_prefers_rust_log() {
        temp_env::with_var("RUST_LOG", Some("topicmq=trace"), || {
            let filter = logging::env_filter("warn").to_string();
            assert!(filter.contains("topicmq=trace"), "{filter}");
        });
    }

    #[test]
    #[serial]
    fn env_filter_falls_back_to_default_level() {
        temp_env::with_var("RUST_LOG", None::<&str>, || {
            assert_eq!(logging::env_filter("debug").to_string(), "debug");
            assert_eq!(logging::env_filter("bogus").to_string(), "info");
        });
        temp_env::with_var("RUST_LOG", Some("topicmq=loud"), || {
            assert_eq!(logging::env_filter("error").to_string(), "error");
        });
    }

    #[test]
    fn tracing_sink_handles_every_event() {
        logging::init("trace");
        let sink = TracingSink;
        sink.emit(BrokerEvent::ConnectionOpened {
            client_id: "c1".into(),
            endpoint: Some("127.0.0.1:1883".parse().unwrap()),
        });
        sink.emit(BrokerEvent::SubscriptionCreated {
            client_id: "c1".into(),
            filter: "a/#".into(),
            qos: QoS::AtLeastOnce,
        });
        sink.emit(BrokerEvent::MessagePublished {
            client_id: "c1".into(),
            topic: "a/b".into(),
            qos: QoS::AtMostOnce,
            retain: false,
            sequence: 1,
        });
        sink.emit(BrokerEvent::ConnectionClosed {
            client_id: "c1".into(),
            reason: DisconnectReason::ClientClosed,
        });
    }

    #[test]
    fn connect_error_reason_codes() {
        assert_eq!(
            ConnectError::ClientIdInUse("x".into()).reason_code(),
            "client_identifier_in_use"
        );
        assert_eq!(
            ConnectError::ServerUnavailable.reason_code(),
            "server_unavailable"
        );
    }

    #[test]
    fn disconnect_reason_serializes_snake_case() {
        let json = serde_json::to_string(&DisconnectReason::DeliveryTimeout).unwrap();
        assert_eq!(json, "\"delivery_timeout\"");
        assert_eq!(DisconnectReason::SessionTakenOver.to_string(), "session taken over");
    }
}
