use std::io::Write;
use std::time::Duration;

use serial_test::serial;
use tempfile::NamedTempFile;

use super::{PartialBrokerSettings, PartialSettings, Settings, load_config_from};
use crate::broker::engine::DuplicateClientIdPolicy;
use crate::broker::message::QoS;
use crate::broker::registry::OverlapPolicy;

fn config_file(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("create temp config");
    file.write_all(contents.as_bytes()).expect("write temp config");
    file
}

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.server.host, "0.0.0.0");
    assert_eq!(settings.server.listen_port, 1883);
    assert_eq!(settings.server.connection_backlog, 100);
    assert_eq!(settings.broker.max_connections, 10_000);
    assert_eq!(settings.broker.max_qos, QoS::ExactlyOnce);
    assert_eq!(
        settings.broker.duplicate_client_id,
        DuplicateClientIdPolicy::Takeover
    );
    assert!(settings.credentials.is_empty());
}

#[test]
fn test_merge_keeps_defaults_for_missing_values() {
    let partial = PartialSettings {
        broker: Some(PartialBrokerSettings {
            queue_capacity: Some(4),
            ..PartialBrokerSettings::default()
        }),
        ..PartialSettings::default()
    };
    let settings = Settings::merge(partial);
    assert_eq!(settings.broker.queue_capacity, 4);
    assert_eq!(settings.broker.delivery_timeout_ms, 1000);
    assert_eq!(settings.server.listen_port, 1883);
}

#[test]
fn test_broker_options_conversion() {
    let mut settings = Settings::default();
    settings.broker.delivery_timeout_ms = 250;
    settings.broker.max_retries = 2;

    let options = settings.broker_options();
    assert_eq!(options.delivery_timeout, Duration::from_millis(250));
    assert_eq!(options.ack_timeout, Duration::from_millis(5000));
    assert_eq!(options.max_retries, 2);
    assert_eq!(options.queue_capacity, 256);
    assert_eq!(settings.connect_timeout(), Duration::from_secs(5));
}

#[test]
#[serial]
fn test_load_config_from_file_overrides_defaults() {
    let file = config_file(
        r#"
        [server]
        host = "127.0.0.1"
        listen_port = 9000

        [broker]
        max_connections = 10
        max_qos = 1
        duplicate_client_id = "reject"
        overlapping_qos = "per_subscription"
        clear_retained_on_empty = false

        [[credentials]]
        username = "User1"
        password = "Pass@1"

        [[credentials]]
        username = "User2"
        password = "Pass@2"
        "#,
    );

    let settings = load_config_from(file.path()).expect("load config");
    assert_eq!(settings.server.host, "127.0.0.1");
    assert_eq!(settings.server.listen_port, 9000);
    assert_eq!(settings.server.connection_backlog, 100);
    assert_eq!(settings.broker.max_connections, 10);
    assert_eq!(settings.broker.max_qos, QoS::AtLeastOnce);
    assert_eq!(
        settings.broker.duplicate_client_id,
        DuplicateClientIdPolicy::Reject
    );
    assert_eq!(
        settings.broker.overlapping_qos,
        OverlapPolicy::PerSubscription
    );
    assert!(!settings.broker.clear_retained_on_empty);

    let store = settings.credential_store();
    assert_eq!(store.len(), 2);
    assert!(store.authenticate("User2", "Pass@2"));
    assert!(!store.authenticate("User2", "Pass@1"));
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    let file = config_file(
        r#"
        [server]
        listen_port = 9000
        "#,
    );

    temp_env::with_vars(
        [
            ("TOPICMQ_SERVER__LISTEN_PORT", Some("9100")),
            ("TOPICMQ_BROKER__QUEUE_CAPACITY", Some("8")),
        ],
        || {
            let settings = load_config_from(file.path()).expect("load config");
            assert_eq!(settings.server.listen_port, 9100);
            assert_eq!(settings.broker.queue_capacity, 8);
        },
    );
}

#[test]
#[serial]
fn test_missing_config_file_is_an_error() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let missing = dir.path().join("absent.toml");
    assert!(load_config_from(missing).is_err());
}

#[test]
#[serial]
fn test_invalid_qos_is_rejected() {
    let file = config_file(
        r#"
        [broker]
        max_qos = 3
        "#,
    );
    assert!(load_config_from(file.path()).is_err());
}

#[test]
fn test_validate_rejects_zero_values() {
    assert!(Settings::default().validate().is_ok());

    let mut settings = Settings::default();
    settings.broker.retry_interval_ms = 0;
    let err = settings.validate().unwrap_err().to_string();
    assert!(err.contains("broker.retry_interval_ms"), "{err}");

    let mut settings = Settings::default();
    settings.broker.queue_capacity = 0;
    assert!(settings.validate().is_err());

    let mut settings = Settings::default();
    settings.server.connect_timeout_ms = 0;
    assert!(settings.validate().is_err());
}

#[test]
#[serial]
fn test_zero_interval_in_file_is_rejected() {
    for line in [
        "retry_interval_ms = 0",
        "delivery_timeout_ms = 0",
        "ack_timeout_ms = 0",
    ] {
        let file = config_file(&format!("[broker]\n{line}\n"));
        assert!(load_config_from(file.path()).is_err(), "{line} accepted");
    }
}
