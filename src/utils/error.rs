//! The `error` module defines the error types returned by the broker core
//! and the transport layer.
//!
//! Every broker operation reports failure to its immediate caller as one of
//! these values; none of them is fatal to the broker process.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::client::InvalidTransition;

/// Why a `connect` request was refused. The connection is never admitted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("bad user name or password")]
    BadUserNameOrPassword,

    #[error("invalid client identifier")]
    InvalidClientId,

    /// A connection with this identifier is already active and the broker
    /// is configured to reject duplicates.
    #[error("client identifier '{0}' is already connected")]
    ClientIdInUse(String),

    #[error("server unavailable: connection limit reached")]
    ServerUnavailable,

    #[error(transparent)]
    InvalidState(#[from] InvalidTransition),
}

impl ConnectError {
    /// Reason code reported back to the client in a `connack` frame.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ConnectError::BadUserNameOrPassword => "bad_user_name_or_password",
            ConnectError::InvalidClientId => "client_identifier_not_valid",
            ConnectError::ClientIdInUse(_) => "client_identifier_in_use",
            ConnectError::ServerUnavailable => "server_unavailable",
            ConnectError::InvalidState(_) => "unspecified_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscribeError {
    /// Malformed wildcard placement or an empty filter. The connection stays active.
    #[error("invalid topic filter '{0}'")]
    InvalidFilter(String),

    #[error("client '{0}' is not connected")]
    NotConnected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    /// Topic was empty or contained a wildcard character.
    #[error("invalid topic '{0}'")]
    InvalidTopic(String),

    #[error("client '{0}' is not connected")]
    NotConnected(String),
}

/// Outcome of a single delivery attempt to one subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// The subscriber's queue stayed full for longer than the delivery timeout.
    #[error("delivery timed out")]
    Timeout,

    /// The subscriber disconnected before the message could be queued.
    #[error("subscriber closed")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("websocket handshake failed: {0}")]
    Handshake(tungstenite::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// Why a connection left the `Active` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// Credential check failed; the connection never became active.
    BadCredentials,
    ClientClosed,
    TransportFailure,
    ProtocolViolation,
    DeliveryTimeout,
    SessionTakenOver,
    ServerShutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DisconnectReason::BadCredentials => "bad credentials",
            DisconnectReason::ClientClosed => "client closed",
            DisconnectReason::TransportFailure => "transport failure",
            DisconnectReason::ProtocolViolation => "protocol violation",
            DisconnectReason::DeliveryTimeout => "delivery timeout",
            DisconnectReason::SessionTakenOver => "session taken over",
            DisconnectReason::ServerShutdown => "server shutdown",
        };
        f.write_str(s)
    }
}
