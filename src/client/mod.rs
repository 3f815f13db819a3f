//! The `client` module defines the broker-side representation of a client.
//!
//! It provides the `Connection` struct, which encapsulates the state of a
//! single admitted client (identity, lifecycle state, delivery queue and
//! in-flight acknowledgements), and the `ConnectionHandle` used to consume
//! what the broker delivers to it.

pub mod connection;
pub mod inflight;

pub use connection::{
    Connection, ConnectionHandle, ConnectionState, InvalidTransition, OrderedDelivery,
};

#[cfg(test)]
mod tests;
