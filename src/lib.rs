//! # TopicMQ
//!
//! `topicmq` is a small in-memory publish/subscribe broker. Clients connect
//! with a username and password, subscribe to topic filters (with `*` and `#`
//! wildcards) and publish messages at QoS 0, 1 or 2. The broker keeps the
//! last retained message per topic and replays it to new subscribers.
//!
//! ## Core Modules
//!
//! - `broker`: credential checks, topic matching, the subscription registry and the routing engine.
//! - `client`: the broker-side state of a connected client and its delivery queue.
//! - `config`: loading server and broker configuration from file and environment.
//! - `persistence`: the retained message store.
//! - `transport`: the WebSocket server and its JSON frames.
//! - `utils`: error types and logging.

pub mod broker;
pub mod client;
pub mod config;
pub mod persistence;
pub mod transport;
pub mod utils;
