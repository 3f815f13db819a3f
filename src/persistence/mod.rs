//! The `persistence` module stores messages the broker must remember beyond
//! a single publish.
//!
//! Only retained messages are kept: one per topic, replayed to clients when
//! they subscribe to a matching filter. Storage is in-memory; nothing survives
//! a broker restart.

pub mod retained_store;

pub use retained_store::{RetainOutcome, RetainedEntry, RetainedStore};
