//! The `broker` module is the core of the system: credential checks, topic
//! matching, the subscription registry and the engine that routes messages.

pub mod credentials;
pub mod engine;
pub mod events;
pub mod message;
pub mod registry;
pub mod topic;

pub use credentials::{Credential, CredentialStore};
pub use engine::{Broker, BrokerOptions, DuplicateClientIdPolicy, PublishAck};
pub use events::{BrokerEvent, ChannelSink, EventSink, NullSink};
pub use message::{Delivery, Message, QoS};
pub use registry::{OverlapPolicy, Subscription, SubscriptionRegistry};
