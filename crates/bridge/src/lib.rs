//! External message bridge for jobsync.
//!
//! Consumes JSON envelopes from a broker queue and republishes them as
//! correlated engine messages.

#![warn(missing_docs)]

pub mod bridge;
pub mod broker;

pub use bridge::{BridgeError, BridgeStats, DeliveryOutcome, MessageBridge};
pub use broker::{
    Broker, BrokerError, Delivery, InMemoryBroker, QueueSpec, Result, DEFAULT_PREFETCH,
    DEFAULT_QUEUE,
};
