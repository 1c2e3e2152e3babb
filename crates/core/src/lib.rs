//! jobsync core data models.
//!
//! Types shared between the engine boundary, the per-task worker loops and
//! the broker bridge.

#![warn(missing_docs)]

// Identities
mod id;

// Engine payloads
mod job;
mod message;
mod signal;

// Re-exports
pub use id::{DeliveryTag, JobKey, ProcessInstanceKey, SubscriptionId, TaskType};
pub use job::{variables_from, ActivatedJob, Variables};
pub use message::{BrokerEnvelope, MessageSpec};
pub use signal::CompletionSignal;
