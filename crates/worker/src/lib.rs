//! Job-worker synchronization for jobsync.
//!
//! One [`Worker`] loop runs per task type. Each iteration is armed with
//! fresh signal slots, claimed by exactly one engine job, and ends when the
//! job's handler closes the completion gate. In between, the loop forwards
//! the handler's variables to the [`MessageCorrelator`] and runs the
//! task's [`DeferredEffect`].

#![warn(missing_docs)]

// Signal plumbing
pub mod error;
pub mod registry;
pub mod signals;

// Handler surface
pub mod control;
pub mod definition;

// Post-completion actions
pub mod correlator;
pub mod deferred;

// Loops
pub mod pool;
pub mod worker;

pub use control::{JobControl, JobOutcome, FAIL_RETRIES};
pub use correlator::MessageCorrelator;
pub use deferred::{DeferredEffect, EffectContext, FixedResponse, PublishResponse, ResponseSource};
pub use definition::{JobDefinition, JobHandler};
pub use error::{SignalError, Slot, WorkerError};
pub use pool::WorkerPool;
pub use registry::{completion_gate, GateReceiver, GateSender, TaskRegistry};
pub use signals::{JobSignals, PendingSignals};
pub use worker::{Worker, WorkerState, WorkerStatus};
