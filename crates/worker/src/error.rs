//! Error types for worker loops and their signal slots.

use jobsync_core::TaskType;
use jobsync_engine::EngineError;

/// Per-iteration signal slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Variable bundle for the message correlator
    Variables,
    /// Deferred-effect trigger
    Deferred,
    /// Completion gate
    Completion,
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Slot::Variables => write!(f, "variables"),
            Slot::Deferred => write!(f, "deferred"),
            Slot::Completion => write!(f, "completion"),
        }
    }
}

/// Misuse of a single-use signal slot.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignalError {
    /// The slot was already used for this job instance
    #[error("{slot} signal already sent for task type {task_type}")]
    AlreadySent {
        /// Task type of the job
        task_type: TaskType,
        /// Slot that was reused
        slot: Slot,
    },

    /// The slot still holds an undrained value
    #[error("{slot} slot of task type {task_type} is occupied")]
    Occupied {
        /// Task type of the job
        task_type: TaskType,
        /// Occupied slot
        slot: Slot,
    },

    /// Nobody will ever read the slot again
    #[error("{slot} slot of task type {task_type} is closed")]
    Closed {
        /// Task type of the job
        task_type: TaskType,
        /// Closed slot
        slot: Slot,
    },

    /// No gate was ever registered for the task type
    #[error("No completion gate registered for task type {0}")]
    Unregistered(TaskType),
}

/// Errors ending a worker iteration or a whole worker.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The engine refused the job subscription
    #[error("Subscription for {task_type} failed: {source}")]
    Subscribe {
        /// Task type being subscribed
        task_type: TaskType,
        /// Engine error
        #[source]
        source: EngineError,
    },

    /// The completion gate closed before a signal arrived
    #[error("Completion gate of {0} closed without a signal")]
    GateClosed(TaskType),

    /// The next iteration could not be armed
    #[error("Worker for {0} could not arm its next iteration")]
    Disarmed(TaskType),

    /// A worker for the task type already exists
    #[error("Task type {0} is already registered")]
    DuplicateTaskType(TaskType),

    /// The worker task panicked or was aborted
    #[error("Worker task for {task_type} ended abnormally: {message}")]
    Aborted {
        /// Task type of the worker
        task_type: TaskType,
        /// Join error description
        message: String,
    },
}
