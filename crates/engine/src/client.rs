//! Workflow-engine client abstraction.

use async_trait::async_trait;
use jobsync_core::{
    ActivatedJob, JobKey, MessageSpec, ProcessInstanceKey, SubscriptionId, TaskType, Variables,
};
use std::path::Path;
use std::sync::Arc;

/// Error type for engine requests.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors returned by engine requests.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Gateway could not be reached
    #[error("Engine unavailable: {0}")]
    Unavailable(String),

    /// Engine refused the request
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// Job key unknown or already completed/failed
    #[error("Job {0} not found")]
    JobNotFound(JobKey),

    /// Process instance unknown or already finished
    #[error("Process instance {0} not found")]
    ProcessInstanceNotFound(ProcessInstanceKey),

    /// No worker is subscribed to the task type
    #[error("No subscription for task type {0}")]
    NoSubscription(TaskType),

    /// Resource deployment failed
    #[error("Deployment failed: {0}")]
    Deployment(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Callback the engine invokes once per delivered job instance.
///
/// Invocations happen on the engine's own tasks, concurrently with whatever
/// the subscriber is doing.
#[async_trait]
pub trait JobCallback: Send + Sync {
    /// Handle one activated job.
    async fn on_job(&self, job: ActivatedJob);
}

/// Handle for an open job subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Subscription identifier
    pub id: SubscriptionId,

    /// Task type the subscription receives jobs for
    pub task_type: TaskType,
}

/// Client side of the workflow engine.
///
/// This trait allows different gateways to be plugged in.
#[async_trait]
pub trait EngineClient: Send + Sync {
    // === Bootstrap ===

    /// Deploy a process model resource. Returns the deployment key.
    async fn deploy_resource(&self, path: &Path) -> Result<i64>;

    /// Start the latest version of a process with initial variables.
    async fn create_process_instance(
        &self,
        process_id: &str,
        variables: Variables,
    ) -> Result<ProcessInstanceKey>;

    // === Jobs ===

    /// Open a persistent job subscription for a task type.
    async fn subscribe(
        &self,
        task_type: &TaskType,
        callback: Arc<dyn JobCallback>,
    ) -> Result<Subscription>;

    /// Complete a job with its output variables.
    async fn complete_job(&self, key: JobKey, variables: Variables) -> Result<()>;

    /// Fail a job, leaving `retries` engine-side retries.
    async fn fail_job(&self, key: JobKey, retries: u32) -> Result<()>;

    // === Messages & instances ===

    /// Publish a correlated message.
    async fn publish_message(&self, message: &MessageSpec, variables: Variables) -> Result<()>;

    /// Cancel a running process instance.
    async fn cancel_process_instance(&self, key: ProcessInstanceKey) -> Result<()>;
}
