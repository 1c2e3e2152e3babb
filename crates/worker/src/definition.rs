//! Declaration of a task type: handler, optional message, optional effect.

use crate::control::JobControl;
use crate::deferred::DeferredEffect;
use async_trait::async_trait;
use jobsync_core::{ActivatedJob, MessageSpec, TaskType};
use std::sync::Arc;

/// Domain handler for one task type.
///
/// Every invocation must finish through `control`, on every code path;
/// otherwise the worker loop of the task type stays parked.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Handle one job instance.
    async fn handle(&self, job: ActivatedJob, control: JobControl);
}

/// A task type wired to its handler.
#[derive(Clone)]
pub struct JobDefinition {
    /// Task type to subscribe to
    pub task_type: TaskType,

    /// Handler invoked per job instance
    pub handler: Arc<dyn JobHandler>,

    /// Message published with the handler's variables
    pub message: Option<MessageSpec>,

    /// Effect run after completion
    pub deferred: Option<Arc<dyn DeferredEffect>>,
}

impl JobDefinition {
    /// Declare a task type with only a handler.
    pub fn new(task_type: impl Into<TaskType>, handler: Arc<dyn JobHandler>) -> Self {
        Self {
            task_type: task_type.into(),
            handler,
            message: None,
            deferred: None,
        }
    }

    /// Publish the handler's variables to `message`.
    pub fn with_message(mut self, message: MessageSpec) -> Self {
        self.message = Some(message);
        self
    }

    /// Run `effect` after each completion.
    pub fn with_deferred(mut self, effect: Arc<dyn DeferredEffect>) -> Self {
        self.deferred = Some(effect);
        self
    }
}

impl std::fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDefinition")
            .field("task_type", &self.task_type)
            .field("message", &self.message)
            .field("deferred", &self.deferred.is_some())
            .finish()
    }
}
