//! Deferred effects run after a job was completed but before the worker
//! loop takes its completion signal.
//!
//! An effect stands in for an external participant answering the process
//! (a bank, a rental company). The answer itself comes from a
//! [`ResponseSource`], so a simulated participant can be swapped for a real
//! one without touching the worker loop.

use async_trait::async_trait;
use jobsync_core::{JobKey, MessageSpec, ProcessInstanceKey, TaskType, Variables};
use jobsync_engine::{EngineClient, EngineError};
use tracing::info;

/// Process context handed to a deferred effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectContext {
    /// Task type whose job triggered the effect
    pub task_type: TaskType,
    /// Completed job
    pub job_key: JobKey,
    /// Owning process instance
    pub process_instance_key: ProcessInstanceKey,
}

/// Side effect executed once per job instance, after completion.
#[async_trait]
pub trait DeferredEffect: Send + Sync {
    /// Run the effect. Errors are logged by the caller and never propagated.
    async fn run(&self, client: &dyn EngineClient, context: &EffectContext)
        -> Result<(), EngineError>;
}

/// Produces the variables an external participant answers with.
pub trait ResponseSource: Send + Sync {
    /// Build the response for one job instance.
    fn response(&self, context: &EffectContext) -> Variables;
}

impl<F> ResponseSource for F
where
    F: Fn(&EffectContext) -> Variables + Send + Sync,
{
    fn response(&self, context: &EffectContext) -> Variables {
        self(context)
    }
}

/// Always answers with the same variables.
#[derive(Debug, Clone, Default)]
pub struct FixedResponse(pub Variables);

impl ResponseSource for FixedResponse {
    fn response(&self, _context: &EffectContext) -> Variables {
        self.0.clone()
    }
}

/// Publishes a participant's response to a fixed message address.
pub struct PublishResponse<R: ResponseSource> {
    message: MessageSpec,
    source: R,
}

impl<R: ResponseSource> PublishResponse<R> {
    /// Publish whatever `source` answers to `message`.
    pub fn new(message: MessageSpec, source: R) -> Self {
        Self { message, source }
    }
}

#[async_trait]
impl<R: ResponseSource> DeferredEffect for PublishResponse<R> {
    async fn run(
        &self,
        client: &dyn EngineClient,
        context: &EffectContext,
    ) -> Result<(), EngineError> {
        let variables = self.source.response(context);
        client.publish_message(&self.message, variables).await?;
        info!(
            task_type = %context.task_type,
            job_key = %context.job_key,
            message = %self.message.name,
            correlation_key = %self.message.correlation_key,
            "Sent deferred response"
        );
        Ok(())
    }
}
