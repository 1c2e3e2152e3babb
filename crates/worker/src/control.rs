//! Job control handed to domain handlers.
//!
//! Every handler invocation ends in exactly one of [`JobControl::complete`],
//! [`JobControl::complete_with`] or [`JobControl::fail`]. Each consumes the
//! control, so the completion signal cannot be sent twice.

use crate::deferred::EffectContext;
use crate::error::SignalError;
use crate::signals::JobSignals;
use jobsync_core::{ActivatedJob, CompletionSignal, JobKey, ProcessInstanceKey, TaskType, Variables};
use jobsync_engine::EngineClient;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Retries handed to `fail_job`. The engine never re-delivers a failed job
/// on its own; resubmission is an operator decision.
pub const FAIL_RETRIES: u32 = 0;

/// How a job instance ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The engine accepted the completion
    Completed,
    /// The job was failed
    Failed,
}

/// Engine access plus the claimed iteration's signal slots.
pub struct JobControl {
    client: Arc<dyn EngineClient>,
    task_type: TaskType,
    job_key: JobKey,
    process_instance_key: ProcessInstanceKey,
    signals: JobSignals,
}

impl JobControl {
    /// Bind a job to the signals of the iteration it was admitted into.
    pub fn new(client: Arc<dyn EngineClient>, job: &ActivatedJob, signals: JobSignals) -> Self {
        Self {
            client,
            task_type: job.task_type.clone(),
            job_key: job.key,
            process_instance_key: job.process_instance_key,
            signals,
        }
    }

    /// Engine client, for handlers that need extra requests.
    pub fn client(&self) -> &Arc<dyn EngineClient> {
        &self.client
    }

    /// Key of the controlled job.
    pub fn job_key(&self) -> JobKey {
        self.job_key
    }

    /// Complete the job; the worker loop takes no further action.
    pub async fn complete(self, variables: Variables) -> Result<JobOutcome, SignalError> {
        self.complete_with(variables, CompletionSignal::Done).await
    }

    /// Complete the job and cancel its own process instance afterwards.
    pub async fn complete_and_cancel(self, variables: Variables) -> Result<JobOutcome, SignalError> {
        let signal = CompletionSignal::Cancel(self.process_instance_key);
        self.complete_with(variables, signal).await
    }

    /// Complete the job, then release the correlator, the deferred effect
    /// and finally the completion gate.
    ///
    /// If the engine rejects the completion the job is failed instead.
    pub async fn complete_with(
        mut self,
        variables: Variables,
        signal: CompletionSignal,
    ) -> Result<JobOutcome, SignalError> {
        debug!(task_type = %self.task_type, job_key = %self.job_key, "Processing data: {:?}", variables);

        if let Err(e) = self.client.complete_job(self.job_key, variables.clone()).await {
            error!(
                task_type = %self.task_type,
                job_key = %self.job_key,
                "Complete request failed: {}",
                e
            );
            return self.fail().await;
        }
        info!(task_type = %self.task_type, job_key = %self.job_key, "Successfully completed job");

        self.signals.send_variables(variables).await?;
        let context = EffectContext {
            task_type: self.task_type.clone(),
            job_key: self.job_key,
            process_instance_key: self.process_instance_key,
        };
        self.signals.trigger_deferred(context).await?;
        self.signals.complete(signal).await?;
        Ok(JobOutcome::Completed)
    }

    /// Fail the job with no engine retries and cancel its process instance.
    pub async fn fail(mut self) -> Result<JobOutcome, SignalError> {
        error!(task_type = %self.task_type, job_key = %self.job_key, "Failed to complete job");

        if let Err(e) = self.client.fail_job(self.job_key, FAIL_RETRIES).await {
            error!(
                task_type = %self.task_type,
                job_key = %self.job_key,
                "Fail request failed: {}",
                e
            );
        }

        self.signals
            .complete(CompletionSignal::Cancel(self.process_instance_key))
            .await?;
        Ok(JobOutcome::Failed)
    }
}
