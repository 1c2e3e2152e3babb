//! Handlers used when the binary runs without domain code.

use crate::config::{Outcome, WorkerConfig};
use async_trait::async_trait;
use jobsync_core::{ActivatedJob, MessageSpec};
use jobsync_worker::{FixedResponse, JobControl, JobDefinition, JobHandler, PublishResponse};
use std::sync::Arc;
use tracing::{error, info};

/// Echoes the job's variables back and finishes with a fixed outcome.
pub struct SimulatedHandler {
    outcome: Outcome,
}

impl SimulatedHandler {
    pub fn new(outcome: Outcome) -> Self {
        Self { outcome }
    }
}

#[async_trait]
impl JobHandler for SimulatedHandler {
    async fn handle(&self, job: ActivatedJob, control: JobControl) {
        info!(
            task_type = %job.task_type,
            job_key = %job.key,
            process_instance_key = %job.process_instance_key,
            "Handling job"
        );

        let result = match self.outcome {
            Outcome::Complete => control.complete(job.variables).await,
            Outcome::CompleteAndCancel => control.complete_and_cancel(job.variables).await,
            Outcome::Fail => control.fail().await,
        };
        if let Err(e) = result {
            error!(task_type = %job.task_type, job_key = %job.key, "Job signals lost: {}", e);
        }
    }
}

/// Build the job definition of one configured worker.
pub fn definition(config: &WorkerConfig) -> JobDefinition {
    let mut definition = JobDefinition::new(
        config.task_type.as_str(),
        Arc::new(SimulatedHandler::new(config.outcome)),
    );
    if let Some(message) = &config.message {
        definition = definition.with_message(MessageSpec::from(message));
    }
    if let Some(deferred) = &config.deferred {
        let effect = PublishResponse::new(
            MessageSpec::from(&deferred.message),
            FixedResponse(deferred.response.clone()),
        );
        definition = definition.with_deferred(Arc::new(effect));
    }
    definition
}
