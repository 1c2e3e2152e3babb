//! The per-task-type worker loop.
//!
//! ```text
//! Subscribed → AwaitingVariables? → AwaitingDeferred? → AwaitingCompletion → Resubscribing ─┐
//!     ↑                                                                                     │
//!     └─────────────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The engine subscription is opened once. Each iteration builds fresh
//! signal slots and arms them; the next job delivered by the engine claims
//! them. Jobs delivered while an iteration is already claimed queue until the
//! loop re-arms, so at most one job per task type is in flight.

use crate::control::JobControl;
use crate::correlator::MessageCorrelator;
use crate::definition::{JobDefinition, JobHandler};
use crate::error::WorkerError;
use crate::registry::TaskRegistry;
use crate::signals::JobSignals;
use async_trait::async_trait;
use jobsync_core::{ActivatedJob, TaskType};
use jobsync_engine::{EngineClient, JobCallback};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

/// Where a worker loop currently waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Subscribed, about to arm an iteration
    Subscribed,
    /// Waiting for the handler's variable bundle
    AwaitingVariables,
    /// Waiting for the deferred-effect trigger
    AwaitingDeferred,
    /// Waiting on the completion gate
    AwaitingCompletion,
    /// Iteration done, re-arming
    Resubscribing,
    /// Loop ended after a shutdown request
    Stopped,
}

impl WorkerState {
    /// Whether the loop is parked on a signal slot.
    pub fn is_awaiting(&self) -> bool {
        matches!(
            self,
            WorkerState::AwaitingVariables
                | WorkerState::AwaitingDeferred
                | WorkerState::AwaitingCompletion
        )
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::Subscribed => write!(f, "subscribed"),
            WorkerState::AwaitingVariables => write!(f, "awaiting-variables"),
            WorkerState::AwaitingDeferred => write!(f, "awaiting-deferred"),
            WorkerState::AwaitingCompletion => write!(f, "awaiting-completion"),
            WorkerState::Resubscribing => write!(f, "resubscribing"),
            WorkerState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Snapshot published by a worker loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStatus {
    /// Current state
    pub state: WorkerState,
    /// Iterations that ended with a completion signal
    pub iterations: u64,
    /// Iterations abandoned because the job's signals were dropped
    pub abandoned: u64,
}

/// Per-task-type context shared with the engine callback.
///
/// Owned by one worker loop; the only thing the callback can do with it is
/// claim the currently armed iteration.
struct TaskContext {
    task_type: TaskType,
    armed: Mutex<mpsc::Receiver<JobSignals>>,
}

impl TaskContext {
    /// Wait for the loop to arm an iteration and claim it.
    ///
    /// Concurrent callers queue on the lock in arrival order. Slots the loop
    /// abandoned are discarded; `None` once the loop has stopped.
    async fn admit(&self) -> Option<JobSignals> {
        let mut armed = self.armed.lock().await;
        while let Some(signals) = armed.recv().await {
            if signals.is_live() {
                return Some(signals);
            }
            debug!(task_type = %self.task_type, "Discarding abandoned iteration");
        }
        None
    }
}

/// Engine callback binding delivered jobs to the domain handler.
struct Dispatcher {
    context: TaskContext,
    handler: Arc<dyn JobHandler>,
    client: Arc<dyn EngineClient>,
}

#[async_trait]
impl JobCallback for Dispatcher {
    async fn on_job(&self, job: ActivatedJob) {
        let Some(signals) = self.context.admit().await else {
            warn!(
                task_type = %self.context.task_type,
                job_key = %job.key,
                "Worker stopped, leaving job to the engine timeout"
            );
            return;
        };

        debug!(task_type = %job.task_type, job_key = %job.key, "Admitted job");
        let control = JobControl::new(Arc::clone(&self.client), &job, signals);
        self.handler.handle(job, control).await;
    }
}

/// Worker loop for one task type.
pub struct Worker {
    definition: JobDefinition,
    client: Arc<dyn EngineClient>,
    registry: Arc<TaskRegistry>,
    correlator: MessageCorrelator,
    status: watch::Sender<WorkerStatus>,
}

impl Worker {
    /// Create a worker; nothing happens until [`Worker::run`].
    pub fn new(
        definition: JobDefinition,
        client: Arc<dyn EngineClient>,
        registry: Arc<TaskRegistry>,
    ) -> Self {
        let (status, _) = watch::channel(WorkerStatus {
            state: WorkerState::Subscribed,
            iterations: 0,
            abandoned: 0,
        });
        Self {
            definition,
            correlator: MessageCorrelator::new(Arc::clone(&client)),
            client,
            registry,
            status,
        }
    }

    /// Task type served by this worker.
    pub fn task_type(&self) -> &TaskType {
        &self.definition.task_type
    }

    /// Watch the loop's state.
    pub fn status(&self) -> watch::Receiver<WorkerStatus> {
        self.status.subscribe()
    }

    fn set_state(&self, state: WorkerState) {
        self.status.send_modify(|status| status.state = state);
    }

    /// Subscribe and serve jobs until `shutdown` changes.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), WorkerError> {
        let task_type = self.definition.task_type.clone();
        let (arm_tx, arm_rx) = mpsc::channel(1);

        let dispatcher = Arc::new(Dispatcher {
            context: TaskContext {
                task_type: task_type.clone(),
                armed: Mutex::new(arm_rx),
            },
            handler: Arc::clone(&self.definition.handler),
            client: Arc::clone(&self.client),
        });

        let subscription = self
            .client
            .subscribe(&task_type, dispatcher)
            .await
            .map_err(|source| WorkerError::Subscribe {
                task_type: task_type.clone(),
                source,
            })?;
        info!(task_type = %task_type, subscription = %subscription.id, "Worker subscribed");

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_state(WorkerState::Subscribed);

            let result = tokio::select! {
                result = self.run_iteration(&arm_tx) => result,
                _ = shutdown.changed() => break,
            };

            match result {
                Ok(()) => {
                    self.status.send_modify(|status| {
                        status.iterations += 1;
                        status.state = WorkerState::Resubscribing;
                    });
                }
                Err(WorkerError::Disarmed(_)) => {
                    error!(task_type = %task_type, "Engine dropped the job callback");
                    break;
                }
                Err(e) => {
                    error!(task_type = %task_type, "Iteration abandoned: {}", e);
                    self.status.send_modify(|status| status.abandoned += 1);
                }
            }
        }

        drop(arm_tx);
        self.registry.remove(&task_type).await;
        self.set_state(WorkerState::Stopped);
        info!(task_type = %task_type, "Worker stopped");
        Ok(())
    }

    /// One job instance: arm, then drain variables, trigger and completion.
    async fn run_iteration(&self, arm_tx: &mpsc::Sender<JobSignals>) -> Result<(), WorkerError> {
        let task_type = &self.definition.task_type;

        let (signals, mut pending) = JobSignals::channel(task_type.clone());
        if let Some(gate) = signals.gate() {
            self.registry.set(gate).await;
        }
        arm_tx
            .send(signals)
            .await
            .map_err(|_| WorkerError::Disarmed(task_type.clone()))?;

        if let Some(spec) = &self.definition.message {
            self.set_state(WorkerState::AwaitingVariables);
            match pending.variables.recv().await {
                Some(variables) => {
                    // Outcome is logged by the correlator; the loop moves on either way.
                    let _ = self.correlator.correlate(spec, variables).await;
                }
                None => warn!(
                    task_type = %task_type,
                    "Job ended without variables, skipping message {}",
                    spec
                ),
            }
        }

        if let Some(effect) = &self.definition.deferred {
            self.set_state(WorkerState::AwaitingDeferred);
            match pending.deferred.recv().await {
                Some(context) => {
                    if let Err(e) = effect.run(self.client.as_ref(), &context).await {
                        error!(
                            task_type = %task_type,
                            job_key = %context.job_key,
                            "Deferred effect failed: {}",
                            e
                        );
                    }
                }
                None => warn!(task_type = %task_type, "Job ended without triggering its deferred effect"),
            }
        }

        self.set_state(WorkerState::AwaitingCompletion);
        let signal = pending
            .completion
            .recv()
            .await
            .ok_or_else(|| WorkerError::GateClosed(task_type.clone()))?;
        debug!(task_type = %task_type, "Completion signal: {}", signal);

        if let Some(pid) = signal.cancel_target() {
            match self.client.cancel_process_instance(pid).await {
                Ok(()) => info!(task_type = %task_type, process_instance_key = %pid, "Cancelled process instance"),
                Err(e) => error!(
                    task_type = %task_type,
                    process_instance_key = %pid,
                    "Error canceling the instance: {}",
                    e
                ),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deferred::{FixedResponse, PublishResponse};
    use jobsync_core::{variables_from, MessageSpec, ProcessInstanceKey, Variables};
    use jobsync_engine::{EngineCall, EngineOp, InMemoryEngine};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;
    use tokio::task::JoinHandle;

    const WAIT: Duration = Duration::from_secs(2);

    /// Completes with the job's own variables.
    struct Echo {
        cancel: bool,
    }

    #[async_trait]
    impl JobHandler for Echo {
        async fn handle(&self, job: ActivatedJob, control: JobControl) {
            let result = if self.cancel {
                control.complete_and_cancel(job.variables).await
            } else {
                control.complete(job.variables).await
            };
            result.unwrap();
        }
    }

    struct Fail;

    #[async_trait]
    impl JobHandler for Fail {
        async fn handle(&self, _job: ActivatedJob, control: JobControl) {
            control.fail().await.unwrap();
        }
    }

    /// Holds on to its control and never finishes.
    struct Stall;

    #[async_trait]
    impl JobHandler for Stall {
        async fn handle(&self, _job: ActivatedJob, control: JobControl) {
            let _control = control;
            std::future::pending::<()>().await;
        }
    }

    /// Drops the control on first use, completes afterwards.
    struct DropOnce {
        dropped: AtomicBool,
    }

    #[async_trait]
    impl JobHandler for DropOnce {
        async fn handle(&self, job: ActivatedJob, control: JobControl) {
            if !self.dropped.swap(true, Ordering::SeqCst) {
                drop(control);
                return;
            }
            control.complete(job.variables).await.unwrap();
        }
    }

    /// Reports its start, then waits for a permit before completing.
    struct Gated {
        started: mpsc::UnboundedSender<ActivatedJob>,
        release: Arc<Semaphore>,
    }

    #[async_trait]
    impl JobHandler for Gated {
        async fn handle(&self, job: ActivatedJob, control: JobControl) {
            self.started.send(job.clone()).unwrap();
            self.release.acquire().await.unwrap().forget();
            control.complete(job.variables).await.unwrap();
        }
    }

    struct Running {
        status: watch::Receiver<WorkerStatus>,
        shutdown: watch::Sender<bool>,
        handle: JoinHandle<Result<(), WorkerError>>,
    }

    async fn start(engine: &Arc<InMemoryEngine>, definition: JobDefinition) -> Running {
        let worker = Worker::new(definition, engine.clone(), Arc::new(TaskRegistry::new()));
        let mut status = worker.status();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(shutdown_rx));

        tokio::time::timeout(WAIT, status.wait_for(|s| s.state.is_awaiting()))
            .await
            .unwrap()
            .unwrap();
        Running { status, shutdown, handle }
    }

    async fn wait_iterations(status: &mut watch::Receiver<WorkerStatus>, n: u64) {
        tokio::time::timeout(WAIT, status.wait_for(|s| s.iterations >= n))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_plain_task_rearms_without_publish_or_cancel() {
        let engine = Arc::new(InMemoryEngine::new());
        let mut running = start(&engine, JobDefinition::new("X", Arc::new(Echo { cancel: false }))).await;

        let key = engine
            .activate("X", ProcessInstanceKey(9), Variables::new())
            .await
            .unwrap();
        wait_iterations(&mut running.status, 1).await;

        assert_eq!(
            engine.calls().await,
            vec![EngineCall::Completed { key, variables: Variables::new() }]
        );
        running
            .status
            .wait_for(|s| s.state == WorkerState::AwaitingCompletion)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_message_published_once_then_instance_cancelled() {
        let engine = Arc::new(InMemoryEngine::new());
        let definition = JobDefinition::new("Y", Arc::new(Echo { cancel: true }))
            .with_message(MessageSpec::new("M", "0"));
        let mut running = start(&engine, definition).await;
        assert_eq!(running.status.borrow().state, WorkerState::AwaitingVariables);

        let key = engine
            .activate("Y", ProcessInstanceKey(42), variables_from(json!({"a": 1})))
            .await
            .unwrap();
        wait_iterations(&mut running.status, 1).await;

        assert_eq!(
            engine.calls().await,
            vec![
                EngineCall::Completed { key, variables: variables_from(json!({"a": 1})) },
                EngineCall::Published {
                    message: MessageSpec::new("M", "0"),
                    variables: variables_from(json!({"a": 1})),
                },
                EngineCall::Cancelled { key: ProcessInstanceKey(42) },
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_variables_parks_the_loop() {
        let engine = Arc::new(InMemoryEngine::new());
        let definition = JobDefinition::new("Z", Arc::new(Stall))
            .with_message(MessageSpec::new("M", "0"));
        let running = start(&engine, definition).await;

        engine
            .activate("Z", ProcessInstanceKey(1), Variables::new())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let status = *running.status.borrow();
        assert_eq!(status.state, WorkerState::AwaitingVariables);
        assert_eq!(status.iterations, 0);
        assert!(engine.calls().await.is_empty());
        assert!(!running.handle.is_finished());
    }

    #[tokio::test]
    async fn test_deferred_effect_runs_between_publish_and_cancel() {
        let engine = Arc::new(InMemoryEngine::new());
        let effect = PublishResponse::new(
            MessageSpec::new("CM_Payment_Response", "0"),
            FixedResponse(variables_from(json!({"payment_status": "ERR"}))),
        );
        let definition = JobDefinition::new("TM_Ask_Payment_Link", Arc::new(Echo { cancel: true }))
            .with_message(MessageSpec::new("CM_Received_Bank_Link", "0"))
            .with_deferred(Arc::new(effect));
        let mut running = start(&engine, definition).await;

        engine
            .activate("TM_Ask_Payment_Link", ProcessInstanceKey(5), Variables::new())
            .await
            .unwrap();
        wait_iterations(&mut running.status, 1).await;

        let calls = engine.calls().await;
        let names: Vec<_> = calls
            .iter()
            .map(|call| match call {
                EngineCall::Completed { .. } => "complete".to_string(),
                EngineCall::Published { message, .. } => message.name.clone(),
                EngineCall::Cancelled { .. } => "cancel".to_string(),
                other => format!("{:?}", other),
            })
            .collect();
        assert_eq!(
            names,
            vec!["complete", "CM_Received_Bank_Link", "CM_Payment_Response", "cancel"]
        );
    }

    #[tokio::test]
    async fn test_failed_job_skips_message_and_cancels_instance() {
        let engine = Arc::new(InMemoryEngine::new());
        let definition = JobDefinition::new("Y", Arc::new(Fail))
            .with_message(MessageSpec::new("M", "0"));
        let mut running = start(&engine, definition).await;

        let key = engine
            .activate("Y", ProcessInstanceKey(77), Variables::new())
            .await
            .unwrap();
        wait_iterations(&mut running.status, 1).await;

        assert_eq!(
            engine.calls().await,
            vec![
                EngineCall::Failed { key, retries: 0 },
                EngineCall::Cancelled { key: ProcessInstanceKey(77) },
            ]
        );
    }

    #[tokio::test]
    async fn test_publish_failure_does_not_stop_the_loop() {
        let engine = Arc::new(InMemoryEngine::new());
        engine.set_failing(EngineOp::Publish, true).await;
        let definition = JobDefinition::new("Y", Arc::new(Echo { cancel: true }))
            .with_message(MessageSpec::new("M", "0"));
        let mut running = start(&engine, definition).await;

        engine
            .activate("Y", ProcessInstanceKey(3), Variables::new())
            .await
            .unwrap();
        wait_iterations(&mut running.status, 1).await;

        assert_eq!(engine.published().await.len(), 1);
        assert!(engine
            .calls()
            .await
            .contains(&EngineCall::Cancelled { key: ProcessInstanceKey(3) }));
    }

    #[tokio::test]
    async fn test_dropped_control_abandons_iteration() {
        let engine = Arc::new(InMemoryEngine::new());
        let handler = DropOnce { dropped: AtomicBool::new(false) };
        let definition = JobDefinition::new("Y", Arc::new(handler))
            .with_message(MessageSpec::new("M", "0"));
        let mut running = start(&engine, definition).await;

        engine
            .activate("Y", ProcessInstanceKey(1), Variables::new())
            .await
            .unwrap();
        tokio::time::timeout(WAIT, running.status.wait_for(|s| s.abandoned == 1))
            .await
            .unwrap()
            .unwrap();
        assert!(engine.published().await.is_empty());

        engine
            .activate("Y", ProcessInstanceKey(2), variables_from(json!({"b": 2})))
            .await
            .unwrap();
        wait_iterations(&mut running.status, 1).await;
        assert_eq!(engine.published().await.len(), 1);
    }

    #[tokio::test]
    async fn test_overlapping_jobs_are_admitted_one_at_a_time() {
        let engine = Arc::new(InMemoryEngine::new());
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let release = Arc::new(Semaphore::new(0));
        let handler = Gated {
            started: started_tx,
            release: Arc::clone(&release),
        };
        let mut running = start(&engine, JobDefinition::new("X", Arc::new(handler))).await;

        engine.activate("X", ProcessInstanceKey(1), Variables::new()).await.unwrap();
        engine.activate("X", ProcessInstanceKey(2), Variables::new()).await.unwrap();

        let first = tokio::time::timeout(WAIT, started_rx.recv()).await.unwrap().unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(100), started_rx.recv())
                .await
                .is_err(),
            "second job admitted while the first was in flight"
        );

        release.add_permits(1);
        let second = tokio::time::timeout(WAIT, started_rx.recv()).await.unwrap().unwrap();
        assert_ne!(first.key, second.key);
        wait_iterations(&mut running.status, 1).await;

        release.add_permits(1);
        wait_iterations(&mut running.status, 2).await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_a_parked_loop() {
        let engine = Arc::new(InMemoryEngine::new());
        let mut running = start(&engine, JobDefinition::new("X", Arc::new(Stall))).await;

        running.shutdown.send(true).unwrap();
        tokio::time::timeout(WAIT, running.handle).await.unwrap().unwrap().unwrap();
        running
            .status
            .wait_for(|s| s.state == WorkerState::Stopped)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stopped_worker_leaves_late_jobs_to_the_engine() {
        let engine = Arc::new(InMemoryEngine::new());
        let definition = JobDefinition::new("Y", Arc::new(Echo { cancel: true }))
            .with_message(MessageSpec::new("M", "0"));
        let running = start(&engine, definition).await;
        assert_eq!(running.status.borrow().state, WorkerState::AwaitingVariables);

        running.shutdown.send(true).unwrap();
        tokio::time::timeout(WAIT, running.handle).await.unwrap().unwrap().unwrap();

        engine
            .activate("Y", ProcessInstanceKey(1), variables_from(json!({"a": 1})))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(engine.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_subscription_fails_the_worker() {
        let engine = Arc::new(InMemoryEngine::new());
        let _running = start(&engine, JobDefinition::new("X", Arc::new(Stall))).await;

        let second = Worker::new(
            JobDefinition::new("X", Arc::new(Stall)),
            engine.clone(),
            Arc::new(TaskRegistry::new()),
        );
        let (_tx, rx) = watch::channel(false);
        assert!(matches!(
            second.run(rx).await,
            Err(WorkerError::Subscribe { .. })
        ));
    }
}
