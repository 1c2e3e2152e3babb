//! Runs one worker loop per job definition and stops them together.

use crate::definition::JobDefinition;
use crate::error::WorkerError;
use crate::registry::TaskRegistry;
use crate::worker::{Worker, WorkerStatus};
use jobsync_core::TaskType;
use jobsync_engine::EngineClient;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

struct WorkerHandle {
    task_type: TaskType,
    status: watch::Receiver<WorkerStatus>,
    join: JoinHandle<Result<(), WorkerError>>,
}

/// Set of running worker loops sharing one engine client and registry.
pub struct WorkerPool {
    client: Arc<dyn EngineClient>,
    registry: Arc<TaskRegistry>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<WorkerHandle>,
}

impl WorkerPool {
    /// Create an empty pool.
    pub fn new(client: Arc<dyn EngineClient>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            client,
            registry: Arc::new(TaskRegistry::new()),
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    /// Registry of completion gates shared by every loop in the pool.
    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Start the worker loop for `definition`.
    pub fn spawn(&mut self, definition: JobDefinition) -> Result<(), WorkerError> {
        if self
            .handles
            .iter()
            .any(|h| h.task_type == definition.task_type)
        {
            return Err(WorkerError::DuplicateTaskType(definition.task_type));
        }

        let task_type = definition.task_type.clone();
        let worker = Worker::new(definition, Arc::clone(&self.client), Arc::clone(&self.registry));
        let status = worker.status();
        let join = tokio::spawn(worker.run(self.shutdown_tx.subscribe()));

        info!(task_type = %task_type, "Spawned worker");
        self.handles.push(WorkerHandle {
            task_type,
            status,
            join,
        });
        Ok(())
    }

    /// Number of spawned loops.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether no loop was spawned.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Current status of every loop, keyed by task type.
    pub fn statuses(&self) -> BTreeMap<TaskType, WorkerStatus> {
        self.handles
            .iter()
            .map(|h| (h.task_type.clone(), *h.status.borrow()))
            .collect()
    }

    /// Watch the status of one loop.
    pub fn status(&self, task_type: &TaskType) -> Option<watch::Receiver<WorkerStatus>> {
        self.handles
            .iter()
            .find(|h| &h.task_type == task_type)
            .map(|h| h.status.clone())
    }

    /// Stop every loop and wait for them to exit.
    ///
    /// Returns the first error any loop ended with; every loop is joined
    /// regardless.
    pub async fn shutdown(self) -> Result<(), WorkerError> {
        info!(workers = self.handles.len(), "Shutting down workers");
        // Receivers are held by the loops, so a send error only means every loop already exited.
        let _ = self.shutdown_tx.send(true);

        let mut first_error = None;
        for handle in self.handles {
            let result = match handle.join.await {
                Ok(result) => result,
                Err(e) => Err(WorkerError::Aborted {
                    task_type: handle.task_type.clone(),
                    message: e.to_string(),
                }),
            };
            if let Err(e) = result {
                error!(task_type = %handle.task_type, "Worker ended with error: {}", e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::JobControl;
    use crate::definition::JobHandler;
    use crate::worker::WorkerState;
    use async_trait::async_trait;
    use jobsync_core::{ActivatedJob, CompletionSignal, ProcessInstanceKey, Variables};
    use jobsync_engine::{EngineCall, InMemoryEngine};
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl JobHandler for Echo {
        async fn handle(&self, job: ActivatedJob, control: JobControl) {
            control.complete(job.variables).await.unwrap();
        }
    }

    /// Keeps the job open until the registry closes it from outside.
    struct Hold;

    #[async_trait]
    impl JobHandler for Hold {
        async fn handle(&self, job: ActivatedJob, control: JobControl) {
            let _ = control.client().complete_job(job.key, Variables::new()).await;
            let _control = control;
            std::future::pending::<()>().await;
        }
    }

    async fn wait_until_awaiting(pool: &WorkerPool, task_type: &str) {
        let mut status = pool.status(&TaskType::from(task_type)).unwrap();
        tokio::time::timeout(Duration::from_secs(2), status.wait_for(|s| s.state.is_awaiting()))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_spawn_rejects_duplicate_task_type() {
        let engine = Arc::new(InMemoryEngine::new());
        let mut pool = WorkerPool::new(engine);

        pool.spawn(JobDefinition::new("X", Arc::new(Echo))).unwrap();
        let err = pool
            .spawn(JobDefinition::new("X", Arc::new(Echo)))
            .unwrap_err();
        assert!(matches!(err, WorkerError::DuplicateTaskType(t) if t.as_str() == "X"));
        assert_eq!(pool.len(), 1);

        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_loops_are_independent() {
        let engine = Arc::new(InMemoryEngine::new());
        let mut pool = WorkerPool::new(engine.clone());
        pool.spawn(JobDefinition::new("A", Arc::new(Hold))).unwrap();
        pool.spawn(JobDefinition::new("B", Arc::new(Echo))).unwrap();
        wait_until_awaiting(&pool, "A").await;
        wait_until_awaiting(&pool, "B").await;

        engine.activate("A", ProcessInstanceKey(1), Variables::new()).await.unwrap();
        engine.activate("B", ProcessInstanceKey(2), Variables::new()).await.unwrap();

        let mut b = pool.status(&TaskType::from("B")).unwrap();
        tokio::time::timeout(Duration::from_secs(2), b.wait_for(|s| s.iterations == 1))
            .await
            .unwrap()
            .unwrap();

        let statuses = pool.statuses();
        assert_eq!(statuses[&TaskType::from("A")].iterations, 0);
        assert_eq!(statuses[&TaskType::from("A")].state, WorkerState::AwaitingCompletion);

        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_registry_close_releases_a_held_job() {
        let engine = Arc::new(InMemoryEngine::new());
        let mut pool = WorkerPool::new(engine.clone());
        pool.spawn(JobDefinition::new("A", Arc::new(Hold))).unwrap();
        wait_until_awaiting(&pool, "A").await;

        engine.activate("A", ProcessInstanceKey(8), Variables::new()).await.unwrap();
        assert!(engine.wait_for_calls(1, Duration::from_secs(2)).await);

        pool.registry()
            .close(&TaskType::from("A"), CompletionSignal::Cancel(ProcessInstanceKey(8)))
            .await
            .unwrap();

        let mut status = pool.status(&TaskType::from("A")).unwrap();
        tokio::time::timeout(Duration::from_secs(2), status.wait_for(|s| s.iterations == 1))
            .await
            .unwrap()
            .unwrap();
        assert!(engine
            .calls()
            .await
            .contains(&EngineCall::Cancelled { key: ProcessInstanceKey(8) }));

        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_every_loop() {
        let engine = Arc::new(InMemoryEngine::new());
        let mut pool = WorkerPool::new(engine);
        pool.spawn(JobDefinition::new("A", Arc::new(Echo))).unwrap();
        pool.spawn(JobDefinition::new("B", Arc::new(Echo))).unwrap();
        wait_until_awaiting(&pool, "A").await;

        let mut a = pool.status(&TaskType::from("A")).unwrap();
        let registry = Arc::clone(pool.registry());
        pool.shutdown().await.unwrap();

        assert_eq!(a.borrow_and_update().state, WorkerState::Stopped);
        assert!(registry.task_types().await.is_empty());
    }
}
