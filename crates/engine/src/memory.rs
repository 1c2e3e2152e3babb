//! In-memory engine that journals every request.
//!
//! Used by the simulator and by tests. Jobs are pushed in with
//! [`InMemoryEngine::activate`] and delivered to the subscribed callback on a
//! freshly spawned task, the same way a gateway's job poller would.

use crate::client::{EngineClient, EngineError, JobCallback, Result, Subscription};
use async_trait::async_trait;
use jobsync_core::{
    ActivatedJob, JobKey, MessageSpec, ProcessInstanceKey, SubscriptionId, TaskType, Variables,
};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// A request received by the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum EngineCall {
    /// `deploy_resource`
    Deployed { resource: PathBuf },
    /// `create_process_instance`
    InstanceCreated {
        process_id: String,
        key: ProcessInstanceKey,
        variables: Variables,
    },
    /// `complete_job`
    Completed { key: JobKey, variables: Variables },
    /// `fail_job`
    Failed { key: JobKey, retries: u32 },
    /// `publish_message`
    Published {
        message: MessageSpec,
        variables: Variables,
    },
    /// `cancel_process_instance`
    Cancelled { key: ProcessInstanceKey },
}

/// Requests that can be made to fail on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineOp {
    /// `complete_job`
    Complete,
    /// `fail_job`
    Fail,
    /// `publish_message`
    Publish,
    /// `cancel_process_instance`
    Cancel,
}

#[derive(Default)]
struct State {
    subscriptions: HashMap<TaskType, (SubscriptionId, Arc<dyn JobCallback>)>,
    active_jobs: HashSet<JobKey>,
    cancelled: HashSet<ProcessInstanceKey>,
    failing: HashSet<EngineOp>,
    journal: Vec<EngineCall>,
}

/// Journaling engine kept entirely in memory.
pub struct InMemoryEngine {
    state: Arc<Mutex<State>>,
    next_key: AtomicI64,
}

impl InMemoryEngine {
    /// Create an empty engine.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            next_key: AtomicI64::new(1),
        }
    }

    fn next_key(&self) -> i64 {
        self.next_key.fetch_add(1, Ordering::SeqCst)
    }

    /// Make every subsequent request of `op` fail (or succeed again).
    pub async fn set_failing(&self, op: EngineOp, failing: bool) {
        let mut state = self.state.lock().await;
        if failing {
            state.failing.insert(op);
        } else {
            state.failing.remove(&op);
        }
    }

    /// Activate a new job for `task_type` and deliver it to the subscriber.
    pub async fn activate(
        &self,
        task_type: impl Into<TaskType>,
        process_instance_key: ProcessInstanceKey,
        variables: Variables,
    ) -> Result<JobKey> {
        let key = JobKey(self.next_key());
        let job = ActivatedJob::new(key, task_type, process_instance_key, variables);
        self.dispatch(job).await?;
        Ok(key)
    }

    /// Deliver an already-built job to the subscriber of its task type.
    pub async fn dispatch(&self, job: ActivatedJob) -> Result<()> {
        let callback = {
            let mut state = self.state.lock().await;
            let Some((_, callback)) = state.subscriptions.get(&job.task_type) else {
                return Err(EngineError::NoSubscription(job.task_type.clone()));
            };
            let callback = Arc::clone(callback);
            state.active_jobs.insert(job.key);
            callback
        };

        debug!(task_type = %job.task_type, job_key = %job.key, "Dispatching job");
        tokio::spawn(async move {
            callback.on_job(job).await;
        });
        Ok(())
    }

    /// Snapshot of every request received so far.
    pub async fn calls(&self) -> Vec<EngineCall> {
        self.state.lock().await.journal.clone()
    }

    /// Messages published so far, in order.
    pub async fn published(&self) -> Vec<(MessageSpec, Variables)> {
        self.calls()
            .await
            .into_iter()
            .filter_map(|call| match call {
                EngineCall::Published { message, variables } => Some((message, variables)),
                _ => None,
            })
            .collect()
    }

    /// Poll until at least `count` requests were journaled or `timeout` elapses.
    pub async fn wait_for_calls(&self, count: usize, timeout: Duration) -> bool {
        let start = Instant::now();
        let sleep_duration = Duration::from_millis(10);

        while start.elapsed() < timeout {
            if self.state.lock().await.journal.len() >= count {
                return true;
            }
            tokio::time::sleep(sleep_duration).await;
        }

        false
    }

    async fn record(&self, op: Option<EngineOp>, call: EngineCall) -> Result<()> {
        let mut state = self.state.lock().await;
        state.journal.push(call);
        match op {
            Some(op) if state.failing.contains(&op) => {
                warn!("Injected failure for {:?}", op);
                Err(EngineError::Unavailable(format!("{:?} is failing", op)))
            }
            _ => Ok(()),
        }
    }

    async fn finish_job(&self, key: JobKey) -> Result<()> {
        if self.state.lock().await.active_jobs.remove(&key) {
            Ok(())
        } else {
            Err(EngineError::JobNotFound(key))
        }
    }
}

impl Default for InMemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EngineClient for InMemoryEngine {
    async fn deploy_resource(&self, path: &Path) -> Result<i64> {
        if tokio::fs::metadata(path).await.is_err() {
            return Err(EngineError::Deployment(format!(
                "resource {} does not exist",
                path.display()
            )));
        }
        self.record(None, EngineCall::Deployed { resource: path.to_path_buf() })
            .await?;
        Ok(self.next_key())
    }

    async fn create_process_instance(
        &self,
        process_id: &str,
        variables: Variables,
    ) -> Result<ProcessInstanceKey> {
        let key = ProcessInstanceKey(self.next_key());
        self.record(
            None,
            EngineCall::InstanceCreated {
                process_id: process_id.to_string(),
                key,
                variables,
            },
        )
        .await?;
        Ok(key)
    }

    async fn subscribe(
        &self,
        task_type: &TaskType,
        callback: Arc<dyn JobCallback>,
    ) -> Result<Subscription> {
        let mut state = self.state.lock().await;
        if state.subscriptions.contains_key(task_type) {
            return Err(EngineError::Rejected(format!(
                "task type {} already has a subscriber",
                task_type
            )));
        }
        let id = SubscriptionId::new();
        state
            .subscriptions
            .insert(task_type.clone(), (id, callback));
        debug!(task_type = %task_type, subscription = %id, "Opened job subscription");
        Ok(Subscription {
            id,
            task_type: task_type.clone(),
        })
    }

    async fn complete_job(&self, key: JobKey, variables: Variables) -> Result<()> {
        self.record(Some(EngineOp::Complete), EngineCall::Completed { key, variables })
            .await?;
        self.finish_job(key).await
    }

    async fn fail_job(&self, key: JobKey, retries: u32) -> Result<()> {
        self.record(Some(EngineOp::Fail), EngineCall::Failed { key, retries })
            .await?;
        self.finish_job(key).await
    }

    async fn publish_message(&self, message: &MessageSpec, variables: Variables) -> Result<()> {
        self.record(
            Some(EngineOp::Publish),
            EngineCall::Published {
                message: message.clone(),
                variables,
            },
        )
        .await
    }

    async fn cancel_process_instance(&self, key: ProcessInstanceKey) -> Result<()> {
        self.record(Some(EngineOp::Cancel), EngineCall::Cancelled { key })
            .await?;
        if self.state.lock().await.cancelled.insert(key) {
            Ok(())
        } else {
            Err(EngineError::ProcessInstanceNotFound(key))
        }
    }
}
