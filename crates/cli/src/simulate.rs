//! Runs configured workers and the bridge against in-memory backends.

use crate::config::AppConfig;
use crate::handler;
use anyhow::{bail, Context, Result};
use jobsync_bridge::{BridgeError, BridgeStats, Broker, InMemoryBroker, MessageBridge};
use jobsync_core::{ProcessInstanceKey, TaskType, Variables};
use jobsync_engine::{EngineCall, EngineClient, InMemoryEngine};
use jobsync_worker::{WorkerPool, WorkerStatus};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Input of a simulation run.
#[derive(Debug, Default, Deserialize)]
pub struct Scenario {
    /// Jobs activated in order
    #[serde(default)]
    pub jobs: Vec<ScenarioJob>,

    /// Broker deliveries; strings are sent verbatim, anything else as JSON
    #[serde(default)]
    pub envelopes: Vec<Value>,
}

/// One job to activate.
#[derive(Debug, Deserialize)]
pub struct ScenarioJob {
    pub task_type: String,
    pub process_instance_key: i64,
    #[serde(default)]
    pub variables: Variables,
}

impl Scenario {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse scenario {}", path.display()))
    }
}

/// Result of a simulation run.
#[derive(Debug)]
pub struct Report {
    pub calls: Vec<EngineCall>,
    pub statuses: BTreeMap<TaskType, WorkerStatus>,
    pub bridge: BridgeStats,
}

fn delivery_body(envelope: &Value) -> Vec<u8> {
    match envelope {
        Value::String(raw) => raw.clone().into_bytes(),
        other => other.to_string().into_bytes(),
    }
}

async fn bootstrap(config: &AppConfig, engine: &dyn EngineClient) -> Result<()> {
    if let Some(resource) = &config.engine.bpmn_file {
        let key = engine
            .deploy_resource(resource)
            .await
            .with_context(|| format!("Failed to deploy {}", resource.display()))?;
        info!(resource = %resource.display(), key, "Deployed resource");
    }
    if let Some(process_id) = &config.engine.process_id {
        let key = engine
            .create_process_instance(process_id, config.engine.initial_variables.clone())
            .await
            .with_context(|| format!("Failed to start process {}", process_id))?;
        info!(process_instance_key = %key, "Created process instance of {}", process_id);
    }
    Ok(())
}

/// Feed `scenario` through freshly started workers and bridge.
///
/// With `hold`, keeps serving after the scenario until `stop` resolves.
pub async fn run(
    config: &AppConfig,
    scenario: Scenario,
    settle: Duration,
    stop: impl std::future::Future<Output = ()>,
    hold: bool,
) -> Result<Report> {
    if config.engine.address != "memory://" {
        bail!("Unsupported engine address {}: only memory:// is built in", config.engine.address);
    }
    if config.broker.uri != "memory://" {
        bail!("Unsupported broker uri {}: only memory:// is built in", config.broker.uri);
    }

    let engine = Arc::new(InMemoryEngine::new());
    bootstrap(config, &*engine).await?;

    let mut pool = WorkerPool::new(engine.clone());
    for worker in &config.workers {
        pool.spawn(handler::definition(worker))?;
    }
    for task_type in pool.statuses().keys() {
        if let Some(mut status) = pool.status(task_type) {
            tokio::time::timeout(settle, status.wait_for(|s| s.state.is_awaiting()))
                .await
                .with_context(|| format!("Worker {} did not start", task_type))??;
        }
    }

    let broker = Arc::new(InMemoryBroker::new());
    let bridge = MessageBridge::new(broker.clone(), engine.clone())
        .with_queue(config.broker.queue_spec())
        .with_prefetch(config.broker.prefetch);
    let (bridge_stop, bridge_stop_rx) = watch::channel(false);
    let bridge_task = tokio::spawn(async move { bridge.run(bridge_stop_rx).await });

    tokio::pin!(stop);
    tokio::select! {
        result = feed(&pool, &engine, &broker, config, scenario, settle) => result?,
        _ = &mut stop => {
            info!("Interrupted, shutting down");
            return finish(pool, engine, bridge_stop, bridge_task).await;
        }
    }

    if hold {
        info!("Scenario fed, serving until interrupted");
        stop.await;
    }
    finish(pool, engine, bridge_stop, bridge_task).await
}

async fn feed(
    pool: &WorkerPool,
    engine: &InMemoryEngine,
    broker: &InMemoryBroker,
    config: &AppConfig,
    scenario: Scenario,
    settle: Duration,
) -> Result<()> {
    for job in scenario.jobs {
        let task_type = TaskType::from(job.task_type);
        let Some(mut status) = pool.status(&task_type) else {
            warn!(task_type = %task_type, "No worker configured, skipping job");
            continue;
        };
        let before = status.borrow_and_update().iterations;

        let key = engine
            .activate(task_type.clone(), ProcessInstanceKey(job.process_instance_key), job.variables)
            .await?;
        let finished = tokio::time::timeout(settle, status.wait_for(|s| s.iterations > before)).await;
        if finished.is_err() {
            warn!(task_type = %task_type, job_key = %key, "Job still in flight after {:?}", settle);
        }
    }

    // The bridge may not have declared its queue yet.
    broker.declare_queue(&config.broker.queue_spec()).await?;
    let count = scenario.envelopes.len();
    for envelope in &scenario.envelopes {
        broker
            .publish(&config.broker.queue, delivery_body(envelope))
            .await?;
    }

    let acked = tokio::time::timeout(settle, async {
        while broker.acked().await.len() < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    if acked.is_err() {
        warn!(queue = %config.broker.queue, "Not every delivery was acknowledged");
    }
    Ok(())
}

async fn finish(
    pool: WorkerPool,
    engine: Arc<InMemoryEngine>,
    bridge_stop: watch::Sender<bool>,
    bridge_task: tokio::task::JoinHandle<std::result::Result<BridgeStats, BridgeError>>,
) -> Result<Report> {
    let statuses = pool.statuses();
    pool.shutdown().await?;

    let _ = bridge_stop.send(true);
    let bridge = bridge_task.await.context("Bridge task failed")??;

    Ok(Report {
        calls: engine.calls().await,
        statuses,
        bridge,
    })
}
