//! Task registry and the single-slot completion gate.
//!
//! A gate is a capacity-one channel carrying the [`CompletionSignal`] of the
//! job instance currently being processed for a task type. The worker loop
//! builds a fresh gate every iteration and publishes it here, so producers
//! that only know the task type can still reach it.

use crate::error::{SignalError, Slot};
use jobsync_core::{CompletionSignal, TaskType};
use std::collections::HashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;

/// Create a new completion gate for `task_type`.
pub fn completion_gate(task_type: TaskType) -> (GateSender, GateReceiver) {
    let (tx, rx) = mpsc::channel(1);
    (GateSender { task_type, tx }, GateReceiver { rx })
}

/// Producer side of a completion gate.
#[derive(Debug, Clone)]
pub struct GateSender {
    task_type: TaskType,
    tx: mpsc::Sender<CompletionSignal>,
}

impl GateSender {
    /// Push a signal, waiting while the slot is still occupied.
    pub async fn send(&self, signal: CompletionSignal) -> Result<(), SignalError> {
        self.tx.send(signal).await.map_err(|_| SignalError::Closed {
            task_type: self.task_type.clone(),
            slot: Slot::Completion,
        })
    }

    /// Push a signal only if the slot is free.
    pub fn try_send(&self, signal: CompletionSignal) -> Result<(), SignalError> {
        self.tx.try_send(signal).map_err(|e| match e {
            TrySendError::Full(_) => SignalError::Occupied {
                task_type: self.task_type.clone(),
                slot: Slot::Completion,
            },
            TrySendError::Closed(_) => SignalError::Closed {
                task_type: self.task_type.clone(),
                slot: Slot::Completion,
            },
        })
    }

    /// Task type this gate belongs to.
    pub fn task_type(&self) -> &TaskType {
        &self.task_type
    }

    /// Whether the worker loop stopped listening on this gate.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side of a completion gate, owned by the worker loop.
#[derive(Debug)]
pub struct GateReceiver {
    rx: mpsc::Receiver<CompletionSignal>,
}

impl GateReceiver {
    /// Wait for the signal. `None` once every producer is gone.
    pub async fn recv(&mut self) -> Option<CompletionSignal> {
        self.rx.recv().await
    }
}

/// Mapping from task type to its current completion gate.
///
/// Entries are held weakly: the registry never keeps a gate open on its own,
/// so a gate whose job handle was dropped reports closed instead of hanging.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    gates: Mutex<HashMap<TaskType, mpsc::WeakSender<CompletionSignal>>>,
}

impl TaskRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `gate` as the current gate of its task type.
    pub async fn set(&self, gate: &GateSender) {
        let mut gates = self.gates.lock().await;
        gates.insert(gate.task_type.clone(), gate.tx.downgrade());
    }

    /// Current gate of `task_type`, if one is registered and still open.
    pub async fn get(&self, task_type: &TaskType) -> Option<GateSender> {
        let gates = self.gates.lock().await;
        gates.get(task_type).and_then(|weak| weak.upgrade()).map(|tx| GateSender {
            task_type: task_type.clone(),
            tx,
        })
    }

    /// Push `signal` onto the current gate of `task_type`.
    ///
    /// The gate itself stays open. The lock is released before sending, so
    /// a full gate only blocks this caller.
    pub async fn close(
        &self,
        task_type: &TaskType,
        signal: CompletionSignal,
    ) -> Result<(), SignalError> {
        let gate = {
            let gates = self.gates.lock().await;
            match gates.get(task_type) {
                None => return Err(SignalError::Unregistered(task_type.clone())),
                Some(weak) => weak.upgrade(),
            }
        };

        match gate {
            Some(tx) => GateSender {
                task_type: task_type.clone(),
                tx,
            }
            .send(signal)
            .await,
            None => Err(SignalError::Closed {
                task_type: task_type.clone(),
                slot: Slot::Completion,
            }),
        }
    }

    /// Drop the entry of `task_type`.
    pub async fn remove(&self, task_type: &TaskType) {
        self.gates.lock().await.remove(task_type);
    }

    /// Registered task types, sorted.
    pub async fn task_types(&self) -> Vec<TaskType> {
        let mut types: Vec<_> = self.gates.lock().await.keys().cloned().collect();
        types.sort();
        types
    }
}
