//! Per-iteration signal slots.
//!
//! Every iteration of a worker loop builds one [`JobSignals`] (producer
//! side, handed to the job that claims the iteration) and one
//! [`PendingSignals`] (consumer side, kept by the loop). Each slot is a
//! capacity-one channel that accepts exactly one value.

use crate::deferred::EffectContext;
use crate::error::{SignalError, Slot};
use crate::registry::{completion_gate, GateReceiver, GateSender};
use jobsync_core::{CompletionSignal, TaskType, Variables};
use tokio::sync::mpsc;

/// Producer side of one iteration's slots.
#[derive(Debug)]
pub struct JobSignals {
    task_type: TaskType,
    variables: Option<mpsc::Sender<Variables>>,
    deferred: Option<mpsc::Sender<EffectContext>>,
    completion: Option<GateSender>,
}

/// Consumer side of one iteration's slots.
#[derive(Debug)]
pub struct PendingSignals {
    /// Variable bundle for the correlator
    pub variables: mpsc::Receiver<Variables>,
    /// Deferred-effect trigger
    pub deferred: mpsc::Receiver<EffectContext>,
    /// Completion gate
    pub completion: GateReceiver,
}

impl JobSignals {
    /// Build a fresh set of slots for `task_type`.
    pub fn channel(task_type: TaskType) -> (JobSignals, PendingSignals) {
        let (variables_tx, variables_rx) = mpsc::channel(1);
        let (deferred_tx, deferred_rx) = mpsc::channel(1);
        let (gate_tx, gate_rx) = completion_gate(task_type.clone());

        let signals = JobSignals {
            task_type,
            variables: Some(variables_tx),
            deferred: Some(deferred_tx),
            completion: Some(gate_tx),
        };
        let pending = PendingSignals {
            variables: variables_rx,
            deferred: deferred_rx,
            completion: gate_rx,
        };
        (signals, pending)
    }

    /// Task type these slots belong to.
    pub fn task_type(&self) -> &TaskType {
        &self.task_type
    }

    /// The completion gate, while it has not been used yet.
    pub fn gate(&self) -> Option<&GateSender> {
        self.completion.as_ref()
    }

    /// Whether the completion signal was already sent.
    pub fn is_completed(&self) -> bool {
        self.completion.is_none()
    }

    /// Whether the worker loop still waits on these slots.
    ///
    /// False once the completion was sent or the loop abandoned the
    /// iteration, e.g. on shutdown.
    pub fn is_live(&self) -> bool {
        self.completion.as_ref().is_some_and(|gate| !gate.is_closed())
    }

    /// Hand the variable bundle to the correlator.
    pub async fn send_variables(&mut self, variables: Variables) -> Result<(), SignalError> {
        let tx = self.take(Slot::Variables, |s| s.variables.take())?;
        tx.send(variables).await.map_err(|_| self.closed(Slot::Variables))
    }

    /// Release the deferred effect.
    pub async fn trigger_deferred(&mut self, context: EffectContext) -> Result<(), SignalError> {
        let tx = self.take(Slot::Deferred, |s| s.deferred.take())?;
        tx.send(context).await.map_err(|_| self.closed(Slot::Deferred))
    }

    /// Send the completion signal. Must be the last signal of the job.
    pub async fn complete(&mut self, signal: CompletionSignal) -> Result<(), SignalError> {
        let gate = self.take(Slot::Completion, |s| s.completion.take())?;
        gate.send(signal).await
    }

    fn take<T>(
        &mut self,
        slot: Slot,
        f: impl FnOnce(&mut Self) -> Option<T>,
    ) -> Result<T, SignalError> {
        f(self).ok_or_else(|| SignalError::AlreadySent {
            task_type: self.task_type.clone(),
            slot,
        })
    }

    fn closed(&self, slot: Slot) -> SignalError {
        SignalError::Closed {
            task_type: self.task_type.clone(),
            slot,
        }
    }
}
