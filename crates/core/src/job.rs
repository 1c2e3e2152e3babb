//! Job instances as delivered by the workflow engine.

use crate::id::{JobKey, ProcessInstanceKey, TaskType};
use serde::{Deserialize, Serialize};

/// Ordered variable bundle exchanged with the engine.
pub type Variables = serde_json::Map<String, serde_json::Value>;

/// One occurrence of a task type dispatched by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivatedJob {
    /// Job key used for complete/fail requests
    pub key: JobKey,

    /// Task type the job was activated for
    pub task_type: TaskType,

    /// Owning process instance
    pub process_instance_key: ProcessInstanceKey,

    /// Variables visible to the job
    pub variables: Variables,
}

impl ActivatedJob {
    /// Create a job.
    pub fn new(
        key: JobKey,
        task_type: impl Into<TaskType>,
        process_instance_key: ProcessInstanceKey,
        variables: Variables,
    ) -> Self {
        Self {
            key,
            task_type: task_type.into(),
            process_instance_key,
            variables,
        }
    }

    /// Look up a single variable.
    pub fn variable(&self, name: &str) -> Option<&serde_json::Value> {
        self.variables.get(name)
    }
}

/// Build a [`Variables`] bundle from a JSON object literal.
///
/// Non-object values produce an empty bundle.
pub fn variables_from(value: serde_json::Value) -> Variables {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Variables::new(),
    }
}
