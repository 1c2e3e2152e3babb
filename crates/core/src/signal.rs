//! Completion signal sent once per job instance.

use crate::id::ProcessInstanceKey;
use serde::{Deserialize, Serialize};

/// What the worker loop should do once a job instance has finished.
///
/// On the wire this is a single integer: `0` means nothing further, any other
/// value is the process instance to cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum CompletionSignal {
    /// Job finished, no follow-up
    Done,
    /// Job finished and its owning lane is no longer needed
    Cancel(ProcessInstanceKey),
}

impl CompletionSignal {
    /// The process instance to cancel, if any.
    pub fn cancel_target(&self) -> Option<ProcessInstanceKey> {
        match self {
            CompletionSignal::Done => None,
            CompletionSignal::Cancel(pid) => Some(*pid),
        }
    }
}

impl From<i64> for CompletionSignal {
    fn from(raw: i64) -> Self {
        if raw == 0 {
            CompletionSignal::Done
        } else {
            CompletionSignal::Cancel(ProcessInstanceKey(raw))
        }
    }
}

impl From<CompletionSignal> for i64 {
    fn from(signal: CompletionSignal) -> Self {
        match signal {
            CompletionSignal::Done => 0,
            CompletionSignal::Cancel(pid) => pid.0,
        }
    }
}

impl std::fmt::Display for CompletionSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompletionSignal::Done => write!(f, "done"),
            CompletionSignal::Cancel(pid) => write!(f, "cancel {}", pid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_means_done() {
        assert_eq!(CompletionSignal::from(0), CompletionSignal::Done);
        assert_eq!(CompletionSignal::Done.cancel_target(), None);
    }

    #[test]
    fn test_nonzero_means_cancel() {
        let signal = CompletionSignal::from(42);
        assert_eq!(signal.cancel_target(), Some(ProcessInstanceKey(42)));
        assert_eq!(i64::from(signal), 42);
        assert_eq!(serde_json::to_string(&signal).unwrap(), "42");
    }
}
