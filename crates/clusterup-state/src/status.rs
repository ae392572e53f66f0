//! Host status state machine
//!
//! Host states: UNSTARTED → RUNNING → {SUCCESS | FAILED | TERMINATED}

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of one host within one run of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    /// Registered for the run but not yet picked up
    #[default]
    Unstarted,
    /// Task is mid-flight against this host
    Running,
    /// Every stage exited zero
    Success,
    /// A stage exited nonzero, a copy failed, or the host was unreachable
    Failed,
    /// A command was killed after exceeding its timeout
    Terminated,
}

impl HostStatus {
    /// Terminal statuses are never overwritten within a run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            HostStatus::Success | HostStatus::Failed | HostStatus::Terminated
        )
    }

    /// Check if transition from this status to target is valid
    pub fn can_transition_to(&self, target: HostStatus) -> bool {
        match (self, target) {
            (HostStatus::Unstarted, HostStatus::Running) => true,
            // A host can finish without ever being marked running when it
            // has nothing to do.
            (HostStatus::Unstarted, t) if t.is_terminal() => true,
            (HostStatus::Running, t) if t.is_terminal() => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HostStatus::Unstarted => "unstarted",
            HostStatus::Running => "running",
            HostStatus::Success => "success",
            HostStatus::Failed => "failed",
            HostStatus::Terminated => "terminated",
        }
    }
}

impl fmt::Display for HostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}
