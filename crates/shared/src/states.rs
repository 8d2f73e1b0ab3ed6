use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle states of a worker record.
///
/// A worker is created in `Requested` and only the registration path moves
/// it to `Running`. The removal pipeline drives `Stopping` and finally
/// `Stopped`, which is terminal: a stopped worker is never mutated again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Record exists; the VM is not yet visible or has not registered.
    Requested,
    /// The worker proved its identity and registered.
    Running,
    /// At least one resource delete has been requested.
    Stopping,
    /// All cloud resources verified gone. Terminal.
    Stopped,
}

impl WorkerState {
    /// Validates a transition against the worker state machine.
    ///
    /// - Requested → Running, Stopping, Stopped
    /// - Running → Stopping, Stopped
    /// - Stopping → Stopped
    /// - Stopped → (terminal)
    ///
    /// Requested → Stopped covers the case where every resource delete
    /// verifies gone within a single removal pass.
    pub fn can_transition_to(&self, new_state: &WorkerState) -> bool {
        match (self, new_state) {
            (s, n) if s == n => false,
            (WorkerState::Requested, WorkerState::Running) => true,
            (WorkerState::Requested, WorkerState::Stopping) => true,
            (WorkerState::Requested, WorkerState::Stopped) => true,
            (WorkerState::Running, WorkerState::Stopping) => true,
            (WorkerState::Running, WorkerState::Stopped) => true,
            (WorkerState::Stopping, WorkerState::Stopped) => true,
            _ => false,
        }
    }

    /// Returns true once the worker can never leave this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Stopped)
    }

    /// Returns true while the removal pipeline still has work to do.
    pub fn is_stopping(&self) -> bool {
        matches!(self, WorkerState::Stopping)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Requested => write!(f, "requested"),
            WorkerState::Running => write!(f, "running"),
            WorkerState::Stopping => write!(f, "stopping"),
            WorkerState::Stopped => write!(f, "stopped"),
        }
    }
}

impl FromStr for WorkerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requested" => Ok(WorkerState::Requested),
            "running" => Ok(WorkerState::Running),
            "stopping" => Ok(WorkerState::Stopping),
            "stopped" => Ok(WorkerState::Stopped),
            _ => Err(format!("Invalid WorkerState: {}", s)),
        }
    }
}
