//! Session notifications and stop reasons.

use crate::executor::RunReport;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle phase of the controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Phase {
    Idle,
    Running,
    Stopping,
}

/// The session ran past its maximum duration.
///
/// A normal termination reason, not a failure.
#[derive(Debug, Clone, Error, PartialEq, Serialize)]
#[error("Session reached its time limit of {limit:?} after {elapsed:?}")]
pub struct SessionTimeoutError {
    pub elapsed: Duration,
    pub limit: Duration,
}

/// Why a session ended.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum StopReason {
    /// `stop()` was called.
    Requested,
    /// The configured maximum trial count was reached.
    TrialLimit,
    /// The trial definition declined to supply another trial.
    DefinitionStopped,
    SessionTimeout(SessionTimeoutError),
    /// A trial failed with a hardware error under the `stop` policy.
    HardwareFault(String),
    /// The trial definition produced a matrix that failed validation.
    MatrixRejected(String),
}

impl StopReason {
    /// True for reasons that indicate something went wrong.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::HardwareFault(_) | Self::MatrixRejected(_))
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => f.write_str("stop requested"),
            Self::TrialLimit => f.write_str("trial limit reached"),
            Self::DefinitionStopped => f.write_str("trial definition stopped the session"),
            Self::SessionTimeout(timeout) => write!(f, "{timeout}"),
            Self::HardwareFault(reason) => write!(f, "hardware fault: {reason}"),
            Self::MatrixRejected(reason) => write!(f, "matrix rejected: {reason}"),
        }
    }
}

/// Messages broadcast by the session controller to its subscribers.
#[derive(Clone, Debug)]
pub enum Notification {
    SessionStarted {
        session_id: Uuid,
        started_at: DateTime<Utc>,
    },
    /// The definition should build the matrix for `trial_index` and call
    /// [`ready_to_start_trial`](super::SessionHandle::ready_to_start_trial).
    PrepareNextTrial { trial_index: u32 },
    TrialFinished {
        trial_index: u32,
        report: Arc<RunReport>,
    },
    SessionStopped {
        total_trials_completed: u32,
        reason: StopReason,
    },
    /// Human-readable status line.
    LogMessage(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_faults_are_failures() {
        assert!(!StopReason::Requested.is_failure());
        assert!(!StopReason::TrialLimit.is_failure());
        assert!(!StopReason::SessionTimeout(SessionTimeoutError {
            elapsed: Duration::from_secs(3601),
            limit: Duration::from_secs(3600),
        })
        .is_failure());
        assert!(StopReason::HardwareFault("port closed".to_string()).is_failure());
    }

    #[test]
    fn timeout_reason_displays_limit() {
        let reason = StopReason::SessionTimeout(SessionTimeoutError {
            elapsed: Duration::from_secs(2),
            limit: Duration::from_secs(1),
        });
        assert!(reason.to_string().contains("time limit"));
    }
}
