//! Job state machine.

use serde::{Deserialize, Serialize};

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job is waiting in the admission queue.
    Queued,
    /// A worker has claimed the job and its handler is running.
    Processing,
    /// Handler finished successfully.
    Done,
    /// Handler failed, or no handler was registered.
    Error,
}

impl JobStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Queued, Processing) | (Processing, Done) | (Processing, Error)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}
