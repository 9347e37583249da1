use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of a job.
///
/// Variants are declared in lifecycle order: `Pending -> Executing -> terminal`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted and queued, no worker has picked it up yet.
    Pending,
    /// A worker is running the prepare or user script.
    Executing,
    /// All scripts exited with status 0.
    Success,
    /// A script failed, or the job could not be run.
    Error,
    /// Cancelled by a user, a newer job on the same queue, or shutdown.
    Cancelled,
    /// A script ran past the maximum execution time.
    Timeout,
}

impl JobStatus {
    /// True for every terminal status.
    pub fn is_finished(self) -> bool {
        !matches!(self, Self::Pending | Self::Executing)
    }

    /// Whether a job in `self` may move to `next`.
    ///
    /// Pending may start executing; any unfinished status may finish. A
    /// finished job never changes again.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Executing) => true,
            (Self::Pending | Self::Executing, next) => next.is_finished(),
            _ => false,
        }
    }

    /// Maps a job status onto the commit status reported upstream.
    pub fn commit_state(self) -> CommitState {
        match self {
            Self::Pending | Self::Executing => CommitState::Pending,
            Self::Success => CommitState::Success,
            Self::Error => CommitState::Failure,
            Self::Cancelled | Self::Timeout => CommitState::Error,
        }
    }

    /// Stable lowercase name, same as the serialized form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Executing => "executing",
            Self::Success => "success",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Commit status state understood by Gitea.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommitState {
    /// Build queued or running.
    Pending,
    /// Build passed.
    Success,
    /// Build ran and failed.
    Failure,
    /// Build did not complete (cancelled, timed out).
    Error,
}

/// Body of a commit status update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusPayload {
    /// Status context, e.g. `ci/microci` or `lint`.
    pub context: String,
    /// Human readable description of the current state.
    pub description: String,
    /// Upstream state.
    pub state: CommitState,
    /// Link back to the job page.
    pub target_url: String,
}
