//! Commit status reporting with bounded retries.
//!
//! Every job owns a [`StatusReporter`]. A new push supersedes the one before
//! it: the older push stops before its next attempt, and pushes of one job
//! never run concurrently, so an older state cannot land after a newer one.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use microci_core::model::StatusPayload;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::lock_unpoisoned;

/// Attempts per status push.
pub const PUSH_ATTEMPTS: u32 = 3;

/// Pause between attempts.
pub const PUSH_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Commit status push failures.
#[derive(Debug, Error)]
pub enum StatusError {
    /// Transport or client construction failure.
    #[error("status request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The server answered with a non-success status.
    #[error("status request rejected with {status}: {body}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Truncated response body.
        body: String,
    },
    /// Client misconfiguration.
    #[error("invalid status client config: {0}")]
    Config(String),
}

/// Capability to set the status of a commit.
#[async_trait]
pub trait CommitStatusApi: Send + Sync {
    /// Sets the status of `commit` in `repo` (`owner/name`).
    async fn update_commit_state(
        &self,
        repo: &str,
        commit: &str,
        status: &StatusPayload,
    ) -> Result<(), StatusError>;
}

/// One status update, addressed to a commit.
#[derive(Debug, Clone)]
pub struct StatusPush {
    /// Job the update belongs to, for logging.
    pub job_id: String,
    /// `owner/name`.
    pub repo: String,
    /// Commit sha.
    pub commit: String,
    /// Update body.
    pub payload: StatusPayload,
}

/// Fire-and-forget status pushes for a single job.
pub struct StatusReporter {
    api: Arc<dyn CommitStatusApi>,
    tasks: TaskTracker,
    current: Mutex<CancellationToken>,
    in_flight: Arc<tokio::sync::Mutex<()>>,
}

impl StatusReporter {
    /// Pushes are spawned on `tasks` so shutdown can wait for them.
    pub fn new(api: Arc<dyn CommitStatusApi>, tasks: TaskTracker) -> Self {
        Self {
            api,
            tasks,
            current: Mutex::new(CancellationToken::new()),
            in_flight: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Supersedes any unfinished push and starts pushing `push` in the
    /// background. Must be called from within a tokio runtime.
    pub fn push(&self, push: StatusPush) {
        let token = CancellationToken::new();
        {
            let mut current = lock_unpoisoned(&self.current);
            current.cancel();
            *current = token.clone();
        }

        let api = Arc::clone(&self.api);
        let in_flight = Arc::clone(&self.in_flight);
        self.tasks.spawn(async move {
            push_with_retry(api, in_flight, token, push).await;
        });
    }
}

async fn push_with_retry(
    api: Arc<dyn CommitStatusApi>,
    in_flight: Arc<tokio::sync::Mutex<()>>,
    token: CancellationToken,
    push: StatusPush,
) {
    let _guard = tokio::select! {
        biased;
        _ = token.cancelled() => return,
        guard = in_flight.lock_owned() => guard,
    };

    for attempt in 1..=PUSH_ATTEMPTS {
        if token.is_cancelled() {
            tracing::debug!(job_id = %push.job_id, "status push superseded");
            return;
        }
        match api
            .update_commit_state(&push.repo, &push.commit, &push.payload)
            .await
        {
            Ok(()) => {
                tracing::debug!(
                    job_id = %push.job_id,
                    state = ?push.payload.state,
                    attempt,
                    "status pushed"
                );
                return;
            }
            Err(e) => {
                tracing::warn!(job_id = %push.job_id, attempt, error = %e, "status push failed");
            }
        }
        if attempt < PUSH_ATTEMPTS {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(PUSH_RETRY_DELAY) => {}
            }
        }
    }

    tracing::error!(
        job_id = %push.job_id,
        repo = %push.repo,
        commit = %push.commit,
        "status push failed after {PUSH_ATTEMPTS} attempts"
    );
}
