//! A single triggered build: identity, persisted record, cancellation and log.
//!
//! Folder layout: `<jobs-root>/<id>/{git/, artifacts/, logs, info.json}`.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use microci_core::event::{Event, EventType};
use microci_core::model::{JobStatus, StatusPayload};
use microci_core::{new_job_id, now_ms};
use microci_runner::JobLog;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::lock_unpoisoned;
use crate::status::{CommitStatusApi, StatusPush, StatusReporter};

/// Persisted job record file name.
pub const INFO_FILE: &str = "info.json";
/// Log file name.
pub const LOG_FILE: &str = "logs";
/// Checkout directory name, the scripts' working directory.
pub const GIT_DIR: &str = "git";
/// Directory scripts drop artifacts into.
pub const ARTIFACTS_DIR: &str = "artifacts";

const RESTART_DESCRIPTION: &str = "job interrupted by restart";

/// Job errors.
#[derive(Debug, Error)]
pub enum JobError {
    /// Creating the job folder or log failed.
    #[error("failed to set up job folder {}: {source}", path.display())]
    Setup {
        /// Path being created.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// Writing `info.json` failed.
    #[error("failed to save job {id}: {source}")]
    Save {
        /// Job id.
        id: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// Reading `info.json` failed.
    #[error("failed to read job record {}: {source}", path.display())]
    Load {
        /// Record path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// `info.json` is not a valid record.
    #[error("corrupt job record {}: {source}", path.display())]
    Decode {
        /// Record path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
    /// Status change that would reopen or skip backwards.
    #[error("job {id}: invalid status change {from} -> {to}")]
    InvalidTransition {
        /// Job id.
        id: String,
        /// Current status.
        from: JobStatus,
        /// Requested status.
        to: JobStatus,
    },
}

/// Who cancelled a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// Cancelled through the job view.
    User,
    /// A newer job arrived on the same queue.
    Superseded,
    /// The daemon is shutting down.
    Shutdown,
}

impl CancelReason {
    /// Status description for a job cancelled for this reason.
    pub fn description(self) -> &'static str {
        match self {
            Self::User => "job cancelled",
            Self::Superseded => "job cancelled by a newer job",
            Self::Shutdown => "job cancelled by shutdown",
        }
    }
}

/// Persistent part of a job, the content of `info.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
    /// Triggering event kind.
    #[serde(rename = "type")]
    pub kind: EventType,
    /// Commit status context.
    pub context: String,
    /// Resolved script path.
    pub script: PathBuf,
    /// Repository (`owner/name`) whose scripts and queues this job uses.
    pub repository: String,
    /// Queue within the repository.
    pub queue_name: String,
    /// Commit the status is posted to.
    pub commit_id: String,
    /// Repository (`owner/name`) the status is posted to.
    pub commit_repo: String,
    /// Triggering payload.
    pub event: Event,
    /// Current status.
    pub status: JobStatus,
    /// Description of the current status.
    pub status_description: String,
    /// Creation time.
    #[serde(default)]
    pub created_at_ms: i64,
    /// Time a worker started it.
    #[serde(default)]
    pub started_at_ms: Option<i64>,
    /// Time it reached a finished status.
    #[serde(default)]
    pub finished_at_ms: Option<i64>,
}

/// Inputs for a new job.
#[derive(Debug, Clone)]
pub struct JobSpec {
    /// Triggering event kind.
    pub kind: EventType,
    /// Triggering payload.
    pub event: Event,
    /// Resolved script path.
    pub script: PathBuf,
    /// Repository (`owner/name`) whose scripts and queues this job uses.
    pub repository: String,
    /// Queue within the repository.
    pub queue_name: String,
    /// Commit status context.
    pub context: String,
    /// Repository (`owner/name`) the status is posted to.
    pub commit_repo: String,
    /// Commit the status is posted to.
    pub commit_id: String,
}

/// Shared dependencies of every job.
#[derive(Clone)]
pub struct JobContext {
    /// Root of all job folders.
    pub jobs_root: PathBuf,
    /// Public base URL of this daemon.
    pub server_address: String,
    /// Commit status sink.
    pub status_api: Arc<dyn CommitStatusApi>,
    /// Tracks background status pushes.
    pub tasks: TaskTracker,
    /// Parent of every job's cancellation token.
    pub shutdown: CancellationToken,
}

/// Serializable view of a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    /// Job id.
    pub id: String,
    /// Link to the job page.
    pub target_url: String,
    /// Set once the job was cancelled.
    pub cancel_reason: Option<CancelReason>,
    /// Persisted record.
    #[serde(flatten)]
    pub record: JobRecord,
}

#[derive(Serialize)]
struct StoredJob<'a> {
    id: &'a str,
    target_url: &'a str,
    #[serde(flatten)]
    record: &'a JobRecord,
}

/// A job. Shared between the manager index, its queue and the worker running it.
pub struct Job {
    id: String,
    folder: PathBuf,
    target_url: String,
    record: Mutex<JobRecord>,
    cancel: CancellationToken,
    cancel_reason: OnceLock<CancelReason>,
    log: JobLog,
    save_lock: tokio::sync::Mutex<()>,
    reporter: StatusReporter,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("folder", &self.folder)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Job {
    /// Allocates an id, creates the job folder and log, and persists the
    /// record with status `Pending`.
    pub async fn setup(ctx: &JobContext, spec: JobSpec) -> Result<Arc<Job>, JobError> {
        let id = new_job_id();
        let folder = ctx.jobs_root.join(&id);
        for dir in [folder.join(GIT_DIR), folder.join(ARTIFACTS_DIR)] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|source| JobError::Setup { path: dir, source })?;
        }
        let log_path = folder.join(LOG_FILE);
        let log = JobLog::create(&log_path).await.map_err(|source| JobError::Setup {
            path: log_path,
            source,
        })?;

        let record = JobRecord {
            kind: spec.kind,
            context: spec.context,
            script: spec.script,
            repository: spec.repository,
            queue_name: spec.queue_name,
            commit_id: spec.commit_id,
            commit_repo: spec.commit_repo,
            event: spec.event,
            status: JobStatus::Pending,
            status_description: "Waiting for a worker".into(),
            created_at_ms: now_ms(),
            started_at_ms: None,
            finished_at_ms: None,
        };

        let job = Arc::new(Self::assemble(ctx, id, folder, record, log));
        job.save().await?;
        tracing::debug!(job_id = %job.id, folder = %job.folder.display(), "job set up");
        Ok(job)
    }

    /// Rehydrates a job from `<jobs-root>/<id>/info.json`.
    ///
    /// A job that was still pending or executing is reported as `Cancelled`.
    /// The correction is not written back, so the folder keeps its mtime.
    pub async fn load(ctx: &JobContext, id: &str) -> Result<Arc<Job>, JobError> {
        let folder = ctx.jobs_root.join(id);
        let path = folder.join(INFO_FILE);
        let bytes = tokio::fs::read(&path).await.map_err(|source| JobError::Load {
            path: path.clone(),
            source,
        })?;
        let mut record: JobRecord =
            serde_json::from_slice(&bytes).map_err(|source| JobError::Decode { path, source })?;

        if !record.status.is_finished() {
            tracing::info!(job_id = %id, status = %record.status, "unfinished job found on disk, marking cancelled");
            record.status = JobStatus::Cancelled;
            record.status_description = RESTART_DESCRIPTION.into();
        }

        let log = JobLog::closed(folder.join(LOG_FILE));
        Ok(Arc::new(Self::assemble(
            ctx,
            id.to_string(),
            folder,
            record,
            log,
        )))
    }

    fn assemble(
        ctx: &JobContext,
        id: String,
        folder: PathBuf,
        record: JobRecord,
        log: JobLog,
    ) -> Self {
        let target_url = format!("{}/job/{id}", ctx.server_address.trim_end_matches('/'));
        Self {
            id,
            folder,
            target_url,
            record: Mutex::new(record),
            cancel: ctx.shutdown.child_token(),
            cancel_reason: OnceLock::new(),
            log,
            save_lock: tokio::sync::Mutex::new(()),
            reporter: StatusReporter::new(Arc::clone(&ctx.status_api), ctx.tasks.clone()),
        }
    }

    /// Job id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Job folder.
    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// Scripts' working directory.
    pub fn git_dir(&self) -> PathBuf {
        self.folder.join(GIT_DIR)
    }

    /// Artifact directory.
    pub fn artifacts_dir(&self) -> PathBuf {
        self.folder.join(ARTIFACTS_DIR)
    }

    /// Link to the job page.
    pub fn target_url(&self) -> &str {
        &self.target_url
    }

    /// Output log.
    pub fn log(&self) -> &JobLog {
        &self.log
    }

    /// Current status.
    pub fn status(&self) -> JobStatus {
        lock_unpoisoned(&self.record).status
    }

    /// Copy of the persisted record.
    pub fn record(&self) -> JobRecord {
        lock_unpoisoned(&self.record).clone()
    }

    /// Serializable view.
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id.clone(),
            target_url: self.target_url.clone(),
            cancel_reason: self.cancel_reason(),
            record: self.record(),
        }
    }

    /// Token that aborts this job's execution.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancels the job. The first recorded reason sticks; a finished job is
    /// left untouched.
    pub fn cancel(&self, reason: CancelReason) {
        if self.status().is_finished() {
            return;
        }
        if self.cancel_reason.set(reason).is_ok() {
            tracing::info!(job_id = %self.id, ?reason, "cancelling job");
        }
        self.cancel.cancel();
    }

    /// Why cancellation was requested, while the job may still be running.
    ///
    /// A token fired through the shutdown parent without an explicit call
    /// reports [`CancelReason::Shutdown`].
    pub fn cancel_requested(&self) -> Option<CancelReason> {
        if !self.cancel.is_cancelled() {
            return None;
        }
        Some(self.recorded_reason())
    }

    /// Why the job ended `Cancelled`. `None` for any other status.
    ///
    /// Jobs cut short by a restart report [`CancelReason::Shutdown`].
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        (self.status() == JobStatus::Cancelled).then(|| self.recorded_reason())
    }

    fn recorded_reason(&self) -> CancelReason {
        self.cancel_reason
            .get()
            .copied()
            .unwrap_or(CancelReason::Shutdown)
    }

    /// Moves to `status` and pushes the change upstream in the background.
    pub fn set_status(
        &self,
        status: JobStatus,
        description: impl Into<String>,
    ) -> Result<(), JobError> {
        let description = description.into();
        let mut record = lock_unpoisoned(&self.record);
        if !record.status.can_transition_to(status) {
            return Err(JobError::InvalidTransition {
                id: self.id.clone(),
                from: record.status,
                to: status,
            });
        }
        record.status = status;
        record.status_description = description.clone();
        let now = now_ms();
        if status == JobStatus::Executing {
            record.started_at_ms = Some(now);
        }
        if status.is_finished() {
            record.finished_at_ms = Some(now);
        }
        tracing::info!(job_id = %self.id, %status, description = %description, "job status changed");

        self.reporter.push(StatusPush {
            job_id: self.id.clone(),
            repo: record.commit_repo.clone(),
            commit: record.commit_id.clone(),
            payload: StatusPayload {
                context: record.context.clone(),
                description,
                state: status.commit_state(),
                target_url: self.target_url.clone(),
            },
        });
        Ok(())
    }

    /// Writes the record to `info.json`, replacing the previous content.
    pub async fn save(&self) -> Result<(), JobError> {
        let _guard = self.save_lock.lock().await;
        let record = self.record();
        let stored = StoredJob {
            id: &self.id,
            target_url: &self.target_url,
            record: &record,
        };
        let save_err = |source: io::Error| JobError::Save {
            id: self.id.clone(),
            source,
        };
        let json = serde_json::to_vec_pretty(&stored).map_err(|e| save_err(e.into()))?;
        let tmp = self.folder.join(format!("{INFO_FILE}.tmp"));
        tokio::fs::write(&tmp, &json).await.map_err(save_err)?;
        tokio::fs::rename(&tmp, self.folder.join(INFO_FILE))
            .await
            .map_err(save_err)
    }
}
