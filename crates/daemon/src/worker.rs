//! Worker pool: N tasks pulling jobs off the shared intake channel.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use microci_core::event::EventType;
use microci_core::model::JobStatus;
use microci_runner::{run_script, ExecError, ExecRequest};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::job::{CancelReason, Job};

/// Title of the prepare section in the job log.
pub const PREPARE_SECTION: &str = "Prepare git branch";
/// Status description of a successful job.
pub const SUCCESS_DESCRIPTION: &str = "Job completed successfully!";
/// Status description while running.
pub const RUNNING_DESCRIPTION: &str = "In progress...";

/// What every worker needs to run a job.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Root of the user scripts, for display in section titles.
    pub scripts_root: PathBuf,
    /// Directory holding `scripts/prepare-push.sh` and `scripts/prepare-pr.sh`.
    pub resource_dir: PathBuf,
    /// Per-script deadline.
    pub max_execution_time: Duration,
}

impl WorkerSettings {
    /// Prepare script for a job triggered by `kind`.
    pub fn prepare_script(&self, kind: EventType) -> PathBuf {
        let name = match kind {
            EventType::PullRequest => "prepare-pr.sh",
            _ => "prepare-push.sh",
        };
        self.resource_dir.join("scripts").join(name)
    }

    fn display_script<'a>(&self, script: &'a Path) -> std::path::Display<'a> {
        script
            .strip_prefix(&self.scripts_root)
            .unwrap_or(script)
            .display()
    }
}

/// Starts `count` workers sharing `intake`. Each worker exits once the
/// channel is closed and drained.
pub fn spawn_workers(
    count: usize,
    intake: mpsc::Receiver<Arc<Job>>,
    settings: Arc<WorkerSettings>,
) -> Vec<JoinHandle<()>> {
    let intake = Arc::new(Mutex::new(intake));
    (0..count)
        .map(|worker| {
            tokio::spawn(worker_loop(
                worker,
                Arc::clone(&intake),
                Arc::clone(&settings),
            ))
        })
        .collect()
}

async fn worker_loop(
    worker: usize,
    intake: Arc<Mutex<mpsc::Receiver<Arc<Job>>>>,
    settings: Arc<WorkerSettings>,
) {
    tracing::debug!(worker, "worker started");
    loop {
        let next = intake.lock().await.recv().await;
        let Some(job) = next else {
            break;
        };

        // Run in its own task so a panic fails the job instead of the worker.
        let handle = tokio::spawn(process_job(Arc::clone(&job), Arc::clone(&settings)));
        if let Err(e) = handle.await {
            tracing::error!(worker, job_id = %job.id(), error = %e, "job processing aborted");
            finish(&job, JobStatus::Error, "internal error while running job").await;
            close_log(&job).await;
        }
    }
    tracing::debug!(worker, "worker stopped");
}

/// Runs a job to completion: prepare script, then the user script.
///
/// The job log is closed on every path.
pub async fn process_job(job: Arc<Job>, settings: Arc<WorkerSettings>) {
    let span = tracing::info_span!("job", job_id = %job.id());
    async {
        tracing::info!("processing job");
        run_job(&job, &settings).await;
        close_log(&job).await;
    }
    .instrument(span)
    .await
}

async fn run_job(job: &Job, settings: &WorkerSettings) {
    if let Some(reason) = job.cancel_requested() {
        finish(job, JobStatus::Cancelled, reason.description()).await;
        return;
    }
    if let Err(e) = job.set_status(JobStatus::Executing, RUNNING_DESCRIPTION) {
        tracing::warn!(error = %e, "job not runnable");
        return;
    }

    let record = job.record();
    let env = record.event.env_vars();
    let steps = [
        (PREPARE_SECTION.to_string(), settings.prepare_script(record.kind)),
        (
            format!("Run {}", settings.display_script(&record.script)),
            record.script.clone(),
        ),
    ];

    for (title, script) in steps {
        if let Err(e) = job.log().section(&title).await {
            tracing::warn!(error = %e, "failed to write job log");
        }
        let req = ExecRequest {
            script,
            workdir: job.git_dir(),
            env: env.clone(),
            artifact_dir: job.artifacts_dir(),
            timeout: settings.max_execution_time,
        };
        if let Err(err) = run_script(&req, job.cancel_token(), job.log()).await {
            tracing::info!(step = %title, error = %err, "job step failed");
            let (status, description) = classify(job, &err);
            finish(job, status, description).await;
            return;
        }
    }

    finish(job, JobStatus::Success, SUCCESS_DESCRIPTION).await;
}

fn classify(job: &Job, err: &ExecError) -> (JobStatus, String) {
    match err {
        ExecError::Cancelled => {
            let reason = job.cancel_requested().unwrap_or(CancelReason::User);
            (JobStatus::Cancelled, reason.description().to_string())
        }
        ExecError::TimedOut(_) => (JobStatus::Timeout, err.to_string()),
        ExecError::Exit(code) => (JobStatus::Error, format!("script failed with code {code}")),
        other => (JobStatus::Error, other.to_string()),
    }
}

async fn finish(job: &Job, status: JobStatus, description: impl Into<String>) {
    if let Err(e) = job.set_status(status, description) {
        tracing::warn!(job_id = %job.id(), error = %e, "final status not applied");
    }
    if let Err(e) = job.save().await {
        tracing::error!(job_id = %job.id(), error = %e, "failed to save job");
    }
}

async fn close_log(job: &Job) {
    if let Err(e) = job.log().close().await {
        tracing::warn!(job_id = %job.id(), error = %e, "failed to close job log");
    }
}
