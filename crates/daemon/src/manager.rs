//! Orchestration: webhook events to jobs, job lookup and restart recovery.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

use microci_core::event::{Event, EventType};
use microci_core::is_valid_job_id;
use microci_core::model::JobStatus;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::Config;
use crate::job::{CancelReason, Job, JobContext, JobError, JobSpec};
use crate::lock_unpoisoned;
use crate::queue::RepositoryRegistry;
use crate::status::CommitStatusApi;
use crate::worker::{spawn_workers, WorkerSettings};

/// Script run when the webhook does not name one.
pub const DEFAULT_SCRIPT: &str = "default.sh";

const INTAKE_CAPACITY: usize = 1;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Manager errors.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// Job setup or loading failed.
    #[error(transparent)]
    Job(#[from] JobError),
    /// No job with this id, in memory or on disk.
    #[error("job {0} not found")]
    NotFound(String),
    /// A path component taken from the request is unsafe.
    #[error("invalid {what}: {value:?}")]
    InvalidPath {
        /// Which input.
        what: &'static str,
        /// Offending value.
        value: String,
    },
    /// The intake channel is closed.
    #[error("manager is shutting down")]
    ShuttingDown,
    /// Scanning the jobs folder failed.
    #[error("failed to read jobs folder {}: {source}", path.display())]
    Io {
        /// Jobs folder.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Per-request overrides from the webhook URL.
#[derive(Debug, Clone, Default)]
pub struct TriggerOptions {
    /// Script name instead of `default.sh`.
    pub script: Option<String>,
    /// Status context instead of the configured default.
    pub context: Option<String>,
}

/// Owns the job index, the repository registry and the worker pool.
pub struct Manager {
    jobs_ctx: JobContext,
    scripts_root: PathBuf,
    cancel_previous: bool,
    default_context: String,
    jobs: RwLock<HashMap<String, Arc<Job>>>,
    repos: RepositoryRegistry,
    intake: Mutex<Option<mpsc::Sender<Arc<Job>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Manager {
    /// Builds the manager and starts `cfg.jobs.workers` workers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(cfg: &Config, status_api: Arc<dyn CommitStatusApi>) -> Arc<Self> {
        let scripts_root = absolute(&cfg.scripts.folder);
        let jobs_ctx = JobContext {
            jobs_root: absolute(&cfg.jobs.folder),
            server_address: cfg.server.address.clone(),
            status_api,
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        };
        let settings = Arc::new(WorkerSettings {
            scripts_root: scripts_root.clone(),
            resource_dir: absolute(&cfg.resource_dir),
            max_execution_time: cfg.jobs.max_execution_time(),
        });

        let workers = cfg.jobs.workers.max(1);
        let (tx, rx) = mpsc::channel(INTAKE_CAPACITY);
        let handles = spawn_workers(workers, rx, settings);
        tracing::info!(workers, jobs = %jobs_ctx.jobs_root.display(), "manager started");

        Arc::new(Self {
            jobs_ctx,
            scripts_root,
            cancel_previous: cfg.jobs.cancel_previous,
            default_context: cfg.jobs.default_context.clone(),
            jobs: RwLock::new(HashMap::new()),
            repos: RepositoryRegistry::new(),
            intake: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
        })
    }

    /// Repositories and queues seen so far.
    pub fn repos(&self) -> &RepositoryRegistry {
        &self.repos
    }

    /// Root of the job folders.
    pub fn jobs_root(&self) -> &Path {
        &self.jobs_ctx.jobs_root
    }

    /// Turns an authenticated webhook event into a queued job.
    ///
    /// Returns `Ok(None)` when the event is ignored: unsupported kind, no
    /// scripts folder for the repository, or no matching script. Waits for a
    /// free worker slot when the intake channel is full.
    pub async fn handle_event(
        &self,
        kind: EventType,
        event: Event,
        opts: TriggerOptions,
    ) -> Result<Option<String>, ManagerError> {
        let Some(route) = event.route(kind) else {
            tracing::debug!(?kind, "ignoring unsupported event");
            return Ok(None);
        };

        let repository = event.repository.full_name.clone();
        if repository.is_empty() {
            tracing::info!(?kind, "ignoring event without a repository");
            return Ok(None);
        }
        let repo_path = self
            .scripts_root
            .join(safe_relative("repository", &repository)?);
        if !is_dir(&repo_path).await {
            tracing::info!(
                repository = %repository,
                path = %repo_path.display(),
                "ignoring event, repository has no scripts folder"
            );
            return Ok(None);
        }

        let script_name = opts
            .script
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_SCRIPT.to_string());
        let script_rel = safe_relative("script", &script_name)?;

        let mut candidates = Vec::with_capacity(3);
        if !route.branch.is_empty() {
            let branch_rel = safe_relative("branch", &route.branch)?;
            candidates.push(repo_path.join(branch_rel).join(&script_rel));
        }
        candidates.push(repo_path.join(&script_rel));
        candidates.push(self.scripts_root.join(&script_rel));

        let mut script = None;
        for candidate in candidates {
            if is_file(&candidate).await {
                script = Some(candidate);
                break;
            }
        }
        let Some(script) = script else {
            tracing::info!(repository = %repository, script = %script_name, "ignoring event, no matching script");
            return Ok(None);
        };

        let context = opts
            .context
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| self.default_context.clone());

        let intake = lock_unpoisoned(&self.intake).clone();
        let Some(intake) = intake else {
            return Err(ManagerError::ShuttingDown);
        };

        let job = Job::setup(
            &self.jobs_ctx,
            JobSpec {
                kind,
                event,
                script,
                repository: repository.clone(),
                queue_name: route.queue_name.clone(),
                context: context.clone(),
                commit_repo: route.commit_repo,
                commit_id: route.commit_id,
            },
        )
        .await?;
        let id = job.id().to_string();

        self.jobs
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(id.clone(), Arc::clone(&job));

        let queue = self
            .repos
            .get_repo(&repository)
            .get_queue(&route.queue_name, &context);
        if self.cancel_previous {
            if let Some(previous) = queue.last_job() {
                if !previous.status().is_finished() {
                    previous.cancel(CancelReason::Superseded);
                }
            }
        }
        queue.add_job(Arc::clone(&job));

        tracing::info!(
            job_id = %id,
            repository = %repository,
            queue = %route.queue_name,
            context = %context,
            script = %job.record().script.display(),
            "job queued"
        );

        if intake.send(Arc::clone(&job)).await.is_err() {
            job.cancel(CancelReason::Shutdown);
            job.set_status(JobStatus::Cancelled, CancelReason::Shutdown.description())?;
            job.save().await?;
            if let Err(e) = job.log().close().await {
                tracing::warn!(job_id = %id, error = %e, "failed to close job log");
            }
            return Err(ManagerError::ShuttingDown);
        }
        Ok(Some(id))
    }

    /// Looks a job up in memory, then on disk.
    ///
    /// A job loaded from disk is indexed and added to its queue but never
    /// queued for execution again.
    pub async fn get_job(&self, id: &str) -> Result<Arc<Job>, ManagerError> {
        if let Some(job) = self.read_jobs().get(id) {
            return Ok(Arc::clone(job));
        }
        if !is_valid_job_id(id) || !is_dir(&self.jobs_ctx.jobs_root.join(id)).await {
            return Err(ManagerError::NotFound(id.to_string()));
        }

        let loaded = Job::load(&self.jobs_ctx, id).await?;
        Ok(self.index_loaded(loaded))
    }

    /// Indexes a job read from disk and adds it to its queue, unless a job
    /// with the same id is already known.
    fn index_loaded(&self, loaded: Arc<Job>) -> Arc<Job> {
        let (job, inserted) = {
            let mut jobs = self
                .jobs
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            match jobs.entry(loaded.id().to_string()) {
                Entry::Occupied(e) => (Arc::clone(e.get()), false),
                Entry::Vacant(e) => (Arc::clone(e.insert(loaded)), true),
            }
        };
        if inserted {
            let record = job.record();
            self.repos
                .get_repo(&record.repository)
                .get_queue(&record.queue_name, &record.context)
                .add_job(Arc::clone(&job));
        }
        job
    }

    /// Rehydrates every job folder in creation order, so each queue ends up
    /// with its newest job first. Broken folders are logged and skipped.
    ///
    /// Records without a creation time are ordered by folder mtime.
    pub async fn load_jobs(&self) -> Result<usize, ManagerError> {
        let root = &self.jobs_ctx.jobs_root;
        let io_err = |source: std::io::Error| ManagerError::Io {
            path: root.clone(),
            source,
        };
        tokio::fs::create_dir_all(root).await.map_err(io_err)?;

        let mut found = Vec::new();
        let mut dir = tokio::fs::read_dir(root).await.map_err(io_err)?;
        while let Some(entry) = dir.next_entry().await.map_err(io_err)? {
            let meta = match entry.metadata().await {
                Ok(meta) if meta.is_dir() => meta,
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!(path = %entry.path().display(), error = %e, "skipping job folder");
                    continue;
                }
            };
            let id = entry.file_name().to_string_lossy().into_owned();
            if self.read_jobs().contains_key(&id) {
                continue;
            }
            if !is_valid_job_id(&id) {
                tracing::warn!(job_id = %id, "skipping job folder with invalid name");
                continue;
            }
            match Job::load(&self.jobs_ctx, &id).await {
                Ok(job) => {
                    let created = match job.record().created_at_ms {
                        0 => mtime_ms(&meta),
                        ms => ms,
                    };
                    found.push((created, id, job));
                }
                Err(e) => tracing::warn!(job_id = %id, error = %e, "skipping job folder"),
            }
        }
        found.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));

        let loaded = found.len();
        for (_, _, job) in found {
            self.index_loaded(job);
        }
        tracing::info!(loaded, "jobs loaded from disk");
        Ok(loaded)
    }

    /// Closes the intake channel, cancels every job, waits for the workers
    /// and gives in-flight status pushes a short grace period.
    pub async fn shutdown(&self) {
        drop(lock_unpoisoned(&self.intake).take());
        {
            let jobs = self.read_jobs();
            for job in jobs.values() {
                if !job.status().is_finished() {
                    job.cancel(CancelReason::Shutdown);
                }
            }
        }
        self.jobs_ctx.shutdown.cancel();

        let workers = std::mem::take(&mut *lock_unpoisoned(&self.workers));
        for handle in workers {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "worker ended abnormally");
            }
        }

        self.jobs_ctx.tasks.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.jobs_ctx.tasks.wait())
            .await
            .is_err()
        {
            tracing::warn!("status pushes still pending at shutdown");
        }
        tracing::info!("manager stopped");
    }

    fn read_jobs(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Job>>> {
        self.jobs
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Accepts only plain relative components (`owner/repo`, `feature/x`, `lint.sh`).
fn safe_relative(what: &'static str, value: &str) -> Result<PathBuf, ManagerError> {
    let invalid = || ManagerError::InvalidPath {
        what,
        value: value.to_string(),
    };
    let mut out = PathBuf::new();
    for component in Path::new(value).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return Err(invalid()),
        }
    }
    if out.as_os_str().is_empty() {
        return Err(invalid());
    }
    Ok(out)
}

fn mtime_ms(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}
