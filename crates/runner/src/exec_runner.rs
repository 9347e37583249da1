use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use microci_core::log::STDERR_PREFIX;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::job_log::JobLog;

/// Environment variable pointing scripts at the job's artifact directory.
pub const ARTIFACT_DIR_VAR: &str = "ARTIFACT_DIR";

/// `ETXTBSY` on Linux: the script was still open for writing when exec'd.
const TEXT_FILE_BUSY: i32 = 26;
const SPAWN_ATTEMPTS: u32 = 3;
const SPAWN_RETRY_DELAY: Duration = Duration::from_millis(50);

/// What to run and where.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Executable script.
    pub script: PathBuf,
    /// Working directory of the child.
    pub workdir: PathBuf,
    /// Extra environment on top of the inherited one.
    pub env: Vec<(String, String)>,
    /// Exported as [`ARTIFACT_DIR_VAR`].
    pub artifact_dir: PathBuf,
    /// Deadline for this script.
    pub timeout: Duration,
}

/// Why a script did not complete successfully.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The job's cancellation token fired.
    #[error("job cancelled")]
    Cancelled,
    /// The deadline expired first.
    #[error("job execution timed out after {}s", .0.as_secs())]
    TimedOut(Duration),
    /// The script exited with a non-zero status.
    #[error("script failed with code {0}")]
    Exit(i32),
    /// The script was terminated by a signal.
    #[error("script terminated by signal")]
    Signal,
    /// The script could not be started.
    #[error("failed to start {}: {source}", path.display())]
    Spawn {
        /// Script path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// Reading output or reaping the child failed.
    #[error("i/o error while running script: {0}")]
    Io(#[from] io::Error),
}

enum Outcome {
    Exited(io::Result<ExitStatus>),
    Cancelled,
    TimedOut,
}

/// Runs one script to completion, streaming its output into `log`.
///
/// Stdout lines are written as-is, stderr lines with the stderr prefix. Both
/// pipes are drained before the exit status is collected. Cancellation wins
/// over the deadline when both are ready; the child is killed on either.
pub async fn run_script(
    req: &ExecRequest,
    cancel: &CancellationToken,
    log: &JobLog,
) -> Result<(), ExecError> {
    if cancel.is_cancelled() {
        return Err(ExecError::Cancelled);
    }

    let mut child = spawn(req).await?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let run = async {
        let (out_res, err_res) =
            tokio::join!(copy_lines(stdout, log, ""), copy_lines(stderr, log, STDERR_PREFIX));
        out_res?;
        err_res?;
        child.wait().await
    };

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => Outcome::Cancelled,
        _ = tokio::time::sleep(req.timeout) => Outcome::TimedOut,
        res = run => Outcome::Exited(res),
    };

    match outcome {
        Outcome::Exited(Ok(status)) => {
            if status.success() {
                Ok(())
            } else if let Some(code) = status.code() {
                Err(ExecError::Exit(code))
            } else {
                Err(ExecError::Signal)
            }
        }
        Outcome::Exited(Err(e)) => {
            kill(&mut child, req).await;
            Err(ExecError::Io(e))
        }
        Outcome::Cancelled => {
            kill(&mut child, req).await;
            note(log, "job cancelled, script killed").await;
            Err(ExecError::Cancelled)
        }
        Outcome::TimedOut => {
            kill(&mut child, req).await;
            let err = ExecError::TimedOut(req.timeout);
            note(log, &format!("{err}, script killed")).await;
            Err(err)
        }
    }
}

async fn spawn(req: &ExecRequest) -> Result<Child, ExecError> {
    let mut attempt = 1;
    loop {
        let res = Command::new(&req.script)
            .current_dir(&req.workdir)
            .envs(req.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env(ARTIFACT_DIR_VAR, &req.artifact_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        match res {
            Ok(child) => return Ok(child),
            Err(e) if e.raw_os_error() == Some(TEXT_FILE_BUSY) && attempt < SPAWN_ATTEMPTS => {
                tracing::debug!(script = %req.script.display(), attempt, "script busy, retrying spawn");
                attempt += 1;
                tokio::time::sleep(SPAWN_RETRY_DELAY).await;
            }
            Err(source) => {
                return Err(ExecError::Spawn {
                    path: req.script.clone(),
                    source,
                })
            }
        }
    }
}

async fn copy_lines<R>(reader: Option<R>, log: &JobLog, prefix: &str) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return Ok(());
    };
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(());
        }
        let text = String::from_utf8_lossy(&buf);
        let text = text.trim_end_matches(['\n', '\r']);
        log.write_line(&format!("{prefix}{text}")).await?;
    }
}

async fn kill(child: &mut Child, req: &ExecRequest) {
    if let Err(e) = child.kill().await {
        tracing::debug!(script = %req.script.display(), error = %e, "kill failed");
    }
}

async fn note(log: &JobLog, text: &str) {
    if let Err(e) = log.stderr(text).await {
        tracing::warn!(path = %log.path().display(), error = %e, "failed to write job log");
    }
}
