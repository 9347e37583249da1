//! Shared fixtures for daemon integration tests.

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use microci_core::event::Event;
use microci_core::model::{JobStatus, StatusPayload};
use microci_daemon::config::Config;
use microci_daemon::job::Job;
use microci_daemon::manager::Manager;
use microci_daemon::status::{CommitStatusApi, StatusError};

/// Records every status push.
#[derive(Default)]
pub struct RecordingApi {
    pub calls: Mutex<Vec<(String, String, StatusPayload)>>,
}

impl RecordingApi {
    pub fn calls(&self) -> Vec<(String, String, StatusPayload)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommitStatusApi for RecordingApi {
    async fn update_commit_state(
        &self,
        repo: &str,
        commit: &str,
        status: &StatusPayload,
    ) -> Result<(), StatusError> {
        self.calls
            .lock()
            .unwrap()
            .push((repo.to_string(), commit.to_string(), status.clone()));
        Ok(())
    }
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub cfg: Config,
    pub api: Arc<RecordingApi>,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        let mut cfg = Config::default();
        cfg.server.address = "http://ci.test".into();
        cfg.gitea.url = "http://git.test".into();
        cfg.gitea.token = "token".into();
        cfg.jobs.folder = root.join("jobs");
        cfg.jobs.workers = 2;
        cfg.jobs.max_execution_time_secs = 30;
        cfg.jobs.default_context = "ci".into();
        cfg.scripts.folder = root.join("scripts");
        cfg.resource_dir = root.join("resources");

        std::fs::create_dir_all(&cfg.jobs.folder).unwrap();
        std::fs::create_dir_all(&cfg.scripts.folder).unwrap();
        write_script(
            &cfg.resource_dir.join("scripts/prepare-push.sh"),
            "echo \"preparing push $AFTER\"",
        );
        write_script(
            &cfg.resource_dir.join("scripts/prepare-pr.sh"),
            "echo \"preparing pr $PULLREQUEST_HEAD_SHA\"",
        );

        Self {
            dir,
            cfg,
            api: Arc::new(RecordingApi::default()),
        }
    }

    /// Writes an executable script at `<scripts>/<rel>`.
    pub fn script(&self, rel: &str, body: &str) -> PathBuf {
        let path = self.cfg.scripts.folder.join(rel);
        write_script(&path, body);
        path
    }

    /// Creates `<scripts>/<rel>` as an empty directory.
    pub fn scripts_dir(&self, rel: &str) {
        std::fs::create_dir_all(self.cfg.scripts.folder.join(rel)).unwrap();
    }

    pub fn start(&self) -> Arc<Manager> {
        Manager::start(&self.cfg, self.api.clone())
    }
}

pub fn write_script(path: &Path, body: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

pub fn push_event(repo: &str, branch: &str, after: &str) -> Event {
    serde_json::from_value(serde_json::json!({
        "ref": format!("refs/heads/{branch}"),
        "before": "0000000",
        "after": after,
        "repository": { "full_name": repo, "name": repo.rsplit('/').next().unwrap() },
        "pusher": { "login": "dev" },
    }))
    .unwrap()
}

pub fn pr_event(repo: &str, fork: &str, pr_id: i64, base: &str, head_sha: &str) -> Event {
    serde_json::from_value(serde_json::json!({
        "action": "synchronized",
        "repository": { "full_name": repo },
        "pull_request": {
            "id": pr_id,
            "number": 1,
            "head": { "ref": "feature", "sha": head_sha, "repo": { "full_name": fork } },
            "base": { "ref": base, "sha": "base000", "repo": { "full_name": repo } },
        },
    }))
    .unwrap()
}

pub async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

pub async fn wait_for_status(job: &Job, status: JobStatus) {
    wait_for(&format!("job {} to be {status}", job.id()), || {
        job.status() == status
    })
    .await;
}

/// Waits until the job is finished and its final record is on disk.
pub async fn wait_for_saved(job: &Job) -> serde_json::Value {
    let path = job.folder().join("info.json");
    let mut last = serde_json::Value::Null;
    for _ in 0..1000 {
        if job.status().is_finished() {
            if let Ok(bytes) = std::fs::read(&path) {
                if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&bytes) {
                    if value["status"] == job.status().as_str() {
                        return value;
                    }
                    last = value;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job {} never saved a finished record, last: {last}", job.id());
}
