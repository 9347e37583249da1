//! End-to-end tests of the manager and worker pool with real scripts.

mod common;

use std::time::Duration;

use common::{pr_event, push_event, wait_for, wait_for_saved, wait_for_status, Harness};
use microci_core::event::EventType;
use microci_core::log::{parse_log, LogLine, Stream};
use microci_core::model::{CommitState, JobStatus};
use microci_daemon::job::CancelReason;
use microci_daemon::manager::{ManagerError, TriggerOptions};

fn script_opt(name: &str) -> TriggerOptions {
    TriggerOptions {
        script: Some(name.into()),
        context: None,
    }
}

#[tokio::test]
async fn test_push_runs_branch_script_to_success() {
    let h = Harness::new();
    h.script("acme/widgets/main/push.sh", "echo hello\necho world");
    let manager = h.start();

    let id = manager
        .handle_event(
            EventType::Push,
            push_event("acme/widgets", "main", "abc123"),
            script_opt("push.sh"),
        )
        .await
        .unwrap()
        .expect("job created");
    let job = manager.get_job(&id).await.unwrap();
    let info = wait_for_saved(&job).await;

    assert_eq!(job.status(), JobStatus::Success);
    assert_eq!(info["status"], "success");
    assert_eq!(info["status_description"], "Job completed successfully!");
    assert_eq!(info["commit_id"], "abc123");
    assert_eq!(info["commit_repo"], "acme/widgets");
    assert_eq!(info["context"], "ci");

    let queue = manager.repos().get_repo("acme/widgets").get_queue("main", "ci");
    assert_eq!(queue.last_job().unwrap().id(), id);

    let log = std::fs::read_to_string(job.folder().join("logs")).unwrap();
    let lines = parse_log(&log);
    let run_at = lines
        .iter()
        .position(|l| {
            *l == LogLine::Section {
                title: "Run acme/widgets/main/push.sh".into(),
            }
        })
        .unwrap_or_else(|| panic!("no run section in {log}"));
    assert_eq!(
        lines[0],
        LogLine::Section {
            title: "Prepare git branch".into()
        }
    );
    assert!(log.contains("preparing push abc123"));
    assert_eq!(
        lines[run_at + 1],
        LogLine::Output {
            number: 1,
            stream: Stream::Stdout,
            text: "hello".into()
        }
    );
    assert_eq!(
        lines[run_at + 2],
        LogLine::Output {
            number: 2,
            stream: Stream::Stdout,
            text: "world".into()
        }
    );

    manager.shutdown().await;
    let calls = h.api.calls();
    let (repo, commit, last) = calls.last().unwrap();
    assert_eq!(repo, "acme/widgets");
    assert_eq!(commit, "abc123");
    assert_eq!(last.state, CommitState::Success);
    assert_eq!(last.target_url, format!("http://ci.test/job/{id}"));
}

#[tokio::test]
async fn test_failing_script_reports_exit_code() {
    let h = Harness::new();
    h.script("acme/widgets/default.sh", "echo oops >&2\nexit 3");
    let manager = h.start();

    let id = manager
        .handle_event(
            EventType::Push,
            push_event("acme/widgets", "main", "abc"),
            TriggerOptions::default(),
        )
        .await
        .unwrap()
        .unwrap();
    let job = manager.get_job(&id).await.unwrap();
    let info = wait_for_saved(&job).await;

    assert_eq!(job.status(), JobStatus::Error);
    assert_eq!(info["status_description"], "script failed with code 3");
    let log = std::fs::read_to_string(job.folder().join("logs")).unwrap();
    assert!(log.contains("[[stderr]]oops"));

    manager.shutdown().await;
    assert_eq!(h.api.calls().last().unwrap().2.state, CommitState::Failure);
}

#[tokio::test]
async fn test_timeout_ends_job_as_timeout() {
    let mut h = Harness::new();
    h.cfg.jobs.max_execution_time_secs = 1;
    h.script("acme/widgets/default.sh", "echo begin\nsleep 10");
    let manager = h.start();

    let id = manager
        .handle_event(
            EventType::Push,
            push_event("acme/widgets", "main", "abc"),
            TriggerOptions::default(),
        )
        .await
        .unwrap()
        .unwrap();
    let job = manager.get_job(&id).await.unwrap();
    wait_for_saved(&job).await;

    assert_eq!(job.status(), JobStatus::Timeout);
    assert!(job.record().status_description.contains("timed out"));
    let log = std::fs::read_to_string(job.folder().join("logs")).unwrap();
    assert!(log
        .lines()
        .any(|l| l.starts_with("[[stderr]]") && l.contains("timed out")));

    manager.shutdown().await;
    assert_eq!(h.api.calls().last().unwrap().2.state, CommitState::Error);
}

#[tokio::test]
async fn test_new_push_cancels_previous_job_in_queue() {
    let mut h = Harness::new();
    h.cfg.jobs.cancel_previous = true;
    h.script(
        "acme/widgets/default.sh",
        "if [ \"$AFTER\" = slow ]; then sleep 10; fi\necho done",
    );
    let manager = h.start();

    let first = manager
        .handle_event(
            EventType::Push,
            push_event("acme/widgets", "main", "slow"),
            TriggerOptions::default(),
        )
        .await
        .unwrap()
        .unwrap();
    let first = manager.get_job(&first).await.unwrap();
    wait_for_status(&first, JobStatus::Executing).await;

    let second = manager
        .handle_event(
            EventType::Push,
            push_event("acme/widgets", "main", "fast"),
            TriggerOptions::default(),
        )
        .await
        .unwrap()
        .unwrap();
    let second = manager.get_job(&second).await.unwrap();

    wait_for_saved(&first).await;
    wait_for_saved(&second).await;
    assert_eq!(first.status(), JobStatus::Cancelled);
    assert_eq!(first.cancel_reason(), Some(CancelReason::Superseded));
    assert_eq!(
        first.record().status_description,
        CancelReason::Superseded.description()
    );
    assert_eq!(second.status(), JobStatus::Success);

    let queue = manager.repos().get_repo("acme/widgets").get_queue("main", "ci");
    let ids: Vec<String> = queue.jobs().iter().map(|j| j.id().to_string()).collect();
    assert_eq!(ids, vec![second.id().to_string(), first.id().to_string()]);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_previous_job_keeps_running_without_cancel_previous() {
    let h = Harness::new();
    h.script("acme/widgets/default.sh", "echo $AFTER");
    let manager = h.start();

    let mut jobs = Vec::new();
    for sha in ["one", "two"] {
        let id = manager
            .handle_event(
                EventType::Push,
                push_event("acme/widgets", "main", sha),
                TriggerOptions::default(),
            )
            .await
            .unwrap()
            .unwrap();
        jobs.push(manager.get_job(&id).await.unwrap());
    }
    for job in &jobs {
        wait_for_saved(job).await;
        assert_eq!(job.status(), JobStatus::Success);
    }

    let queue = manager.repos().get_repo("acme/widgets").get_queue("main", "ci");
    assert_eq!(queue.last_job().unwrap().id(), jobs[1].id());
    manager.shutdown().await;
}

#[tokio::test]
async fn test_user_cancel_stops_running_job() {
    let h = Harness::new();
    h.script("acme/widgets/default.sh", "sleep 10");
    let manager = h.start();

    let id = manager
        .handle_event(
            EventType::Push,
            push_event("acme/widgets", "main", "abc"),
            TriggerOptions::default(),
        )
        .await
        .unwrap()
        .unwrap();
    let job = manager.get_job(&id).await.unwrap();
    wait_for_status(&job, JobStatus::Executing).await;

    job.cancel(CancelReason::User);
    let info = wait_for_saved(&job).await;
    assert_eq!(info["status"], "cancelled");
    assert_eq!(info["status_description"], "job cancelled");

    manager.shutdown().await;
}

#[tokio::test]
async fn test_pull_request_uses_pr_prepare_and_head_commit() {
    let h = Harness::new();
    h.script("acme/widgets/main/default.sh", "echo testing pr");
    let manager = h.start();

    let id = manager
        .handle_event(
            EventType::PullRequest,
            pr_event("acme/widgets", "fork/widgets", 42, "main", "f00d"),
            TriggerOptions {
                script: None,
                context: Some("lint".into()),
            },
        )
        .await
        .unwrap()
        .unwrap();
    let job = manager.get_job(&id).await.unwrap();
    wait_for_saved(&job).await;

    assert_eq!(job.status(), JobStatus::Success);
    let record = job.record();
    assert_eq!(record.queue_name, "PR #42");
    assert_eq!(record.commit_repo, "fork/widgets");
    assert_eq!(record.commit_id, "f00d");
    assert_eq!(record.context, "lint");
    let log = std::fs::read_to_string(job.folder().join("logs")).unwrap();
    assert!(log.contains("preparing pr f00d"));
    assert!(manager
        .repos()
        .get_repo("acme/widgets")
        .get_queue("PR #42", "lint")
        .last_job()
        .is_some());

    manager.shutdown().await;
    let (repo, commit, _) = h.api.calls().last().cloned().unwrap();
    assert_eq!((repo.as_str(), commit.as_str()), ("fork/widgets", "f00d"));
}

#[tokio::test]
async fn test_script_resolution_order() {
    let h = Harness::new();
    let global = h.script("default.sh", "echo global");
    let repo_wide = h.script("acme/widgets/default.sh", "echo repo");
    let branch = h.script("acme/widgets/release/default.sh", "echo branch");
    h.scripts_dir("acme/gadgets");
    let manager = h.start();

    for (repo, branch_name, expected) in [
        ("acme/widgets", "release", &branch),
        ("acme/widgets", "main", &repo_wide),
        ("acme/gadgets", "main", &global),
    ] {
        let id = manager
            .handle_event(
                EventType::Push,
                push_event(repo, branch_name, "abc"),
                TriggerOptions::default(),
            )
            .await
            .unwrap()
            .unwrap();
        let job = manager.get_job(&id).await.unwrap();
        assert_eq!(
            job.record().script.canonicalize().unwrap(),
            expected.canonicalize().unwrap()
        );
        wait_for_saved(&job).await;
    }
    manager.shutdown().await;
}

#[tokio::test]
async fn test_events_without_target_are_ignored() {
    let h = Harness::new();
    h.script("acme/widgets/default.sh", "echo hi");
    let manager = h.start();

    let unknown_repo = manager
        .handle_event(
            EventType::Push,
            push_event("other/repo", "main", "abc"),
            TriggerOptions::default(),
        )
        .await
        .unwrap();
    assert!(unknown_repo.is_none());

    let missing_script = manager
        .handle_event(
            EventType::Push,
            push_event("acme/widgets", "main", "abc"),
            script_opt("nope.sh"),
        )
        .await
        .unwrap();
    assert!(missing_script.is_none());

    let unsupported = manager
        .handle_event(
            EventType::Other,
            push_event("acme/widgets", "main", "abc"),
            TriggerOptions::default(),
        )
        .await
        .unwrap();
    assert!(unsupported.is_none());

    let no_repository = manager
        .handle_event(
            EventType::Push,
            push_event("", "main", "abc"),
            TriggerOptions::default(),
        )
        .await
        .unwrap();
    assert!(no_repository.is_none());

    let escaped = manager
        .handle_event(
            EventType::Push,
            push_event("acme/widgets", "main", "abc"),
            script_opt("../../etc/passwd"),
        )
        .await;
    assert!(matches!(escaped, Err(ManagerError::InvalidPath { .. })));

    assert!(std::fs::read_dir(manager.jobs_root()).unwrap().next().is_none());
    manager.shutdown().await;
    assert!(h.api.calls().is_empty());
}

#[tokio::test]
async fn test_restart_marks_unfinished_jobs_cancelled_without_rerun() {
    let h = Harness::new();
    h.script("acme/widgets/default.sh", "echo should not run");
    let id = "0123456789abcdef0123456789abcdef";
    let folder = h.cfg.jobs.folder.join(id);
    std::fs::create_dir_all(folder.join("git")).unwrap();
    std::fs::write(folder.join("logs"), "").unwrap();
    let record = serde_json::json!({
        "id": id,
        "type": "push",
        "context": "ci",
        "script": h.cfg.scripts.folder.join("acme/widgets/default.sh"),
        "repository": "acme/widgets",
        "queue_name": "main",
        "commit_id": "abc",
        "commit_repo": "acme/widgets",
        "event": push_event("acme/widgets", "main", "abc"),
        "status": "pending",
        "status_description": "Waiting for a worker",
    });
    std::fs::write(
        folder.join("info.json"),
        serde_json::to_vec_pretty(&record).unwrap(),
    )
    .unwrap();
    std::fs::create_dir_all(h.cfg.jobs.folder.join("not-a-job")).unwrap();

    let manager = h.start();
    assert_eq!(manager.load_jobs().await.unwrap(), 1);

    let job = manager.get_job(id).await.unwrap();
    assert_eq!(job.status(), JobStatus::Cancelled);
    let queue = manager.repos().get_repo("acme/widgets").get_queue("main", "ci");
    assert_eq!(queue.last_job().unwrap().id(), id);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(std::fs::read_to_string(folder.join("logs")).unwrap(), "");
    let on_disk = std::fs::read_to_string(folder.join("info.json")).unwrap();
    assert!(on_disk.contains("\"pending\""));

    manager.shutdown().await;
    assert!(h.api.calls().is_empty());
}

#[tokio::test]
async fn test_restart_rebuilds_queues_in_arrival_order() {
    let h = Harness::new();
    h.script("acme/widgets/slow.sh", "sleep 1\necho slow");
    h.script("acme/widgets/fast.sh", "echo fast");
    let manager = h.start();

    let slow = manager
        .handle_event(
            EventType::Push,
            push_event("acme/widgets", "main", "s10w"),
            script_opt("slow.sh"),
        )
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let fast = manager
        .handle_event(
            EventType::Push,
            push_event("acme/widgets", "main", "fa57"),
            script_opt("fast.sh"),
        )
        .await
        .unwrap()
        .unwrap();

    let slow_job = manager.get_job(&slow).await.unwrap();
    let fast_job = manager.get_job(&fast).await.unwrap();
    wait_for_saved(&fast_job).await;
    wait_for_saved(&slow_job).await;
    assert!(fast_job.record().finished_at_ms < slow_job.record().finished_at_ms);
    manager.shutdown().await;

    let restarted = h.start();
    assert_eq!(restarted.load_jobs().await.unwrap(), 2);
    let queue = restarted.repos().get_repo("acme/widgets").get_queue("main", "ci");
    let ids: Vec<String> = queue.jobs().iter().map(|j| j.id().to_string()).collect();
    assert_eq!(ids, vec![fast.clone(), slow.clone()]);
    assert_eq!(queue.last_job().unwrap().id(), fast);

    for id in [&slow, &fast] {
        let job = restarted.get_job(id).await.unwrap();
        assert_eq!(job.status(), JobStatus::Success);
        assert_eq!(job.cancel_reason(), None);
    }
    restarted.shutdown().await;
}

#[tokio::test]
async fn test_get_job_unknown_id() {
    let h = Harness::new();
    let manager = h.start();
    assert!(matches!(
        manager.get_job("ffffffffffffffffffffffffffffffff").await,
        Err(ManagerError::NotFound(_))
    ));
    assert!(matches!(
        manager.get_job("../jobs").await,
        Err(ManagerError::NotFound(_))
    ));
    manager.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_cancels_running_jobs() {
    let h = Harness::new();
    h.script("acme/widgets/default.sh", "sleep 10");
    let manager = h.start();

    let id = manager
        .handle_event(
            EventType::Push,
            push_event("acme/widgets", "main", "abc"),
            TriggerOptions::default(),
        )
        .await
        .unwrap()
        .unwrap();
    let job = manager.get_job(&id).await.unwrap();
    wait_for_status(&job, JobStatus::Executing).await;

    manager.shutdown().await;
    wait_for("final record", || job.status().is_finished()).await;
    let info = wait_for_saved(&job).await;
    assert_eq!(info["status"], "cancelled");
    assert_eq!(
        info["status_description"],
        CancelReason::Shutdown.description()
    );
    assert!(!job.log().is_open().await);

    let after = manager
        .handle_event(
            EventType::Push,
            push_event("acme/widgets", "main", "late"),
            TriggerOptions::default(),
        )
        .await;
    assert!(matches!(after, Err(ManagerError::ShuttingDown)));
}
