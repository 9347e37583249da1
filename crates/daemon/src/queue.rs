//! Per-repository job queues.
//!
//! A queue groups the jobs of one branch (or pull request) and status
//! context. Queues and repositories are created on first use and never
//! removed.

use std::sync::{Arc, Mutex};

use crate::job::Job;
use crate::lock_unpoisoned;

/// Jobs sharing a (queue name, context) key, newest first.
#[derive(Debug)]
pub struct Queue {
    name: String,
    context: String,
    jobs: Mutex<Vec<Arc<Job>>>,
}

impl Queue {
    fn new(name: &str, context: &str) -> Self {
        Self {
            name: name.to_string(),
            context: context.to_string(),
            jobs: Mutex::new(Vec::new()),
        }
    }

    /// Queue name: a branch or `PR #<id>`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Status context.
    pub fn context(&self) -> &str {
        &self.context
    }

    /// Adds `job` as the most recent job.
    pub fn add_job(&self, job: Arc<Job>) {
        lock_unpoisoned(&self.jobs).insert(0, job);
    }

    /// Most recent job, if any.
    pub fn last_job(&self) -> Option<Arc<Job>> {
        lock_unpoisoned(&self.jobs).first().cloned()
    }

    /// All jobs, newest first.
    pub fn jobs(&self) -> Vec<Arc<Job>> {
        lock_unpoisoned(&self.jobs).clone()
    }
}

/// A repository and its queues.
#[derive(Debug)]
pub struct Repository {
    name: String,
    queues: Mutex<Vec<Arc<Queue>>>,
}

impl Repository {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            queues: Mutex::new(Vec::new()),
        }
    }

    /// `owner/name`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the queue for (`name`, `context`), creating it if needed.
    pub fn get_queue(&self, name: &str, context: &str) -> Arc<Queue> {
        let mut queues = lock_unpoisoned(&self.queues);
        if let Some(q) = queues
            .iter()
            .find(|q| q.name == name && q.context == context)
        {
            return Arc::clone(q);
        }
        let q = Arc::new(Queue::new(name, context));
        queues.push(Arc::clone(&q));
        q
    }

    /// All queues in creation order.
    pub fn queues(&self) -> Vec<Arc<Queue>> {
        lock_unpoisoned(&self.queues).clone()
    }
}

/// All repositories seen so far.
#[derive(Debug, Default)]
pub struct RepositoryRegistry {
    repos: Mutex<Vec<Arc<Repository>>>,
}

impl RepositoryRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the repository `name`, creating it if needed.
    pub fn get_repo(&self, name: &str) -> Arc<Repository> {
        let mut repos = lock_unpoisoned(&self.repos);
        if let Some(r) = repos.iter().find(|r| r.name == name) {
            return Arc::clone(r);
        }
        let r = Arc::new(Repository::new(name));
        repos.push(Arc::clone(&r));
        r
    }

    /// All repositories in creation order.
    pub fn repos(&self) -> Vec<Arc<Repository>> {
        lock_unpoisoned(&self.repos).clone()
    }
}
