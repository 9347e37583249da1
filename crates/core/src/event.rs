//! Gitea webhook payloads and how they map onto jobs.
//!
//! Only the fields microci routes on or exports to scripts are modelled;
//! everything else in the payload is ignored on parse. All fields default so
//! a partial payload still deserializes.

use serde::{Deserialize, Serialize};

const BRANCH_REF_PREFIX: &str = "refs/heads/";

/// Kind of webhook event, from the `X-Gitea-Event` header.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Branch push.
    Push,
    /// Pull request opened or synchronized.
    PullRequest,
    /// Anything else. Never produces a job.
    #[serde(other)]
    Other,
}

impl EventType {
    /// Parses a Gitea event header value.
    pub fn from_header(value: &str) -> Self {
        match value.trim() {
            "push" => Self::Push,
            "pull_request" => Self::PullRequest,
            _ => Self::Other,
        }
    }
}

/// A Gitea user or organisation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct User {
    /// Numeric id.
    pub id: i64,
    /// Login name.
    pub login: String,
    /// Display name.
    pub full_name: String,
    /// E-mail address, may be empty.
    pub email: String,
}

/// A repository as embedded in webhook payloads.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Repository {
    /// Numeric id.
    pub id: i64,
    /// Short name, e.g. `widgets`.
    pub name: String,
    /// `owner/name`.
    pub full_name: String,
    /// Web URL.
    pub html_url: String,
    /// HTTP clone URL.
    pub clone_url: String,
    /// SSH clone URL.
    pub ssh_url: String,
    /// Default branch name.
    pub default_branch: String,
    /// Owning user or organisation.
    pub owner: User,
}

/// One side (head or base) of a pull request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PullRequestBranch {
    /// Branch name.
    #[serde(rename = "ref")]
    pub git_ref: String,
    /// Commit sha at the time of the event.
    pub sha: String,
    /// Repository the branch lives in. Null when a fork was deleted.
    pub repo: Option<Repository>,
}

/// Pull request section of a `pull_request` payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PullRequest {
    /// Global numeric id, used for the queue name.
    pub id: i64,
    /// Per-repository number.
    pub number: i64,
    /// Title.
    pub title: String,
    /// Web URL.
    pub html_url: String,
    /// Source branch.
    pub head: PullRequestBranch,
    /// Target branch.
    pub base: PullRequestBranch,
}

/// A webhook payload (push or pull request).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Event {
    /// Pushed ref, e.g. `refs/heads/main`. Empty for pull requests.
    #[serde(rename = "ref")]
    pub git_ref: String,
    /// Sha before the push.
    pub before: String,
    /// Sha after the push.
    pub after: String,
    /// Compare link for the push.
    pub compare_url: String,
    /// Pull request action, e.g. `opened`. Empty for pushes.
    pub action: String,
    /// Repository the hook is configured on.
    pub repository: Repository,
    /// User who pushed.
    pub pusher: Option<User>,
    /// User who triggered the event.
    pub sender: Option<User>,
    /// Present on pull request events.
    pub pull_request: Option<PullRequest>,
}

/// Where a job for an event belongs and which commit it reports on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRoute {
    /// Branch whose scripts apply (push branch, or the PR base branch).
    pub branch: String,
    /// Queue the job is appended to.
    pub queue_name: String,
    /// `owner/name` of the repository the commit status is posted to.
    pub commit_repo: String,
    /// Commit sha the status is posted to.
    pub commit_id: String,
}

impl Event {
    /// Works out the queue, script branch and status target for `kind`.
    ///
    /// Returns `None` for unsupported event kinds and for pull request events
    /// without a `pull_request` section.
    pub fn route(&self, kind: EventType) -> Option<EventRoute> {
        match kind {
            EventType::Push => {
                let branch = self
                    .git_ref
                    .strip_prefix(BRANCH_REF_PREFIX)
                    .unwrap_or(&self.git_ref)
                    .to_string();
                Some(EventRoute {
                    queue_name: branch.clone(),
                    branch,
                    commit_repo: self.repository.full_name.clone(),
                    commit_id: self.after.clone(),
                })
            }
            EventType::PullRequest => {
                let pr = self.pull_request.as_ref()?;
                let commit_repo = pr
                    .head
                    .repo
                    .as_ref()
                    .map(|repo| repo.full_name.as_str())
                    .filter(|name| !name.is_empty())
                    .unwrap_or(self.repository.full_name.as_str())
                    .to_string();
                Some(EventRoute {
                    branch: pr.base.git_ref.clone(),
                    queue_name: format!("PR #{}", pr.id),
                    commit_repo,
                    commit_id: pr.head.sha.clone(),
                })
            }
            EventType::Other => None,
        }
    }

    /// Environment variables exported to job scripts.
    ///
    /// Names are the upper-cased field names, nested records joined with `_`
    /// (`REPOSITORY_FULLNAME`, `PULLREQUEST_HEAD_SHA`). Order is stable.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        let mut vars = Vec::new();
        let mut env = EnvWriter::new(&mut vars);
        env.set("REF", &self.git_ref);
        env.set("BEFORE", &self.before);
        env.set("AFTER", &self.after);
        env.set("COMPAREURL", &self.compare_url);
        env.set("ACTION", &self.action);
        self.repository.export(&mut env.nested("REPOSITORY"));
        if let Some(pusher) = &self.pusher {
            pusher.export(&mut env.nested("PUSHER"));
        }
        if let Some(sender) = &self.sender {
            sender.export(&mut env.nested("SENDER"));
        }
        if let Some(pr) = &self.pull_request {
            pr.export(&mut env.nested("PULLREQUEST"));
        }
        vars
    }
}

impl User {
    fn export(&self, env: &mut EnvWriter<'_>) {
        env.set("ID", self.id);
        env.set("LOGIN", &self.login);
        env.set("FULLNAME", &self.full_name);
        env.set("EMAIL", &self.email);
    }
}

impl Repository {
    fn export(&self, env: &mut EnvWriter<'_>) {
        env.set("ID", self.id);
        env.set("NAME", &self.name);
        env.set("FULLNAME", &self.full_name);
        env.set("HTMLURL", &self.html_url);
        env.set("CLONEURL", &self.clone_url);
        env.set("SSHURL", &self.ssh_url);
        env.set("DEFAULTBRANCH", &self.default_branch);
        self.owner.export(&mut env.nested("OWNER"));
    }
}

impl PullRequestBranch {
    fn export(&self, env: &mut EnvWriter<'_>) {
        env.set("REF", &self.git_ref);
        env.set("SHA", &self.sha);
        if let Some(repo) = &self.repo {
            repo.export(&mut env.nested("REPO"));
        }
    }
}

impl PullRequest {
    fn export(&self, env: &mut EnvWriter<'_>) {
        env.set("ID", self.id);
        env.set("NUMBER", self.number);
        env.set("TITLE", &self.title);
        env.set("HTMLURL", &self.html_url);
        self.head.export(&mut env.nested("HEAD"));
        self.base.export(&mut env.nested("BASE"));
    }
}

struct EnvWriter<'a> {
    vars: &'a mut Vec<(String, String)>,
    prefix: String,
}

impl<'a> EnvWriter<'a> {
    fn new(vars: &'a mut Vec<(String, String)>) -> Self {
        Self {
            vars,
            prefix: String::new(),
        }
    }

    fn nested(&mut self, name: &str) -> EnvWriter<'_> {
        EnvWriter {
            prefix: self.key(name),
            vars: &mut *self.vars,
        }
    }

    fn key(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}_{}", self.prefix, name)
        }
    }

    fn set(&mut self, name: &str, value: impl ToString) {
        let key = self.key(name);
        self.vars.push((key, value.to_string()));
    }
}
