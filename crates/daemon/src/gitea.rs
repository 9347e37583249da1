//! Gitea REST client for commit statuses.

use std::time::Duration;

use async_trait::async_trait;
use microci_core::model::StatusPayload;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};

use crate::config::GiteaConfig;
use crate::status::{CommitStatusApi, StatusError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ERROR_BODY: usize = 512;

/// Gitea REST client for commit statuses.
#[derive(Clone)]
pub struct GiteaClient {
    http: reqwest::Client,
    api_base: String,
    basic_auth: Option<(String, String)>,
}

impl GiteaClient {
    /// Builds a client from config. A token takes precedence over basic auth.
    pub fn new(cfg: &GiteaConfig) -> Result<Self, StatusError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("microci/", env!("CARGO_PKG_VERSION"))),
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let token = cfg.token.trim();
        let basic_auth = if token.is_empty() {
            Some((cfg.username.clone(), cfg.password.clone()))
        } else {
            let value = HeaderValue::from_str(&format!("token {token}"))
                .map_err(|_| StatusError::Config("gitea token is not a valid header".into()))?;
            headers.insert(AUTHORIZATION, value);
            None
        };

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            api_base: format!("{}/api/v1", cfg.url.trim_end_matches('/')),
            basic_auth,
        })
    }

    fn statuses_url(&self, repo: &str, commit: &str) -> String {
        format!("{}/repos/{repo}/statuses/{commit}", self.api_base)
    }
}

#[async_trait]
impl CommitStatusApi for GiteaClient {
    async fn update_commit_state(
        &self,
        repo: &str,
        commit: &str,
        status: &StatusPayload,
    ) -> Result<(), StatusError> {
        let mut request = self.http.post(self.statuses_url(repo, commit)).json(status);
        if let Some((user, password)) = &self.basic_auth {
            request = request.basic_auth(user, Some(password));
        }
        let response = request.send().await?;
        let code = response.status();
        if code.is_success() {
            return Ok(());
        }
        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut end = MAX_ERROR_BODY;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            body.truncate(end);
        }
        Err(StatusError::Rejected {
            status: code.as_u16(),
            body,
        })
    }
}
