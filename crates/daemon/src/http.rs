//! HTTP surface: Gitea webhook intake and job inspection.

use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Path as UrlPath, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use hmac::{Hmac, Mac};
use microci_core::event::{Event, EventType};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tower_http::trace::TraceLayer;

use crate::job::{CancelReason, Job, JobSnapshot};
use crate::manager::{Manager, ManagerError, TriggerOptions};

/// Header carrying the Gitea event kind.
pub const EVENT_HEADER: &str = "x-gitea-event";
/// Header carrying the hex HMAC-SHA256 of the body.
pub const SIGNATURE_HEADER: &str = "x-gitea-signature";

const LOG_POLL_INTERVAL: Duration = Duration::from_millis(500);
const LOG_CHUNK: u64 = 64 * 1024;

type HmacSha256 = Hmac<Sha256>;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// Job manager.
    pub manager: Arc<Manager>,
    /// Webhook secret; `None` accepts unsigned requests.
    pub secret_key: Option<String>,
}

impl AppState {
    /// State for `manager`. An empty secret disables signature checks.
    pub fn new(manager: Arc<Manager>, secret_key: &str) -> Self {
        Self {
            manager,
            secret_key: (!secret_key.is_empty()).then(|| secret_key.to_string()),
        }
    }
}

/// Handler errors, rendered as `{"error": "..."}`.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed request.
    #[error("{0}")]
    BadRequest(String),
    /// Missing or wrong webhook signature.
    #[error("{0}")]
    Unauthorized(String),
    /// Unknown job or artifact.
    #[error("{0}")]
    NotFound(String),
    /// Shutting down.
    #[error("{0}")]
    Unavailable(String),
    /// Anything else.
    #[error("{0}")]
    Internal(String),
}

impl From<ManagerError> for ApiError {
    fn from(e: ManagerError) -> Self {
        match e {
            ManagerError::NotFound(_) => Self::NotFound(e.to_string()),
            ManagerError::InvalidPath { .. } => Self::BadRequest(e.to_string()),
            ManagerError::ShuttingDown => Self::Unavailable(e.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Optional overrides on the webhook URL.
#[derive(Debug, Default, Deserialize)]
pub struct TriggerQuery {
    /// Script name.
    pub script: Option<String>,
    /// Status context.
    pub context: Option<String>,
}

/// `GET /job/{id}` body.
#[derive(Debug, Serialize)]
pub struct JobView {
    /// Job state.
    #[serde(flatten)]
    pub job: JobSnapshot,
    /// File names under `artifacts/`.
    pub artifacts: Vec<String>,
}

/// Builds the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/webhook/gitea", post(gitea_webhook))
        .route("/job/{id}", get(get_job))
        .route("/job/{id}/logs", get(get_job_logs))
        .route("/job/{id}/cancel", get(cancel_job))
        .route("/job/{id}/artifacts/{name}", get(get_artifact))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn gitea_webhook(
    State(state): State<AppState>,
    Query(query): Query<TriggerQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    if let Some(secret) = &state.secret_key {
        let signature = header_str(&headers, SIGNATURE_HEADER)
            .ok_or_else(|| ApiError::Unauthorized("missing webhook signature".into()))?;
        if !verify_signature(&body, signature, secret) {
            return Err(ApiError::Unauthorized(
                "webhook signature verification failed".into(),
            ));
        }
    }

    let kind = header_str(&headers, EVENT_HEADER)
        .map(EventType::from_header)
        .unwrap_or(EventType::Other);
    if kind == EventType::Other {
        return Ok(ignored());
    }

    let event: Event = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid webhook payload: {e}")))?;
    let opts = TriggerOptions {
        script: query.script,
        context: query.context,
    };
    match state.manager.handle_event(kind, event, opts).await? {
        Some(job_id) => Ok(Json(json!({ "job_id": job_id })).into_response()),
        None => Ok(ignored()),
    }
}

async fn get_job(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
) -> Result<Json<JobView>, ApiError> {
    let job = state.manager.get_job(&id).await?;
    let artifacts = list_artifacts(&job.artifacts_dir()).await;
    Ok(Json(JobView {
        job: job.snapshot(),
        artifacts,
    }))
}

async fn get_job_logs(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
) -> Result<Response, ApiError> {
    let job = state.manager.get_job(&id).await?;
    let body = Body::from_stream(tail_log(job));
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response())
}

async fn cancel_job(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
) -> Result<Redirect, ApiError> {
    let job = state.manager.get_job(&id).await?;
    job.cancel(CancelReason::User);
    Ok(Redirect::to(&format!("/job/{}", job.id())))
}

async fn get_artifact(
    State(state): State<AppState>,
    UrlPath((id, name)): UrlPath<(String, String)>,
) -> Result<Response, ApiError> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(ApiError::BadRequest(format!("invalid artifact name {name:?}")));
    }
    let job = state.manager.get_job(&id).await?;
    let path = job.artifacts_dir().join(&name);
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| ApiError::NotFound(format!("artifact {name} not found")))?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    )
        .into_response())
}

fn ignored() -> Response {
    (StatusCode::ACCEPTED, Json(json!({ "status": "ignored" }))).into_response()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Checks a Gitea signature: hex HMAC-SHA256 of `body`, optionally prefixed
/// with `sha256=`.
pub fn verify_signature(body: &[u8], signature: &str, secret: &str) -> bool {
    let digest_hex = signature.trim();
    let digest_hex = digest_hex.strip_prefix("sha256=").unwrap_or(digest_hex);
    let Ok(expected) = hex::decode(digest_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

async fn list_artifacts(dir: &Path) -> Vec<String> {
    let mut names = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return names;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    names
}

/// Streams the job log from the start, following it until the job finishes.
fn tail_log(
    job: Arc<Job>,
) -> impl futures_util::Stream<Item = Result<Vec<u8>, std::io::Error>> + Send + 'static {
    futures_util::stream::unfold(Some((job, 0u64)), |state| async move {
        let (job, offset) = state?;
        loop {
            // Status first: lines written before the final status are still read.
            let finished = job.status().is_finished();
            match read_chunk(job.log().path(), offset).await {
                Ok(chunk) if !chunk.is_empty() => {
                    let next = offset + chunk.len() as u64;
                    return Some((Ok(chunk), Some((job, next))));
                }
                Ok(_) if finished => return None,
                Ok(_) => tokio::time::sleep(LOG_POLL_INTERVAL).await,
                Err(e) => return Some((Err(e), None)),
            }
        }
    })
}

async fn read_chunk(path: &Path, offset: u64) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = Vec::new();
    file.take(LOG_CHUNK).read_to_end(&mut buf).await?;
    Ok(buf)
}
