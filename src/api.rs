//! HTTP surface of the installer.
//!
//! Routes live under `/api/v1/model_install`:
//! - `GET /huggingface?model_id=..` starts an install and returns its job id
//! - `GET /stream/:job_id` streams a `snapshot` of the job record, then its
//!   lifecycle events (SSE)
//! - `GET /task-status/:job_id` returns the job's current status
//! - `POST /cancel/:job_id` cancels a running job

use std::collections::HashMap;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use crate::events::LifecycleEvent;
use crate::manager::Installer;
use crate::models::{FileFailure, JobId, JobRecord, JobStatus};
use crate::registry::JobRegistry;
use crate::resolver::{ManifestFetchError, ManifestResolver};

pub const API_PREFIX: &str = "/api/v1/model_install";

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Bad gateway: {0}")]
    BadGateway(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    status: u16,
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            HttpError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            HttpError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            HttpError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            HttpError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        let body = ErrorBody { error: message, status: status.as_u16() };
        (status, Json(body)).into_response()
    }
}

impl From<ManifestFetchError> for HttpError {
    fn from(e: ManifestFetchError) -> Self {
        match &e {
            ManifestFetchError::NotFound(_) => HttpError::NotFound(e.to_string()),
            ManifestFetchError::InvalidModelId(_) => HttpError::BadRequest(e.to_string()),
            ManifestFetchError::Network(_) | ManifestFetchError::Malformed { .. } => {
                HttpError::BadGateway(e.to_string())
            }
        }
    }
}

/// Shared state of the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    installer: Arc<Installer>,
    resolver: Arc<dyn ManifestResolver>,
    registry: JobRegistry,
    /// Cancellation tokens of jobs that are still running.
    active: Arc<Mutex<HashMap<JobId, CancellationToken>>>,
    default_download_dir: PathBuf,
}

impl AppState {
    pub fn new(
        installer: Arc<Installer>,
        resolver: Arc<dyn ManifestResolver>,
        registry: JobRegistry,
        default_download_dir: PathBuf,
    ) -> Self {
        Self {
            installer,
            resolver,
            registry,
            active: Arc::new(Mutex::new(HashMap::new())),
            default_download_dir,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let routes = Router::new()
        .route("/huggingface", get(install_from_hf))
        .route("/stream/:job_id", get(stream_events))
        .route("/task-status/:job_id", get(task_status))
        .route("/cancel/:job_id", post(cancel_job));

    Router::new()
        .nest(API_PREFIX, routes)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct InstallParams {
    pub model_id: String,
    pub download_dir: Option<PathBuf>,
    pub variant: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InstallResponse {
    pub job_id: JobId,
}

async fn install_from_hf(
    State(state): State<AppState>,
    Query(params): Query<InstallParams>,
) -> Result<Json<InstallResponse>, HttpError> {
    let destination = params
        .download_dir
        .unwrap_or_else(|| state.default_download_dir.clone());

    let handle = state
        .installer
        .install_model(state.resolver.as_ref(), &params.model_id, params.variant.as_deref(), destination)
        .await?;
    let job_id = handle.id();
    info!(%job_id, model_id = %params.model_id, "install requested");

    state.active.lock().await.insert(job_id, handle.cancellation_token());
    let active = Arc::clone(&state.active);
    tokio::spawn(async move {
        if let Err(e) = handle.wait().await {
            debug!(%job_id, error = %e, "install finished with errors");
        }
        active.lock().await.remove(&job_id);
    });

    Ok(Json(InstallResponse { job_id }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskStatus {
    pub status: JobStatus,
    pub percentage: f64,
    pub errors: Vec<FileFailure>,
}

async fn task_status(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> Result<Json<TaskStatus>, HttpError> {
    let record = state
        .registry
        .status(job_id)
        .await
        .map_err(|e| HttpError::Internal(e.to_string()))?
        .ok_or_else(|| HttpError::NotFound(format!("job {job_id}")))?;

    Ok(Json(TaskStatus {
        status: record.status,
        percentage: record.percentage,
        errors: record.errors,
    }))
}

async fn cancel_job(State(state): State<AppState>, Path(job_id): Path<JobId>) -> Result<StatusCode, HttpError> {
    match state.active.lock().await.get(&job_id) {
        Some(token) => {
            token.cancel();
            info!(%job_id, "cancellation requested");
            Ok(StatusCode::ACCEPTED)
        }
        None => Err(HttpError::NotFound(format!("no running job {job_id}"))),
    }
}

/// Streams the job's events, starting with a `snapshot` of its record.
///
/// Ends after the terminal event. Unknown jobs get a single `error` event.
async fn stream_events(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send + 'static> {
    // Subscribe before reading the snapshot so nothing falls between the two.
    let updates = state.registry.subscribe();

    let (first, finished) = match state.registry.status(job_id).await {
        Ok(Some(record)) => (snapshot_event(&record), record.status.is_terminal()),
        Ok(None) => (Event::default().event("error").data("Job not found"), true),
        Err(e) => {
            warn!(%job_id, error = %e, "failed to load job for stream");
            (Event::default().event("error").data("Job state unavailable"), true)
        }
    };

    let live = stream::unfold((updates, finished), move |(mut updates, finished)| async move {
        if finished {
            return None;
        }
        loop {
            match updates.recv().await {
                Ok(update) if update.record.job_id == job_id => {
                    let terminal = update.event.is_terminal();
                    return Some((lifecycle_event(&update.event), (updates, terminal)));
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    debug!(%job_id, skipped, "stream subscriber lagged");
                    continue;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    let events = stream::once(async move { first }).chain(live).map(Ok::<_, Infallible>);
    Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

fn lifecycle_event(event: &LifecycleEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_default();
    Event::default().event(event.name()).data(data)
}

/// The job's current record. Always the first frame of a stream.
fn snapshot_event(record: &JobRecord) -> Event {
    let data = serde_json::to_string(record).unwrap_or_default();
    Event::default().event("snapshot").data(data)
}
