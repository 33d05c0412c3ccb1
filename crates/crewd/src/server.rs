//! HTTP control plane for crewd.
//!
//! Every route except `/health` and the webhook requires the bearer token
//! when one is configured. The webhook authenticates by signature instead.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use crew_core::{Artifact, Attempt, Event, Id, Run};
use futures_util::{
    stream::{self, Stream},
    StreamExt,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::apply::{ApplyError, ApplyService};
use crate::gc::WorkspaceCollector;
use crate::scheduler::{Scheduler, SchedulerError};
use crate::storage::{Storage, StorageError};
use crate::webhook::{Delivery, Reconciler, WebhookAck, WebhookAuth, WebhookError};

/// Interval between event polls of a live SSE stream.
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Default page size of run history.
const DEFAULT_HISTORY_LIMIT: u32 = 20;

/// GC bounds used when a request omits them.
#[derive(Debug, Clone, Copy)]
pub struct GcDefaults {
    pub min_age_minutes: u32,
    pub limit: u32,
}

/// Shared state for HTTP handlers.
pub struct AppState {
    pub storage: Arc<Storage>,
    pub scheduler: Arc<Scheduler>,
    pub reconciler: Arc<Reconciler>,
    pub collector: Arc<WorkspaceCollector>,
    pub applier: Arc<ApplyService>,
    pub webhook_auth: WebhookAuth,
    pub gc_defaults: GcDefaults,
    pub auth_token: Option<String>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("gc_defaults", &self.gc_defaults)
            .field("auth", &self.auth_token.is_some())
            .finish_non_exhaustive()
    }
}

/// Create the HTTP router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/projects/{id}/runs", post(start_run).get(list_runs))
        .route("/projects/{id}/run", get(run_status))
        .route("/runs/{id}", get(get_run))
        .route("/runs/{id}/stop", post(stop_run))
        .route("/runs/{id}/events", get(stream_events))
        .route("/attempts/{id}", get(get_attempt))
        .route("/attempts/{id}/stop", post(stop_attempt))
        .route("/attempts/{id}/pr", post(record_pr))
        .route("/attempts/{id}/pr/sync", post(sync_pr))
        .route("/attempts/{id}/apply", post(apply_attempt))
        .route("/webhooks/github", post(receive_webhook))
        .route("/gc", post(run_gc))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API on localhost until `shutdown` fires.
pub async fn start_server(
    state: Arc<AppState>,
    port: u16,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let router = create_router(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

// --- Errors ---

/// Error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, code: &str, error: impl std::fmt::Display) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            code: code.to_string(),
            reason: None,
        }),
    )
}

fn internal(e: impl std::fmt::Display) -> ApiError {
    error!(error = %e, "request failed");
    api_error(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", e)
}

fn storage_error(e: StorageError) -> ApiError {
    match e {
        StorageError::ProjectNotFound(_)
        | StorageError::RunNotFound(_)
        | StorageError::AttemptNotFound(_)
        | StorageError::TaskNotFound(_) => api_error(StatusCode::NOT_FOUND, "NOT_FOUND", e),
        e => internal(e),
    }
}

fn scheduler_error(e: SchedulerError) -> ApiError {
    if matches!(e, SchedulerError::Storage(_)) {
        return internal(e);
    }
    let status = match &e {
        SchedulerError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        SchedulerError::ProjectNotFound(_)
        | SchedulerError::RunNotFound(_)
        | SchedulerError::AttemptNotFound(_) => StatusCode::NOT_FOUND,
        SchedulerError::AlreadyRunning(_) => StatusCode::CONFLICT,
        SchedulerError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
        SchedulerError::PreflightFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
    };
    let (status, Json(mut body)) = api_error(status, e.code(), &e);
    if let SchedulerError::PreflightFailed { code, .. } = &e {
        body.reason = Some(code.as_str().to_string());
    }
    (status, Json(body))
}

fn webhook_error(e: WebhookError) -> ApiError {
    if matches!(e, WebhookError::Storage(_)) {
        return internal(e);
    }
    let status = match &e {
        WebhookError::InvalidSignature => StatusCode::UNAUTHORIZED,
        WebhookError::Storage(_) | WebhookError::NotConfigured | WebhookError::NoProvider => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        WebhookError::AttemptNotFound(_) => StatusCode::NOT_FOUND,
        WebhookError::NotCompleted(_)
        | WebhookError::NoPullRequest(_)
        | WebhookError::NoRemote(_) => StatusCode::CONFLICT,
        WebhookError::Provider(_) => StatusCode::BAD_GATEWAY,
    };
    api_error(status, e.code(), &e)
}

fn apply_error(e: ApplyError) -> ApiError {
    if matches!(e, ApplyError::Storage(_)) {
        return internal(e);
    }
    let status = match &e {
        ApplyError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        ApplyError::AttemptNotFound(_) => StatusCode::NOT_FOUND,
        ApplyError::NotCompleted(_) | ApplyError::NoWorkspace(_) => StatusCode::CONFLICT,
    };
    api_error(status, e.code(), &e)
}

/// Validate auth token if configured.
fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = &state.auth_token else {
        return Ok(());
    };
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.strip_prefix("Bearer ").unwrap_or(s));

    match provided {
        Some(token) if token == expected => Ok(()),
        Some(_) => Err(api_error(
            StatusCode::UNAUTHORIZED,
            "UNAUTHORIZED",
            "invalid auth token",
        )),
        None => Err(api_error(
            StatusCode::UNAUTHORIZED,
            "UNAUTHORIZED",
            "missing auth token",
        )),
    }
}

/// Parse an optional JSON body; an empty body yields the default.
fn optional_json<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, "INVALID_REQUEST", e))
}

// --- Request/Response types ---

/// Request payload for POST /projects/{id}/runs.
#[derive(Debug, Default, Deserialize)]
pub struct StartRunRequest {
    #[serde(default)]
    pub task_ids: Option<Vec<Id>>,
    #[serde(default)]
    pub max_parallel: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct StartRunResponse {
    pub run_id: Id,
    pub run: Run,
}

#[derive(Debug, Deserialize, Default)]
pub struct ListRunsQuery {
    #[serde(default)]
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct ListRunsResponse {
    pub runs: Vec<Run>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StopRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AttemptResponse {
    pub attempt: Attempt,
    pub artifacts: Vec<Artifact>,
}

#[derive(Debug, Deserialize)]
pub struct RecordPrRequest {
    pub number: i64,
    pub url: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct GcRequest {
    #[serde(default)]
    pub min_age_minutes: Option<u32>,
    #[serde(default)]
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
pub struct StreamEventsQuery {
    /// Resume after this event id.
    #[serde(default)]
    pub after: Option<String>,
}

// --- Handlers ---

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// POST /projects/{id}/runs
async fn start_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let req: StartRunRequest = optional_json(&body)?;

    let run = state
        .scheduler
        .start_run(
            &Id::from_string(id),
            req.task_ids.as_deref(),
            req.max_parallel,
        )
        .await
        .map_err(scheduler_error)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(StartRunResponse {
            run_id: run.id.clone(),
            run,
        }),
    ))
}

/// GET /projects/{id}/runs
async fn list_runs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<ListRunsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let runs = state
        .scheduler
        .runs()
        .history(
            &Id::from_string(id),
            query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT),
        )
        .await
        .map_err(storage_error)?;
    Ok(Json(ListRunsResponse { runs }))
}

/// GET /projects/{id}/run
async fn run_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let project_id = Id::from_string(id);
    state
        .storage
        .get_project(&project_id)
        .await
        .map_err(storage_error)?;
    let view = state
        .scheduler
        .runs()
        .status_for_project(&project_id)
        .await
        .map_err(storage_error)?;
    Ok(Json(view))
}

/// GET /runs/{id}
async fn get_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let detail = state
        .scheduler
        .runs()
        .detail(&Id::from_string(id))
        .await
        .map_err(storage_error)?;
    Ok(Json(detail))
}

/// POST /runs/{id}/stop
async fn stop_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let req: StopRequest = optional_json(&body)?;
    let report = state
        .scheduler
        .stop_run(&Id::from_string(id), req.reason.as_deref())
        .await
        .map_err(scheduler_error)?;
    Ok(Json(report))
}

/// GET /attempts/{id}
async fn get_attempt(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let attempt_id = Id::from_string(id);
    let attempt = state
        .storage
        .get_attempt(&attempt_id)
        .await
        .map_err(storage_error)?;
    let artifacts = state
        .storage
        .list_artifacts(&attempt_id)
        .await
        .map_err(storage_error)?;
    Ok(Json(AttemptResponse { attempt, artifacts }))
}

/// POST /attempts/{id}/stop
async fn stop_attempt(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let req: StopRequest = optional_json(&body)?;
    let stop = state
        .scheduler
        .stop_attempt(&Id::from_string(id), req.reason.as_deref())
        .await
        .map_err(scheduler_error)?;
    Ok(Json(stop))
}

/// POST /attempts/{id}/pr
async fn record_pr(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<RecordPrRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let attempt = state
        .reconciler
        .record_pull_request(&Id::from_string(id), req.number, &req.url)
        .await
        .map_err(webhook_error)?;
    Ok(Json(attempt))
}

/// POST /attempts/{id}/pr/sync
async fn sync_pr(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let sync = state
        .reconciler
        .sync_pull_request(&Id::from_string(id))
        .await
        .map_err(webhook_error)?;
    Ok(Json(sync))
}

/// POST /attempts/{id}/apply
async fn apply_attempt(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let report = state
        .applier
        .apply_attempt(&Id::from_string(id))
        .await
        .map_err(apply_error)?;
    Ok(Json(report))
}

/// POST /webhooks/github
///
/// Acknowledged with 200 unless the signature or configuration is bad.
async fn receive_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    let header_str = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    if let Err(e) = state
        .webhook_auth
        .verify(header_str("x-hub-signature-256"), &body)
    {
        warn!(error = %e, "webhook rejected");
        return Err(webhook_error(e));
    }

    let event = header_str("x-github-event").unwrap_or_default();
    let delivery_id = header_str("x-github-delivery").unwrap_or_default();
    let delivery = match Delivery::parse(delivery_id, event, &body) {
        Ok(delivery) => delivery,
        Err(reason) => {
            info!(delivery_id, event, reason = %reason, "webhook ignored");
            return Ok(Json(WebhookAck::ignored(reason)));
        }
    };

    let ack = state
        .reconciler
        .apply(&delivery)
        .await
        .map_err(webhook_error)?;
    Ok(Json(ack))
}

/// POST /gc
async fn run_gc(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let req: GcRequest = optional_json(&body)?;
    let report = state
        .collector
        .collect(
            req.min_age_minutes
                .unwrap_or(state.gc_defaults.min_age_minutes),
            req.limit.unwrap_or(state.gc_defaults.limit),
        )
        .await
        .map_err(internal)?;
    Ok(Json(report))
}

// --- Event streaming ---

/// SSE payload of one audit event.
#[derive(Debug, Serialize)]
struct SseEventData {
    id: String,
    run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    attempt_id: Option<String>,
    event_type: String,
    timestamp: i64,
    payload: serde_json::Value,
}

impl From<&Event> for SseEventData {
    fn from(event: &Event) -> Self {
        let payload: serde_json::Value =
            serde_json::from_str(&event.payload_json).unwrap_or(serde_json::Value::Null);
        SseEventData {
            id: event.id.to_string(),
            run_id: event.run_id.to_string(),
            attempt_id: event.attempt_id.as_ref().map(ToString::to_string),
            event_type: event.event_type.clone(),
            timestamp: event.timestamp.timestamp_millis(),
            payload,
        }
    }
}

fn to_sse(event: &Event) -> Result<SseEvent, Infallible> {
    let data = SseEventData::from(event);
    let json = serde_json::to_string(&data).unwrap_or_default();
    Ok(SseEvent::default()
        .event(&data.event_type)
        .data(json)
        .id(data.id))
}

/// GET /runs/{id}/events
///
/// Replays the run's events, then follows new ones until the run is
/// terminal and drained.
async fn stream_events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<StreamEventsQuery>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    check_auth(&state, &headers)?;

    let run_id = Id::from_string(id);
    state
        .storage
        .get_run(&run_id)
        .await
        .map_err(storage_error)?;

    let cursor = query.after.or_else(|| {
        headers
            .get("last-event-id")
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    });
    let storage = Arc::clone(&state.storage);

    let stream = stream::unfold(
        (storage, run_id, cursor, true),
        |(storage, run_id, cursor, first)| async move {
            if !first {
                tokio::time::sleep(EVENT_POLL_INTERVAL).await;
            }
            // Status first: events written before a terminal status are
            // then guaranteed to be in the batch below.
            let terminal = storage.get_run(&run_id).await.ok()?.status.is_terminal();
            let events = storage.list_events(&run_id, cursor.as_deref()).await.ok()?;
            if events.is_empty() && terminal {
                return None;
            }

            let next_cursor = events.last().map(|e| e.id.to_string()).or(cursor);
            let batch: Vec<_> = events.iter().map(to_sse).collect();
            Some((stream::iter(batch), (storage, run_id, next_cursor, false)))
        },
    )
    .flatten();

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
