//! HTTP client for the crewd daemon.

use crew_core::{
    Artifact, Attempt, AttemptStatus, Id, MergeStatus, PrStatus, Run, RunCounts, RunStatus,
};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::RequestBuilder;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("daemon not running at {addr}\n  → start with: crewd\n  → or set CREWD_ADDR if using a different address")]
    ConnectionFailed { addr: String },

    #[error("{message} ({code})")]
    Api {
        status: u16,
        code: String,
        message: String,
        reason: Option<String>,
    },

    #[error("HTTP error: {status} - {message}")]
    HttpError { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("unauthorized: check CREWD_TOKEN env var or --token flag")]
    Unauthorized,

    #[error(
        "daemon not ready after {timeout_ms}ms at {addr}\n  → ensure crewd is running\n  → check CREWD_TOKEN if auth is enabled"
    )]
    DaemonNotReady { addr: String, timeout_ms: u64 },
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            let addr = e
                .url()
                .map_or_else(|| "unknown".to_string(), ToString::to_string);
            ClientError::ConnectionFailed { addr }
        } else {
            ClientError::HttpError {
                status: e.status().map_or(0, |s| s.as_u16()),
                message: e.to_string(),
            }
        }
    }
}

/// Request payload for POST /projects/{id}/runs.
#[derive(Debug, Default, Serialize)]
pub struct StartRunRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_ids: Option<Vec<Id>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_parallel: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct StartRunResponse {
    pub run_id: Id,
    pub run: Run,
}

#[derive(Debug, Deserialize)]
struct ListRunsResponse {
    runs: Vec<Run>,
}

/// Current run of a project.
#[derive(Debug, Deserialize)]
pub struct RunStatusView {
    pub has_run: bool,
    pub run_id: Option<Id>,
    pub status: Option<RunStatus>,
    pub max_parallel: Option<u32>,
    pub counts: RunCounts,
}

#[derive(Debug, Deserialize)]
pub struct RunDetail {
    pub run: Run,
    pub attempts: Vec<Attempt>,
}

#[derive(Debug, Deserialize)]
pub struct AttemptDetail {
    pub attempt: Attempt,
    pub artifacts: Vec<Artifact>,
}

#[derive(Debug, Deserialize)]
pub struct StopReport {
    pub stopped: bool,
    pub cancelled_count: u32,
    pub failed_to_cancel_count: u32,
}

#[derive(Debug, Deserialize)]
pub struct AttemptStop {
    pub status: AttemptStatus,
    pub signalled: bool,
}

#[derive(Debug, Deserialize)]
pub struct GcReport {
    pub scanned: u32,
    pub removed: u32,
    pub failed: u32,
}

#[derive(Debug, Deserialize)]
pub struct PrSync {
    pub status: PrStatus,
    pub changed: bool,
}

#[derive(Debug, Deserialize)]
pub struct ApplyReport {
    pub merge_status: MergeStatus,
    #[serde(default)]
    pub conflict_files: Vec<String>,
    #[serde(default)]
    pub apply_error: Option<String>,
}

#[derive(Debug, Serialize)]
struct StopRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct RecordPrRequest<'a> {
    number: i64,
    url: &'a str,
}

#[derive(Debug, Default, Serialize)]
pub struct GcRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_age_minutes: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

/// Error response from API.
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    code: String,
    #[serde(default)]
    reason: Option<String>,
}

/// Default total timeout for the daemon readiness probe.
const DEFAULT_READY_TIMEOUT_MS: u64 = 5000;

/// Initial backoff delay for the readiness probe.
const INITIAL_BACKOFF_MS: u64 = 200;

/// HTTP client for crewd.
#[derive(Debug)]
pub struct Client {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: &str, token: Option<&str>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
            http: reqwest::Client::new(),
        }
    }

    /// Check if daemon is healthy by probing /health.
    pub async fn check_health(&self) -> Result<bool, ClientError> {
        let url = format!("{}/health", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        Ok(response.status().is_success())
    }

    /// Wait for the daemon to answer /health, backing off exponentially.
    pub async fn wait_for_ready(&self) -> Result<(), ClientError> {
        self.wait_for_ready_with_timeout(DEFAULT_READY_TIMEOUT_MS)
            .await
    }

    pub async fn wait_for_ready_with_timeout(&self, timeout_ms: u64) -> Result<(), ClientError> {
        let start = std::time::Instant::now();
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            if let Ok(true) = self.check_health().await {
                return Ok(());
            }
            let elapsed = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
            if elapsed >= timeout_ms {
                return Err(ClientError::DaemonNotReady {
                    addr: self.base_url.clone(),
                    timeout_ms,
                });
            }

            eprintln!(
                "waiting for daemon at {} (retrying in {}ms)",
                self.base_url, backoff_ms
            );

            let sleep_ms = backoff_ms.min(timeout_ms.saturating_sub(elapsed));
            tokio::time::sleep(std::time::Duration::from_millis(sleep_ms)).await;
            backoff_ms = backoff_ms.saturating_mul(2);
        }
    }

    /// Build headers with optional auth token.
    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(token) = &self.token {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        headers
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.http
            .get(format!("{}{path}", self.base_url))
            .headers(self.headers())
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.http
            .post(format!("{}{path}", self.base_url))
            .headers(self.headers())
    }

    /// Send a request and decode a successful JSON body.
    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ClientError> {
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }
        response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    async fn error_from(response: reqwest::Response) -> ClientError {
        let status = response.status().as_u16();
        if status == 401 {
            return ClientError::Unauthorized;
        }
        match response.json::<ErrorResponse>().await {
            Ok(body) => ClientError::Api {
                status,
                code: body.code,
                message: body.error,
                reason: body.reason,
            },
            Err(_) => ClientError::HttpError {
                status,
                message: "unknown error".to_string(),
            },
        }
    }

    /// POST /projects/{id}/runs
    pub async fn start_run(
        &self,
        project_id: &str,
        req: &StartRunRequest,
    ) -> Result<StartRunResponse, ClientError> {
        self.send(self.post(&format!("/projects/{project_id}/runs")).json(req))
            .await
    }

    /// GET /projects/{id}/run
    pub async fn run_status(&self, project_id: &str) -> Result<RunStatusView, ClientError> {
        self.send(self.get(&format!("/projects/{project_id}/run")))
            .await
    }

    /// GET /projects/{id}/runs
    pub async fn history(&self, project_id: &str, limit: u32) -> Result<Vec<Run>, ClientError> {
        let body: ListRunsResponse = self
            .send(self.get(&format!("/projects/{project_id}/runs?limit={limit}")))
            .await?;
        Ok(body.runs)
    }

    /// GET /runs/{id}
    pub async fn get_run(&self, run_id: &str) -> Result<RunDetail, ClientError> {
        self.send(self.get(&format!("/runs/{run_id}"))).await
    }

    /// POST /runs/{id}/stop
    pub async fn stop_run(
        &self,
        run_id: &str,
        reason: Option<&str>,
    ) -> Result<StopReport, ClientError> {
        self.send(
            self.post(&format!("/runs/{run_id}/stop"))
                .json(&StopRequest { reason }),
        )
        .await
    }

    /// GET /attempts/{id}
    pub async fn get_attempt(&self, attempt_id: &str) -> Result<AttemptDetail, ClientError> {
        self.send(self.get(&format!("/attempts/{attempt_id}")))
            .await
    }

    /// POST /attempts/{id}/stop
    pub async fn stop_attempt(
        &self,
        attempt_id: &str,
        reason: Option<&str>,
    ) -> Result<AttemptStop, ClientError> {
        self.send(
            self.post(&format!("/attempts/{attempt_id}/stop"))
                .json(&StopRequest { reason }),
        )
        .await
    }

    /// POST /attempts/{id}/pr
    pub async fn record_pr(
        &self,
        attempt_id: &str,
        number: i64,
        url: &str,
    ) -> Result<Attempt, ClientError> {
        self.send(
            self.post(&format!("/attempts/{attempt_id}/pr"))
                .json(&RecordPrRequest { number, url }),
        )
        .await
    }

    /// POST /attempts/{id}/pr/sync
    pub async fn sync_pr(&self, attempt_id: &str) -> Result<PrSync, ClientError> {
        self.send(self.post(&format!("/attempts/{attempt_id}/pr/sync")))
            .await
    }

    /// POST /attempts/{id}/apply
    pub async fn apply(&self, attempt_id: &str) -> Result<ApplyReport, ClientError> {
        self.send(self.post(&format!("/attempts/{attempt_id}/apply")))
            .await
    }

    /// POST /gc
    pub async fn gc(&self, req: &GcRequest) -> Result<GcReport, ClientError> {
        self.send(self.post("/gc").json(req)).await
    }
}
