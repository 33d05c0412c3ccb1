//! Webhook reconciler: mirrors pull-request state from the git provider.
//!
//! Deliveries are authenticated with an HMAC-SHA256 signature over the raw
//! body, then applied at most once per delivery id. Anything that does not
//! match a known attempt is acknowledged without writing.

use crew_core::{
    events::{EventPayload, PrStatusChangedPayload},
    Attempt, AttemptStatus, Id, PrStatus,
};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::github::{self, same_repo, GitHubError, GitProvider};
use crate::storage::{DeliveryRecord, Storage, StorageError};

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_PREFIX: &str = "sha256=";

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("invalid webhook signature")]
    InvalidSignature,
    #[error("webhook secret is not configured")]
    NotConfigured,
    #[error("attempt not found: {0}")]
    AttemptNotFound(String),
    #[error("attempt {0} is not completed")]
    NotCompleted(String),
    #[error("attempt {0} has no pull request")]
    NoPullRequest(String),
    #[error("project {0} has no remote url")]
    NoRemote(String),
    #[error("no git provider configured")]
    NoProvider,
    #[error(transparent)]
    Provider(#[from] GitHubError),
}

impl WebhookError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Storage(_) => "INTERNAL",
            Self::InvalidSignature => "UNAUTHORIZED",
            Self::NotConfigured | Self::NoProvider => "NOT_CONFIGURED",
            Self::AttemptNotFound(_) => "NOT_FOUND",
            Self::NotCompleted(_) | Self::NoPullRequest(_) | Self::NoRemote(_) => "INVALID_STATE",
            Self::Provider(_) => "PROVIDER_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, WebhookError>;

/// Signature check over the raw request body.
#[derive(Clone)]
pub struct WebhookAuth {
    secret: Option<String>,
    test_mode: bool,
}

impl std::fmt::Debug for WebhookAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookAuth")
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("test_mode", &self.test_mode)
            .finish()
    }
}

impl WebhookAuth {
    pub fn new(secret: Option<String>, test_mode: bool) -> Self {
        Self {
            secret: secret.filter(|s| !s.is_empty()),
            test_mode,
        }
    }

    /// `signature` is the `X-Hub-Signature-256` header value.
    pub fn verify(&self, signature: Option<&str>, body: &[u8]) -> Result<()> {
        if self.test_mode {
            return Ok(());
        }
        let Some(secret) = &self.secret else {
            return Err(WebhookError::NotConfigured);
        };
        let signature = signature.ok_or(WebhookError::InvalidSignature)?;
        if verify_signature(secret.as_bytes(), body, signature) {
            Ok(())
        } else {
            Err(WebhookError::InvalidSignature)
        }
    }
}

/// Hex-encoded `sha256=` signature of `body`.
pub fn sign(secret: &[u8], body: &[u8]) -> String {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return String::new();
    };
    mac.update(body);
    format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time comparison of `signature` against the expected HMAC.
pub fn verify_signature(secret: &[u8], body: &[u8], signature: &str) -> bool {
    let Some(provided) = signature
        .strip_prefix(SIGNATURE_PREFIX)
        .and_then(|h| hex::decode(h.trim()).ok())
    else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    let expected = mac.finalize().into_bytes();
    expected.as_slice().ct_eq(provided.as_slice()).into()
}

/// One pull-request webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_id: String,
    pub event: String,
    pub action: String,
    pub pr_number: i64,
    pub merged: bool,
    /// Every URL the payload gives for the repository.
    pub repo_urls: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PullRequestEvent {
    action: String,
    #[serde(default)]
    number: Option<i64>,
    pull_request: PullRequestBody,
    repository: RepositoryBody,
}

#[derive(Debug, Deserialize)]
struct PullRequestBody {
    number: i64,
    #[serde(default)]
    merged: bool,
}

#[derive(Debug, Deserialize)]
struct RepositoryBody {
    #[serde(default)]
    html_url: Option<String>,
    #[serde(default)]
    clone_url: Option<String>,
    #[serde(default)]
    ssh_url: Option<String>,
}

impl Delivery {
    /// Parse a `pull_request` event body. Other events and malformed bodies
    /// return an ignore reason.
    pub fn parse(
        delivery_id: &str,
        event: &str,
        body: &[u8],
    ) -> std::result::Result<Self, String> {
        if event != "pull_request" {
            return Err(format!("event {event} not handled"));
        }
        if delivery_id.is_empty() {
            return Err("missing delivery id".to_string());
        }
        let payload: PullRequestEvent =
            serde_json::from_slice(body).map_err(|e| format!("malformed payload: {e}"))?;
        let repo = payload.repository;
        Ok(Self {
            delivery_id: delivery_id.to_string(),
            event: event.to_string(),
            action: payload.action,
            pr_number: payload.number.unwrap_or(payload.pull_request.number),
            merged: payload.pull_request.merged,
            repo_urls: [repo.html_url, repo.clone_url, repo.ssh_url]
                .into_iter()
                .flatten()
                .collect(),
        })
    }
}

/// PR status an action maps to; `None` for actions that are ignored.
pub fn map_action(action: &str, merged: bool) -> Option<PrStatus> {
    match action {
        "opened" | "reopened" => Some(PrStatus::Open),
        "closed" if merged => Some(PrStatus::Merged),
        "closed" => Some(PrStatus::Closed),
        _ => None,
    }
}

/// Response body of a processed delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookAck {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub duplicate: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ignored: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_id: Option<Id>,
    /// New PR status when this delivery changed it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<PrStatus>,
}

impl WebhookAck {
    pub fn duplicate() -> Self {
        Self {
            duplicate: true,
            ..Self::default()
        }
    }

    pub fn ignored(reason: impl Into<String>) -> Self {
        Self {
            ignored: true,
            reason: Some(reason.into()),
            ..Self::default()
        }
    }
}

/// Result of polling the provider for one attempt's PR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PrSync {
    pub status: PrStatus,
    pub changed: bool,
}

pub struct Reconciler {
    storage: Arc<Storage>,
    provider: Option<Arc<dyn GitProvider>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("provider", &self.provider.is_some())
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    pub fn new(storage: Arc<Storage>, provider: Option<Arc<dyn GitProvider>>) -> Self {
        Self { storage, provider }
    }

    /// Apply an authenticated delivery.
    pub async fn apply(&self, delivery: &Delivery) -> Result<WebhookAck> {
        if self.storage.is_delivery_processed(&delivery.delivery_id).await? {
            debug!(delivery_id = %delivery.delivery_id, "duplicate delivery");
            return Ok(WebhookAck::duplicate());
        }

        let Some(status) = map_action(&delivery.action, delivery.merged) else {
            debug!(delivery_id = %delivery.delivery_id, action = %delivery.action, "action ignored");
            return Ok(WebhookAck::ignored(format!(
                "action {} not handled",
                delivery.action
            )));
        };

        let Some(attempt) = self.resolve_attempt(delivery).await? else {
            info!(
                delivery_id = %delivery.delivery_id,
                pr_number = delivery.pr_number,
                "delivery matches no attempt"
            );
            return Ok(WebhookAck::ignored("no matching attempt"));
        };

        let record = self
            .storage
            .apply_pr_delivery(&delivery.delivery_id, &delivery.event, &attempt.id, status)
            .await?;
        Ok(match record {
            DeliveryRecord::Duplicate => WebhookAck::duplicate(),
            DeliveryRecord::Unchanged => WebhookAck {
                attempt_id: Some(attempt.id),
                ..WebhookAck::default()
            },
            DeliveryRecord::Updated { from } => {
                info!(
                    attempt_id = %attempt.id,
                    pr_number = delivery.pr_number,
                    from = from.map_or("none", |s| s.as_str()),
                    to = status.as_str(),
                    delivery_id = %delivery.delivery_id,
                    "pull request status updated"
                );
                WebhookAck {
                    attempt_id: Some(attempt.id),
                    updated: Some(status),
                    ..WebhookAck::default()
                }
            }
        })
    }

    /// Most recently started attempt carrying the PR in the delivery's repository.
    async fn resolve_attempt(&self, delivery: &Delivery) -> Result<Option<Attempt>> {
        for project in self.storage.list_projects_with_remote().await? {
            let Some(remote) = project.repo_url.as_deref() else {
                continue;
            };
            if !delivery.repo_urls.iter().any(|url| same_repo(remote, url)) {
                continue;
            }
            if let Some(attempt) = self
                .storage
                .find_attempt_by_pr(&project.id, delivery.pr_number)
                .await?
            {
                return Ok(Some(attempt));
            }
        }
        Ok(None)
    }

    /// Attach an externally created PR to a completed attempt.
    pub async fn record_pull_request(&self, attempt_id: &Id, number: i64, url: &str) -> Result<Attempt> {
        let attempt = self.load(attempt_id).await?;
        if attempt.status != AttemptStatus::Completed {
            return Err(WebhookError::NotCompleted(attempt_id.to_string()));
        }
        let previous = attempt.pull_request.as_ref().map(|pr| pr.status);

        self.storage.record_pull_request(attempt_id, number, url).await?;
        if previous != Some(PrStatus::Open) {
            self.storage
                .append_event(
                    &attempt.run_id,
                    Some(attempt_id),
                    &EventPayload::PrStatusChanged(PrStatusChangedPayload {
                        attempt_id: attempt_id.clone(),
                        pr_number: number,
                        from: previous,
                        to: PrStatus::Open,
                        delivery_id: None,
                    }),
                )
                .await?;
        }
        info!(attempt_id = %attempt_id, pr_number = number, url, "pull request recorded");
        Ok(self.storage.get_attempt(attempt_id).await?)
    }

    /// Poll the provider for the attempt's PR state and store it if it changed.
    pub async fn sync_pull_request(&self, attempt_id: &Id) -> Result<PrSync> {
        let provider = self.provider.as_ref().ok_or(WebhookError::NoProvider)?;
        let attempt = self.load(attempt_id).await?;
        let pr = attempt
            .pull_request
            .as_ref()
            .ok_or_else(|| WebhookError::NoPullRequest(attempt_id.to_string()))?;
        let project = self.storage.get_project(&attempt.project_id).await?;
        let remote = project
            .repo_url
            .as_deref()
            .ok_or_else(|| WebhookError::NoRemote(project.id.to_string()))?;
        let repo = github::parse_repo_url(remote)?;

        let remote_state = provider.fetch_pull_request(&repo, pr.number).await?;
        let changed = self
            .storage
            .update_pr_status(attempt_id, remote_state.status)
            .await?
            .is_some();
        if changed {
            info!(
                attempt_id = %attempt_id,
                pr_number = pr.number,
                status = remote_state.status.as_str(),
                "pull request status synced"
            );
        } else {
            debug!(attempt_id = %attempt_id, pr_number = pr.number, "pull request unchanged");
        }
        Ok(PrSync {
            status: remote_state.status,
            changed,
        })
    }

    async fn load(&self, attempt_id: &Id) -> Result<Attempt> {
        match self.storage.get_attempt(attempt_id).await {
            Ok(attempt) => Ok(attempt),
            Err(StorageError::AttemptNotFound(id)) => Err(WebhookError::AttemptNotFound(id)),
            Err(e) => {
                warn!(attempt_id = %attempt_id, error = %e, "attempt lookup failed");
                Err(e.into())
            }
        }
    }
}
