//! Git provider client: repository URL parsing and pull-request lookup.

use async_trait::async_trait;
use crew_core::PrStatus;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use serde::Deserialize;
use thiserror::Error;

const DEFAULT_API_URL: &str = "https://api.github.com";

#[derive(Debug, Error)]
pub enum GitHubError {
    #[error("not a GitHub repository url: {0}")]
    InvalidRepoUrl(String),
    #[error("pull request not found: {owner}/{repo}#{number}")]
    NotFound {
        owner: String,
        repo: String,
        number: i64,
    },
    #[error("HTTP error: {status} - {message}")]
    Http { status: u16, message: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid token: {0}")]
    InvalidToken(String),
}

pub type Result<T> = std::result::Result<T, GitHubError>;

/// Owner and name of a hosted repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    pub owner: String,
    pub repo: String,
}

impl RepoRef {
    /// Lowercase `owner/repo`, used to compare URLs of different forms.
    pub fn slug(&self) -> String {
        format!("{}/{}", self.owner, self.repo).to_lowercase()
    }
}

/// Parse `https://github.com/o/r(.git)`, `ssh://git@github.com/o/r.git`
/// and `git@github.com:o/r.git`.
pub fn parse_repo_url(url: &str) -> Result<RepoRef> {
    let invalid = || GitHubError::InvalidRepoUrl(url.to_string());
    let trimmed = url.trim().trim_end_matches('/');

    let path = if let Some(rest) = trimmed.strip_prefix("git@") {
        rest.split_once(':').map(|(_, path)| path).ok_or_else(invalid)?
    } else {
        let without_scheme = trimmed
            .split_once("://")
            .map(|(_, rest)| rest)
            .ok_or_else(invalid)?;
        without_scheme
            .split_once('/')
            .map(|(_, path)| path)
            .ok_or_else(invalid)?
    };

    let path = path.strip_suffix(".git").unwrap_or(path);
    let mut parts = path.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(owner), Some(repo), None) if !owner.is_empty() && !repo.is_empty() => Ok(RepoRef {
            owner: owner.to_string(),
            repo: repo.to_string(),
        }),
        _ => Err(invalid()),
    }
}

/// Whether two repository URLs name the same repository.
pub fn same_repo(a: &str, b: &str) -> bool {
    match (parse_repo_url(a), parse_repo_url(b)) {
        (Ok(a), Ok(b)) => a.slug() == b.slug(),
        _ => a.trim_end_matches('/') == b.trim_end_matches('/'),
    }
}

/// Remote pull request state as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestState {
    pub number: i64,
    pub status: PrStatus,
}

#[async_trait]
pub trait GitProvider: Send + Sync {
    async fn fetch_pull_request(
        &self,
        repo: &RepoRef,
        number: i64,
    ) -> Result<PullRequestState>;
}

#[derive(Debug, Deserialize)]
struct PullResponse {
    number: i64,
    state: String,
    #[serde(default)]
    merged: bool,
    #[serde(default)]
    merged_at: Option<String>,
}

impl PullResponse {
    fn status(&self) -> PrStatus {
        if self.merged || self.merged_at.is_some() {
            PrStatus::Merged
        } else if self.state == "closed" {
            PrStatus::Closed
        } else {
            PrStatus::Open
        }
    }
}

/// REST client for the GitHub API.
#[derive(Debug, Clone)]
pub struct GitHubClient {
    base_url: String,
    http: reqwest::Client,
}

impl GitHubClient {
    pub fn new(token: Option<&str>) -> Result<Self> {
        Self::with_base_url(DEFAULT_API_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: Option<&str>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert(USER_AGENT, HeaderValue::from_static("crewd"));
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| GitHubError::InvalidToken(e.to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }
        let http = reqwest::Client::builder().default_headers(headers).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }
}

#[async_trait]
impl GitProvider for GitHubClient {
    async fn fetch_pull_request(
        &self,
        repo: &RepoRef,
        number: i64,
    ) -> Result<PullRequestState> {
        let url = format!(
            "{}/repos/{}/{}/pulls/{number}",
            self.base_url, repo.owner, repo.repo
        );
        let response = self.http.get(&url).send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(GitHubError::NotFound {
                owner: repo.owner.clone(),
                repo: repo.repo.clone(),
                number,
            });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(GitHubError::Http {
                status: status.as_u16(),
                message,
            });
        }
        let pull: PullResponse = response.json().await?;
        Ok(PullRequestState {
            number: pull.number,
            status: pull.status(),
        })
    }
}
