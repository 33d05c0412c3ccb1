//! Pre-flight admission checks for a run.
//!
//! Checks run in order and the first failure wins: repository readiness,
//! open pull-request limit, then budget.

use async_trait::async_trait;
use chrono::{Datelike, TimeZone, Utc};
use crew_core::{Config, Id, Project};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::storage::{Storage, StorageError};

/// Reason code of a failed safety check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SafetyCode {
    RepoNotReady,
    OpenPrLimit,
    BudgetExceeded,
}

impl SafetyCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RepoNotReady => "REPO_NOT_READY",
            Self::OpenPrLimit => "OPEN_PR_LIMIT",
            Self::BudgetExceeded => "BUDGET_EXCEEDED",
        }
    }
}

/// `Pass` is `{ok: true}`; `Blocked` is `{ok: false, code, reason}`.
#[derive(Debug, Clone, PartialEq)]
pub enum SafetyVerdict {
    Pass,
    Blocked { code: SafetyCode, reason: String },
}

impl SafetyVerdict {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Pass)
    }
}

/// Spend tracking for the budget check.
#[async_trait]
pub trait CostLedger: Send + Sync {
    /// Spend of the project in the current budget period.
    async fn current_spend(&self, project_id: &Id) -> Result<f64, StorageError>;

    /// Spend limit of the project; `None` means unlimited.
    async fn limit(&self, project_id: &Id) -> Result<Option<f64>, StorageError>;
}

/// Ledger over recorded attempt costs, budgeted per UTC calendar month.
#[derive(Debug)]
pub struct StorageCostLedger {
    storage: Arc<Storage>,
    monthly_limit: Option<f64>,
}

impl StorageCostLedger {
    pub fn new(storage: Arc<Storage>, monthly_limit: Option<f64>) -> Self {
        Self {
            storage,
            monthly_limit,
        }
    }
}

#[async_trait]
impl CostLedger for StorageCostLedger {
    async fn current_spend(&self, project_id: &Id) -> Result<f64, StorageError> {
        let now = Utc::now();
        let month_start = Utc
            .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
            .single()
            .unwrap_or(now);
        self.storage.sum_cost_since(project_id, month_start).await
    }

    async fn limit(&self, _project_id: &Id) -> Result<Option<f64>, StorageError> {
        Ok(self.monthly_limit)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SafetyPolicy {
    pub bypass: bool,
    pub open_pr_limit: u32,
}

impl From<&Config> for SafetyPolicy {
    fn from(config: &Config) -> Self {
        Self {
            bypass: config.safety_bypass,
            open_pr_limit: config.open_pr_limit,
        }
    }
}

pub struct SafetyGate {
    storage: Arc<Storage>,
    ledger: Arc<dyn CostLedger>,
    policy: SafetyPolicy,
}

impl std::fmt::Debug for SafetyGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafetyGate")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl SafetyGate {
    pub fn new(storage: Arc<Storage>, ledger: Arc<dyn CostLedger>, policy: SafetyPolicy) -> Self {
        Self {
            storage,
            ledger,
            policy,
        }
    }

    pub async fn check(&self, project: &Project) -> Result<SafetyVerdict, StorageError> {
        if self.policy.bypass {
            info!(project_id = %project.id, "safety checks bypassed");
            return Ok(SafetyVerdict::Pass);
        }

        if !Path::new(&project.repo_path).join(".git").exists() {
            return Ok(SafetyVerdict::Blocked {
                code: SafetyCode::RepoNotReady,
                reason: format!("repository not cloned at {}", project.repo_path),
            });
        }

        let open = self.storage.count_open_prs(&project.id).await?;
        if open >= self.policy.open_pr_limit {
            return Ok(SafetyVerdict::Blocked {
                code: SafetyCode::OpenPrLimit,
                reason: format!(
                    "{open} open pull request(s), limit is {}",
                    self.policy.open_pr_limit
                ),
            });
        }

        if let Some(limit) = self.ledger.limit(&project.id).await? {
            let spend = self.ledger.current_spend(&project.id).await?;
            if spend >= limit {
                return Ok(SafetyVerdict::Blocked {
                    code: SafetyCode::BudgetExceeded,
                    reason: format!("spend ${spend:.2} reached limit ${limit:.2}"),
                });
            }
        }

        Ok(SafetyVerdict::Pass)
    }
}
