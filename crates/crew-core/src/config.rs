//! Configuration parsing for the attempt orchestrator.
//!
//! Uses the key=value format of `.crew/config`:
//! `#` comments, optional single or double quotes around values.
//! Precedence: CLI flags > `--config` file > defaults.

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("invalid number value for {key}: {value}")]
    InvalidNumber { key: String, value: String },
}

/// Orchestrator configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    // Admission
    /// `maxParallel` used when a start request omits it.
    pub max_parallel_default: u32,
    /// Maximum completed attempts with an open pull request per project.
    pub open_pr_limit: u32,
    /// Skip every safety gate check.
    pub safety_bypass: bool,
    /// Spend limit per calendar month (UTC); `None` disables the budget check.
    pub monthly_budget_usd: Option<f64>,

    // Agent runner
    pub agent_command: String,
    pub agent_model: String,
    /// Timeout per agent invocation in seconds (0 = no timeout).
    pub agent_timeout_sec: u32,
    /// How long a stop request waits for the agent process to exit.
    pub agent_stop_timeout_sec: u32,

    // Workspaces
    pub worktree_root: PathBuf,
    pub branch_prefix: String,
    /// Branches teardown never deletes (the project default branch is always protected).
    pub protected_branches: Vec<String>,
    /// Tear down failed/stopped attempt workspaces right after the terminal transition.
    pub cleanup_on_failure: bool,

    // Stale workspace collection
    pub gc_interval_sec: u64,
    pub gc_min_age_minutes: u32,
    pub gc_limit: u32,

    // Webhooks
    /// Accept webhooks without signature verification. Never enable in production.
    pub webhook_test_mode: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_parallel_default: 1,
            open_pr_limit: 1,
            safety_bypass: false,
            monthly_budget_usd: None,
            agent_command: "claude".to_string(),
            agent_model: "opus".to_string(),
            agent_timeout_sec: 1800,
            agent_stop_timeout_sec: 10,
            worktree_root: dirs::data_local_dir().map_or_else(
                || PathBuf::from("~/.local/share/crewd/worktrees"),
                |d| d.join("crewd/worktrees"),
            ),
            branch_prefix: "crew/".to_string(),
            protected_branches: vec!["main".to_string(), "master".to_string()],
            cleanup_on_failure: true,
            gc_interval_sec: 1800,
            gc_min_age_minutes: 60,
            gc_limit: 50,
            webhook_test_mode: false,
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse config content (key=value format).
    pub fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    /// Apply a single config value.
    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "max_parallel_default" => self.max_parallel_default = Self::parse_int(key, value)?,
            "open_pr_limit" => self.open_pr_limit = Self::parse_int(key, value)?,
            "safety_bypass" => self.safety_bypass = Self::parse_bool(key, value)?,
            "monthly_budget_usd" => {
                self.monthly_budget_usd = if value.is_empty() {
                    None
                } else {
                    Some(value.parse().map_err(|_| ConfigError::InvalidNumber {
                        key: key.to_string(),
                        value: value.to_string(),
                    })?)
                };
            }
            "agent_command" => self.agent_command = value.to_string(),
            "agent_model" => self.agent_model = value.to_string(),
            "agent_timeout_sec" => self.agent_timeout_sec = Self::parse_int(key, value)?,
            "agent_stop_timeout_sec" => self.agent_stop_timeout_sec = Self::parse_int(key, value)?,
            "worktree_root" => self.worktree_root = PathBuf::from(value),
            "branch_prefix" => self.branch_prefix = value.to_string(),
            "protected_branches" => {
                self.protected_branches = value.split_whitespace().map(String::from).collect();
            }
            "cleanup_on_failure" => self.cleanup_on_failure = Self::parse_bool(key, value)?,
            "gc_interval_sec" => self.gc_interval_sec = Self::parse_int(key, value)?,
            "gc_min_age_minutes" => self.gc_min_age_minutes = Self::parse_int(key, value)?,
            "gc_limit" => self.gc_limit = Self::parse_int(key, value)?,
            "webhook_test_mode" => self.webhook_test_mode = Self::parse_bool(key, value)?,
            _ => {
                // Unknown keys are tolerated so older daemons can read newer files.
                eprintln!("Warning: unknown config key: {key}");
            }
        }
        Ok(())
    }

    fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Parse a boolean value.
    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Whether `branch` must survive workspace teardown.
    pub fn is_protected_branch(&self, branch: &str, default_branch: &str) -> bool {
        branch == default_branch || self.protected_branches.iter().any(|b| b == branch)
    }
}
