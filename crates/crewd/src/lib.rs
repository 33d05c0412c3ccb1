//! crewd - parallel agent attempt orchestrator.
//!
//! Library components for the daemon process: run admission, the worker
//! pool, attempt workspaces, safety checks, PR reconciliation and the HTTP
//! control plane.

pub mod apply;
pub mod gc;
pub mod git;
pub mod github;
pub mod lifecycle;
pub mod run_lifecycle;
pub mod runner;
pub mod safety;
pub mod scheduler;
pub mod server;
pub mod storage;
pub mod tasks;
pub mod webhook;
pub mod worker;
pub mod workspace;

#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use crew_core::config::ConfigError;
use crew_core::Config;
use futures_util::future::join_all;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use apply::ApplyService;
use gc::WorkspaceCollector;
use github::{GitHubClient, GitProvider};
use lifecycle::AttemptLifecycle;
use run_lifecycle::RunLifecycle;
use runner::{CommandRunner, RunnerConfig};
use safety::{SafetyGate, SafetyPolicy, StorageCostLedger};
use scheduler::{Scheduler, SchedulerConfig, SchedulerParts};
use server::{AppState, GcDefaults};
use storage::{Storage, StorageError};
use webhook::{Reconciler, WebhookAuth};
use worker::{QueueReceiver, Worker, WorkerQueue};
use workspace::GitWorkspaceManager;

pub const DEFAULT_PORT: u16 = 7710;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("recovery failed: {0}")]
    Recovery(#[from] scheduler::SchedulerError),
    #[error("server error: {0}")]
    Server(#[from] std::io::Error),
}

/// Daemon configuration.
#[derive(Clone)]
pub struct DaemonConfig {
    /// Path to the SQLite database.
    pub db_path: PathBuf,
    /// HTTP server port (default: 7710).
    pub port: u16,
    /// Bearer token for the HTTP API.
    pub auth_token: Option<String>,
    /// Shared secret for webhook signatures.
    pub webhook_secret: Option<String>,
    /// Token for the GitHub API.
    pub github_token: Option<String>,
    /// Orchestrator config file; defaults apply when unset.
    pub config_path: Option<PathBuf>,
}

impl std::fmt::Debug for DaemonConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonConfig")
            .field("db_path", &self.db_path)
            .field("port", &self.port)
            .field("auth_token", &self.auth_token.is_some())
            .field("webhook_secret", &self.webhook_secret.is_some())
            .field("github_token", &self.github_token.is_some())
            .field("config_path", &self.config_path)
            .finish()
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            port: DEFAULT_PORT,
            auth_token: std::env::var("CREWD_AUTH_TOKEN").ok(),
            webhook_secret: std::env::var("CREWD_WEBHOOK_SECRET").ok(),
            github_token: std::env::var("CREWD_GITHUB_TOKEN").ok(),
            config_path: None,
        }
    }
}

/// Get the default database path (~/.local/share/crewd/crewd.db).
fn default_db_path() -> PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".local/share")
        });
    data_dir.join("crewd").join("crewd.db")
}

/// Daemon state.
pub struct Daemon {
    config: DaemonConfig,
    settings: Config,
    storage: Arc<Storage>,
    scheduler: Arc<Scheduler>,
    worker: Arc<Worker>,
    receiver: std::sync::Mutex<Option<QueueReceiver>>,
    collector: Arc<WorkspaceCollector>,
    state: Arc<AppState>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Daemon {
    /// Open storage and wire every component. Nothing runs until `start_background` or `run`.
    pub async fn new(config: DaemonConfig) -> Result<Self, DaemonError> {
        let settings = match &config.config_path {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };

        let storage = Storage::new(&config.db_path).await?;
        storage.migrate_embedded().await?;
        let storage = Arc::new(storage);

        let runner = Arc::new(CommandRunner::new(RunnerConfig::from_config(&settings)));
        let workspaces = Arc::new(GitWorkspaceManager::new(settings.clone()));
        let collector = Arc::new(WorkspaceCollector::new(
            Arc::clone(&storage),
            Arc::clone(&workspaces) as _,
        ));
        let gate = Arc::new(SafetyGate::new(
            Arc::clone(&storage),
            Arc::new(StorageCostLedger::new(
                Arc::clone(&storage),
                settings.monthly_budget_usd,
            )),
            SafetyPolicy {
                bypass: settings.safety_bypass,
                open_pr_limit: settings.open_pr_limit,
            },
        ));
        let (queue, receiver) = WorkerQueue::channel();

        let scheduler = Arc::new(Scheduler::new(
            SchedulerParts {
                storage: Arc::clone(&storage),
                tasks: Arc::clone(&storage) as _,
                gate,
                lifecycle: Arc::new(AttemptLifecycle::new(
                    Arc::clone(&storage),
                    Arc::clone(&storage) as _,
                )),
                runs: Arc::new(RunLifecycle::new(Arc::clone(&storage))),
                runner: Arc::clone(&runner) as _,
                collector: Arc::clone(&collector),
                queue,
            },
            SchedulerConfig::from(&settings),
        ));
        let worker = Arc::new(Worker::new(
            Arc::clone(&storage),
            Arc::clone(&workspaces) as _,
            runner,
            Arc::clone(&scheduler),
        ));

        let provider: Option<Arc<dyn GitProvider>> =
            match GitHubClient::new(config.github_token.as_deref()) {
                Ok(client) => Some(Arc::new(client)),
                Err(e) => {
                    warn!(error = %e, "GitHub client unavailable; PR sync disabled");
                    None
                }
            };

        let state = Arc::new(AppState {
            storage: Arc::clone(&storage),
            scheduler: Arc::clone(&scheduler),
            reconciler: Arc::new(Reconciler::new(Arc::clone(&storage), provider)),
            collector: Arc::clone(&collector),
            applier: Arc::new(ApplyService::new(Arc::clone(&storage), workspaces)),
            webhook_auth: WebhookAuth::new(
                config.webhook_secret.clone(),
                settings.webhook_test_mode,
            ),
            gc_defaults: GcDefaults {
                min_age_minutes: settings.gc_min_age_minutes,
                limit: settings.gc_limit,
            },
            auth_token: config.auth_token.clone(),
        });

        Ok(Self {
            config,
            settings,
            storage,
            scheduler,
            worker,
            receiver: std::sync::Mutex::new(Some(receiver)),
            collector,
            state,
            shutdown: CancellationToken::new(),
        })
    }

    /// Get a reference to the storage backend.
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Get a reference to the scheduler.
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Router over the daemon's components.
    pub fn router(&self) -> Router {
        server::create_router(Arc::clone(&self.state))
    }

    /// Recover persisted state and start the worker pool and GC loop.
    ///
    /// The tasks stop once `shutdown` is called. Calling this twice starts
    /// nothing the second time.
    pub async fn start_background(&self) -> Result<Vec<JoinHandle<()>>, DaemonError> {
        let receiver = self
            .receiver
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());
        let Some(receiver) = receiver else {
            warn!("background tasks already started");
            return Ok(Vec::new());
        };

        // Recovery pushes queued attempts, so the pump starts first.
        let worker = Arc::clone(&self.worker).spawn(receiver, self.shutdown.clone());
        self.scheduler.recover().await?;

        let gc = Arc::clone(&self.collector).spawn_periodic(
            Duration::from_secs(self.settings.gc_interval_sec.max(1)),
            self.settings.gc_min_age_minutes,
            self.settings.gc_limit,
            self.shutdown.clone(),
        );
        Ok(vec![worker, gc])
    }

    /// Start background tasks and serve HTTP until shutdown.
    pub async fn run(&self) -> Result<(), DaemonError> {
        info!(port = self.config.port, "crewd starting");
        info!(database = %self.config.db_path.display(), "storage opened");
        if self.config.auth_token.is_some() {
            info!("auth token: enabled");
        }
        if self.settings.webhook_test_mode {
            warn!("webhook test mode enabled; signatures are not verified");
        }

        let handles = self.start_background().await?;
        let served = server::start_server(
            Arc::clone(&self.state),
            self.config.port,
            self.shutdown.clone(),
        )
        .await;

        self.shutdown.cancel();
        join_all(handles).await;
        served?;
        info!("crewd stopped");
        Ok(())
    }

    /// Signal the daemon to shut down.
    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.shutdown.cancel();
    }
}
