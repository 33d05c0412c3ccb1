//! crewctl - CLI client for crewd.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

mod client;
mod render;

use clap::{Parser, Subcommand};
use client::{Client, ClientError, GcRequest, StartRunRequest};
use crew_core::Id;

const DEFAULT_ADDR: &str = "http://127.0.0.1:7710";

/// CLI client for the crewd orchestrator daemon.
#[derive(Parser)]
#[command(name = "crewctl")]
#[command(about = "Control plane for the crewd attempt orchestrator")]
#[command(version)]
struct Cli {
    /// Daemon address
    #[arg(long, global = true, env = "CREWD_ADDR", default_value = DEFAULT_ADDR)]
    addr: String,

    /// Auth token for daemon API
    #[arg(long, global = true, env = "CREWD_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a run over a project's tasks
    Start {
        /// Project ID
        project_id: String,

        /// Task to include (repeatable); defaults to every runnable task
        #[arg(short, long = "task")]
        tasks: Vec<String>,

        /// Maximum concurrently executing attempts
        #[arg(short = 'j', long)]
        max_parallel: Option<u32>,
    },

    /// Stop a run and all of its unfinished attempts
    Stop {
        /// Run ID
        run_id: String,

        #[arg(long)]
        reason: Option<String>,
    },

    /// Stop a single attempt
    #[command(name = "stop-attempt")]
    StopAttempt {
        /// Attempt ID
        attempt_id: String,

        #[arg(long)]
        reason: Option<String>,
    },

    /// Show a project's current run, or a run by ID
    Status {
        /// Project ID
        project_id: String,

        /// Show this run with its attempts instead
        #[arg(long)]
        run: Option<String>,
    },

    /// List recent runs of a project
    History {
        /// Project ID
        project_id: String,

        #[arg(short = 'n', long, default_value_t = 20)]
        limit: u32,
    },

    /// Show an attempt with its artifacts
    Attempt {
        /// Attempt ID
        attempt_id: String,
    },

    /// Remove stale attempt workspaces
    Gc {
        /// Only attempts finished at least this long ago
        #[arg(long)]
        min_age_minutes: Option<u32>,

        /// Maximum workspaces to remove
        #[arg(long)]
        limit: Option<u32>,
    },

    /// Record a pull request for an attempt, or refresh its status
    #[command(name = "sync-pr")]
    SyncPr {
        /// Attempt ID
        attempt_id: String,

        /// Record this PR number before syncing
        #[arg(long, requires = "url")]
        number: Option<i64>,

        /// PR URL, with --number
        #[arg(long)]
        url: Option<String>,
    },

    /// Merge a completed attempt into its base branch
    Apply {
        /// Attempt ID
        attempt_id: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let client = Client::new(&cli.addr, cli.token.as_deref());

    if let Err(e) = client.wait_for_ready().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }

    if let Err(e) = dispatch(&client, cli.command).await {
        match &e {
            ClientError::Api {
                reason: Some(reason),
                ..
            } => eprintln!("error: {e} [{reason}]"),
            _ => eprintln!("error: {e}"),
        }
        std::process::exit(1);
    }
}

async fn dispatch(client: &Client, command: Command) -> Result<(), ClientError> {
    match command {
        Command::Start {
            project_id,
            tasks,
            max_parallel,
        } => {
            let req = StartRunRequest {
                task_ids: (!tasks.is_empty())
                    .then(|| tasks.into_iter().map(Id::from_string).collect()),
                max_parallel,
            };
            let resp = client.start_run(&project_id, &req).await?;
            render::print_run_started(&resp);
        }
        Command::Stop { run_id, reason } => {
            let report = client.stop_run(&run_id, reason.as_deref()).await?;
            render::print_stop_report(&report);
        }
        Command::StopAttempt { attempt_id, reason } => {
            let stop = client.stop_attempt(&attempt_id, reason.as_deref()).await?;
            render::print_attempt_stop(&stop);
        }
        Command::Status { project_id, run } => match run {
            Some(run_id) => {
                let detail = client.get_run(&run_id).await?;
                render::print_run_details(&detail.run, &detail.attempts);
            }
            None => {
                let view = client.run_status(&project_id).await?;
                render::print_run_status(&view);
            }
        },
        Command::History { project_id, limit } => {
            let runs = client.history(&project_id, limit).await?;
            render::print_run_list(&runs);
        }
        Command::Attempt { attempt_id } => {
            let detail = client.get_attempt(&attempt_id).await?;
            render::print_attempt(&detail.attempt, &detail.artifacts);
        }
        Command::Gc {
            min_age_minutes,
            limit,
        } => {
            let report = client
                .gc(&GcRequest {
                    min_age_minutes,
                    limit,
                })
                .await?;
            render::print_gc_report(&report);
        }
        Command::SyncPr {
            attempt_id,
            number,
            url,
        } => {
            if let (Some(number), Some(url)) = (number, url.as_deref()) {
                client.record_pr(&attempt_id, number, url).await?;
                println!("Recorded PR #{number}");
            }
            let sync = client.sync_pr(&attempt_id).await?;
            render::print_pr_sync(&sync);
        }
        Command::Apply { attempt_id } => {
            let report = client.apply(&attempt_id).await?;
            render::print_apply_report(&report);
        }
    }
    Ok(())
}
