//! Agent runner adapter.
//!
//! Spawns the agent CLI inside an attempt workspace, streams its output,
//! enforces the timeout, and lets other tasks stop a run by attempt id.

use async_trait::async_trait;
use crew_core::{Config, Id};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt};
use tokio::process::Command;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Interval between heartbeat log messages during long-running agent executions.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Timeout for capturing stdout/stderr after process exits or is killed.
const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum bytes to capture from stdout/stderr.
const MAX_OUTPUT_BYTES: usize = 8 * 1024 * 1024;

/// How long a stop that arrived before launch keeps blocking that launch.
const EARLY_STOP_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("agent command not found: {0}")]
    CommandNotFound(String),
    #[error("timeout after {0} seconds")]
    Timeout(u32),
    #[error("cancelled")]
    Cancelled,
    #[error("agent did not exit within {0} seconds of stop request")]
    StopTimeout(u32),
}

pub type Result<T> = std::result::Result<T, RunnerError>;

/// One agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub attempt_id: Id,
    pub task_id: Id,
    pub project_id: Id,
    pub workspace_path: PathBuf,
    pub prompt: String,
}

#[derive(Debug, Clone, Default)]
pub struct AgentOutput {
    pub exit_code: i32,
    /// Agent text output followed by stderr, if any.
    pub output: String,
    /// Reported by agents emitting a stream-json `result` event.
    pub cost_usd: Option<f64>,
    pub duration_ms: u64,
}

/// Start/stop contract of the agent process.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Run the agent to completion.
    ///
    /// Non-zero exits are returned as `Ok`; timeouts and cancellation are errors.
    async fn run(&self, request: &AgentRequest) -> Result<AgentOutput>;

    /// Best-effort stop of the attempt's agent, bounded in time.
    ///
    /// A stop that arrives before the agent launched must keep it from
    /// launching.
    async fn stop(&self, attempt_id: &Id) -> Result<()>;
}

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub program: String,
    /// Arguments placed before the prompt.
    pub args: Vec<String>,
    /// Timeout per agent invocation in seconds (0 = no timeout).
    pub timeout_sec: u32,
    pub stop_timeout_sec: u32,
}

impl RunnerConfig {
    /// Claude CLI invocation from the daemon config.
    pub fn from_config(config: &Config) -> Self {
        Self {
            program: config.agent_command.clone(),
            args: vec![
                "-p".to_string(),
                "--verbose".to_string(),
                "--dangerously-skip-permissions".to_string(),
                "--output-format".to_string(),
                "stream-json".to_string(),
                "--model".to_string(),
                config.agent_model.clone(),
            ],
            timeout_sec: config.agent_timeout_sec,
            stop_timeout_sec: config.agent_stop_timeout_sec,
        }
    }
}

#[derive(Debug)]
struct LiveAgent {
    cancel: CancellationToken,
    /// Cancelled once the process has been reaped.
    done: CancellationToken,
    /// Set when the stop came before any process was spawned.
    stopped_early: Option<Instant>,
}

impl LiveAgent {
    fn stopped_before_launch() -> Self {
        let cancel = CancellationToken::new();
        cancel.cancel();
        Self {
            done: cancel.clone(),
            cancel,
            stopped_early: Some(Instant::now()),
        }
    }
}

fn purge_early_stops(live: &mut HashMap<Id, LiveAgent>) {
    live.retain(|_, agent| {
        agent
            .stopped_early
            .is_none_or(|at| at.elapsed() < EARLY_STOP_TTL)
    });
}

/// Runs the agent as a child process.
#[derive(Debug)]
pub struct CommandRunner {
    config: RunnerConfig,
    live: Mutex<HashMap<Id, LiveAgent>>,
}

/// Unregisters a live agent when its run ends, however it ends.
struct Registration<'a> {
    runner: &'a CommandRunner,
    attempt_id: Id,
    done: CancellationToken,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.runner
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.attempt_id);
        self.done.cancel();
    }
}

/// How the process wait loop terminated.
enum ProcessOutcome {
    Completed(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

impl CommandRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            live: Mutex::new(HashMap::new()),
        }
    }

    /// `None` if the attempt was stopped before it got here.
    fn register(&self, attempt_id: &Id) -> Option<(Registration<'_>, CancellationToken)> {
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        purge_early_stops(&mut live);
        if live
            .get(attempt_id)
            .is_some_and(|agent| agent.stopped_early.is_some())
        {
            live.remove(attempt_id);
            return None;
        }

        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        live.insert(
            attempt_id.clone(),
            LiveAgent {
                cancel: cancel.clone(),
                done: done.clone(),
                stopped_early: None,
            },
        );
        Some((
            Registration {
                runner: self,
                attempt_id: attempt_id.clone(),
                done,
            },
            cancel,
        ))
    }

    pub fn is_live(&self, attempt_id: &Id) -> bool {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(attempt_id)
            .is_some_and(|agent| agent.stopped_early.is_none())
    }
}

#[async_trait]
impl AgentRunner for CommandRunner {
    async fn run(&self, request: &AgentRequest) -> Result<AgentOutput> {
        let attempt_id = &request.attempt_id;
        let Some((_registration, cancel_token)) = self.register(attempt_id) else {
            info!(attempt_id = %attempt_id, "attempt stopped before launch; not spawning agent");
            return Err(RunnerError::Cancelled);
        };

        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .arg(&request.prompt)
            .current_dir(&request.workspace_path)
            .env("CREW_ATTEMPT_ID", attempt_id.as_ref())
            .env("CREW_TASK_ID", request.task_id.as_ref())
            .env("CREW_PROJECT_ID", request.project_id.as_ref())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(
            attempt_id = %attempt_id,
            program = %self.config.program,
            working_dir = %request.workspace_path.display(),
            "spawning agent process"
        );

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RunnerError::CommandNotFound(self.config.program.clone())
            } else {
                RunnerError::Io(e)
            }
        })?;

        let stdout_task = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(read_stream_json(stdout, MAX_OUTPUT_BYTES)));
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(read_bounded(stderr, MAX_OUTPUT_BYTES)));

        let started = Instant::now();
        let timeout_duration = Duration::from_secs(u64::from(self.config.timeout_sec));

        let outcome = loop {
            let elapsed = started.elapsed();

            if self.config.timeout_sec > 0 && elapsed >= timeout_duration {
                warn!(
                    attempt_id = %attempt_id,
                    timeout_sec = self.config.timeout_sec,
                    "agent timed out; killing"
                );
                if let Err(err) = child.kill().await {
                    warn!(attempt_id = %attempt_id, error = %err, "failed to kill timed-out agent");
                }
                let _ = child.wait().await;
                break ProcessOutcome::TimedOut;
            }

            let remaining_timeout = if self.config.timeout_sec > 0 {
                timeout_duration.saturating_sub(elapsed)
            } else {
                Duration::MAX
            };
            let sleep_duration = HEARTBEAT_INTERVAL.min(remaining_timeout);

            tokio::select! {
                result = child.wait() => {
                    match result {
                        Ok(status) => break ProcessOutcome::Completed(status),
                        Err(e) => return Err(RunnerError::Io(e)),
                    }
                }
                () = cancel_token.cancelled() => {
                    info!(attempt_id = %attempt_id, "stop requested; killing agent");
                    if let Err(err) = child.kill().await {
                        warn!(attempt_id = %attempt_id, error = %err, "failed to kill stopped agent");
                    }
                    let _ = child.wait().await;
                    break ProcessOutcome::Cancelled;
                }
                () = tokio::time::sleep(sleep_duration) => {
                    info!(
                        attempt_id = %attempt_id,
                        elapsed_sec = started.elapsed().as_secs(),
                        timeout_sec = self.config.timeout_sec,
                        "agent still running"
                    );
                }
            }
        };

        let (text, cost_usd) = match stdout_task {
            Some(task) => match timeout(IO_CAPTURE_TIMEOUT, task).await {
                Ok(Ok(Ok(parsed))) => parsed,
                Ok(Ok(Err(err))) => {
                    warn!(attempt_id = %attempt_id, error = %err, "stdout capture failed");
                    (String::new(), None)
                }
                Ok(Err(err)) => {
                    warn!(attempt_id = %attempt_id, error = %err, "stdout task panicked");
                    (String::new(), None)
                }
                Err(_) => {
                    warn!(attempt_id = %attempt_id, "stdout capture timed out");
                    (String::new(), None)
                }
            },
            None => (String::new(), None),
        };
        let stderr = match stderr_task {
            Some(task) => match timeout(IO_CAPTURE_TIMEOUT, task).await {
                Ok(Ok(Ok(buf))) => buf,
                _ => {
                    warn!(attempt_id = %attempt_id, "stderr capture failed");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let output = if stderr.is_empty() {
            text
        } else {
            format!(
                "{text}\n\n--- STDERR ---\n{}",
                String::from_utf8_lossy(&stderr)
            )
        };

        match outcome {
            ProcessOutcome::TimedOut => Err(RunnerError::Timeout(self.config.timeout_sec)),
            ProcessOutcome::Cancelled => Err(RunnerError::Cancelled),
            ProcessOutcome::Completed(status) => {
                let exit_code = status.code().unwrap_or(-1);
                info!(
                    attempt_id = %attempt_id,
                    exit_code,
                    duration_ms,
                    output_bytes = output.len(),
                    "agent finished"
                );
                Ok(AgentOutput {
                    exit_code,
                    output,
                    cost_usd,
                    duration_ms,
                })
            }
        }
    }

    async fn stop(&self, attempt_id: &Id) -> Result<()> {
        let (cancel, done) = {
            let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
            purge_early_stops(&mut live);
            let agent = live.entry(attempt_id.clone()).or_insert_with(|| {
                debug!(attempt_id = %attempt_id, "stop requested before agent launch");
                LiveAgent::stopped_before_launch()
            });
            (agent.cancel.clone(), agent.done.clone())
        };

        cancel.cancel();
        let limit = Duration::from_secs(u64::from(self.config.stop_timeout_sec));
        timeout(limit, done.cancelled())
            .await
            .map_err(|_| RunnerError::StopTimeout(self.config.stop_timeout_sec))
    }
}

/// Read from an async reader with a maximum byte limit.
async fn read_bounded<R: tokio::io::AsyncRead + Unpin>(
    mut reader: R,
    max_bytes: usize,
) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(8192);
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }

        let remaining = max_bytes.saturating_sub(buf.len());
        if remaining == 0 {
            warn!(max_bytes, "output exceeded limit, truncating");
            while reader.read(&mut chunk).await? > 0 {}
            break;
        }

        buf.extend_from_slice(&chunk[..n.min(remaining)]);
    }

    Ok(buf)
}

/// A parsed stdout line.
#[derive(Debug, PartialEq)]
enum StreamLine {
    Text(String),
    Result { text: Option<String>, cost_usd: Option<f64> },
    Skip,
}

/// Interpret one line of `--output-format stream-json` output.
///
/// Lines that are not JSON are kept verbatim so plain-text agents still
/// produce output.
fn parse_stream_line(line: &str) -> StreamLine {
    let Ok(event) = serde_json::from_str::<serde_json::Value>(line) else {
        return StreamLine::Text(format!("{line}\n"));
    };

    match event.get("type").and_then(|t| t.as_str()) {
        Some("content_block_delta") => event
            .get("delta")
            .filter(|d| d.get("type").and_then(|t| t.as_str()) == Some("text_delta"))
            .and_then(|d| d.get("text"))
            .and_then(|t| t.as_str())
            .map_or(StreamLine::Skip, |t| StreamLine::Text(t.to_string())),
        Some("result") => StreamLine::Result {
            text: event
                .get("result")
                .and_then(|r| r.as_str())
                .map(String::from),
            cost_usd: event.get("total_cost_usd").and_then(serde_json::Value::as_f64),
        },
        _ => StreamLine::Skip,
    }
}

/// Collect agent text and reported cost from stdout.
async fn read_stream_json<R: tokio::io::AsyncRead + Unpin>(
    reader: R,
    max_bytes: usize,
) -> std::io::Result<(String, Option<f64>)> {
    let mut lines = tokio::io::BufReader::new(reader).lines();
    let mut text = String::new();
    let mut result_text = None;
    let mut cost_usd = None;

    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match parse_stream_line(trimmed) {
            StreamLine::Text(chunk) => {
                if text.len() + chunk.len() <= max_bytes {
                    text.push_str(&chunk);
                }
            }
            StreamLine::Result { text: t, cost_usd: c } => {
                result_text = t;
                cost_usd = c;
            }
            StreamLine::Skip => {}
        }
    }

    // Streamed deltas already carry the final text; the result event is a fallback.
    if text.is_empty() {
        text = result_text.unwrap_or_default();
    }
    Ok((text, cost_usd))
}
