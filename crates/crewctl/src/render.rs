//! Output rendering for the crewctl CLI.

use crew_core::{Artifact, Attempt, Run, RunCounts};

use crate::client::{
    ApplyReport, AttemptStop, GcReport, PrSync, RunStatusView, StartRunResponse, StopReport,
};

pub fn print_run_started(resp: &StartRunResponse) {
    println!("Started run: {}", resp.run_id);
    println!("  Tasks:        {}", resp.run.selected_task_ids.len());
    println!("  Max parallel: {}", resp.run.max_parallel);
}

pub fn print_run_status(view: &RunStatusView) {
    let (Some(run_id), Some(status)) = (&view.run_id, view.status) else {
        println!("No runs for this project.");
        return;
    };
    println!("Run: {run_id}");
    println!("  Status:       {}", status.as_str());
    if let Some(max) = view.max_parallel {
        println!("  Max parallel: {max}");
    }
    println!("  Attempts:     {}", format_counts(&view.counts));
}

/// Print a list of runs in tabular format.
pub fn print_run_list(runs: &[Run]) {
    if runs.is_empty() {
        println!("No runs found.");
        return;
    }

    println!(
        "{:<36}  {:<10}  {:<8}  {:<20}  {}",
        "ID", "STATUS", "PARALLEL", "STARTED", "ATTEMPTS"
    );
    println!("{}", "-".repeat(110));

    for run in runs {
        println!(
            "{:<36}  {:<10}  {:<8}  {:<20}  {}",
            run.id,
            run.status.as_str(),
            run.max_parallel,
            format_time(&run.started_at),
            format_counts(&run.counts),
        );
    }

    println!();
    println!("{} run(s)", runs.len());
}

/// Print a run and its attempts.
pub fn print_run_details(run: &Run, attempts: &[Attempt]) {
    println!("Run: {}", run.id);
    println!();
    println!("  Status:       {}", run.status.as_str());
    println!("  Max parallel: {}", run.max_parallel);
    println!("  Started:      {}", format_time(&run.started_at));
    if let Some(finished) = &run.finished_at {
        println!("  Finished:     {}", format_time(finished));
    }
    if let Some(error) = &run.error {
        println!("  Error:        {error}");
    }

    if attempts.is_empty() {
        return;
    }
    println!();
    println!("  Attempts:");
    println!(
        "    {:<36}  {:<10}  {:<6}  {:<14}  {}",
        "ID", "STATUS", "EXIT", "ERROR", "TASK"
    );
    println!("    {}", "-".repeat(110));
    for attempt in attempts {
        println!(
            "    {:<36}  {:<10}  {:<6}  {:<14}  {}",
            attempt.id,
            attempt.status.as_str(),
            attempt
                .exit_code
                .map_or_else(|| "-".to_string(), |c| c.to_string()),
            attempt.error_code.map_or("-", |c| c.as_str()),
            attempt.task_id,
        );
    }
}

pub fn print_attempt(attempt: &Attempt, artifacts: &[Artifact]) {
    println!("Attempt: {}", attempt.id);
    println!();
    println!("  Run:          {}", attempt.run_id);
    println!("  Task:         {}", attempt.task_id);
    println!("  Status:       {}", attempt.status.as_str());
    if let Some(code) = attempt.exit_code {
        println!("  Exit code:    {code}");
    }
    if let Some(code) = attempt.error_code {
        println!("  Error code:   {}", code.as_str());
    }
    if let Some(message) = &attempt.error_message {
        println!("  Error:        {message}");
    }
    if let Some(cost) = attempt.cost_usd {
        println!("  Cost:         ${cost:.2}");
    }

    if let Some(ws) = &attempt.workspace {
        println!();
        println!("  Workspace:");
        println!("    Path:         {}", ws.path);
        println!("    Branch:       {}", ws.branch_name);
        println!("    Base:         {} @ {}", ws.base_branch, short_sha(&ws.base_commit));
        if let Some(cleanup) = attempt.cleanup_status {
            println!("    Cleanup:      {}", cleanup.as_str());
        }
    }

    if let Some(pr) = &attempt.pull_request {
        println!();
        println!("  Pull request: #{} ({})", pr.number, pr.status.as_str());
        println!("    {}", pr.url);
    }
    if let Some(merge) = attempt.merge_status {
        println!("  Applied:      {}", merge.as_str());
    }

    if !artifacts.is_empty() {
        println!();
        println!("  Artifacts:");
        for artifact in artifacts {
            println!(
                "    {:<8}  {} bytes  sha256:{}",
                artifact.kind.as_str(),
                artifact.content.len(),
                short_sha(&artifact.checksum),
            );
        }
    }
}

pub fn print_stop_report(report: &StopReport) {
    if !report.stopped {
        println!("Run was not running; nothing stopped.");
        return;
    }
    println!(
        "Run stopped: {} attempt(s) cancelled, {} failed to cancel",
        report.cancelled_count, report.failed_to_cancel_count
    );
}

pub fn print_attempt_stop(stop: &AttemptStop) {
    println!("Attempt status: {}", stop.status.as_str());
    if !stop.signalled {
        println!("  warning: the agent did not confirm termination");
    }
}

pub fn print_gc_report(report: &GcReport) {
    println!(
        "Scanned {} workspace(s): {} removed, {} failed",
        report.scanned, report.removed, report.failed
    );
}

pub fn print_pr_sync(sync: &PrSync) {
    let note = if sync.changed { "updated" } else { "unchanged" };
    println!("Pull request {} ({note})", sync.status.as_str());
}

pub fn print_apply_report(report: &ApplyReport) {
    println!("Apply: {}", report.merge_status.as_str());
    for file in &report.conflict_files {
        println!("  conflict: {file}");
    }
    if let Some(error) = &report.apply_error {
        println!("  error: {error}");
    }
}

fn format_counts(counts: &RunCounts) -> String {
    format!(
        "{} pending, {} queued, {} running, {} completed, {} failed, {} stopped",
        counts.pending,
        counts.queued,
        counts.running,
        counts.completed,
        counts.failed,
        counts.stopped
    )
}

fn format_time(dt: &chrono::DateTime<chrono::Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn short_sha(sha: &str) -> &str {
    sha.get(..12).unwrap_or(sha)
}
