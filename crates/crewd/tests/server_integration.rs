//! End-to-end tests of the daemon over its HTTP router.
//!
//! A real git repository, worktrees and agent process (a shell script) are
//! driven through the same wiring `crewd` uses in production.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use chrono::Utc;
use crew_core::{Id, Project, Task, TaskStatus};
use crewd::webhook::sign;
use crewd::{Daemon, DaemonConfig};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Command;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tower::ServiceExt;

const TOKEN: &str = "test-token";
const SECRET: &str = "webhook-secret";

struct TestDaemon {
    daemon: Daemon,
    app: Router,
    project: Project,
    repo: TempDir,
    handles: Vec<JoinHandle<()>>,
    _dir: TempDir,
}

impl TestDaemon {
    async fn shutdown(self) {
        self.daemon.shutdown();
        for handle in self.handles {
            handle.await.unwrap();
        }
    }
}

fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap()
        .status;
    assert!(status.success(), "git {args:?} failed");
}

fn setup_repo() -> TempDir {
    let dir = TempDir::new().unwrap();
    git(dir.path(), &["init"]);
    git(dir.path(), &["symbolic-ref", "HEAD", "refs/heads/main"]);
    git(dir.path(), &["config", "user.email", "test@test.com"]);
    git(dir.path(), &["config", "user.name", "Test"]);
    std::fs::write(dir.path().join("README.md"), "# Test\n").unwrap();
    git(dir.path(), &["add", "."]);
    git(dir.path(), &["commit", "-m", "Initial commit"]);
    dir
}

/// Start a daemon whose agent runs `script` inside the attempt workspace.
async fn start_daemon(script: &str) -> TestDaemon {
    let dir = TempDir::new().unwrap();
    let agent = dir.path().join("agent.sh");
    std::fs::write(&agent, format!("#!/bin/sh\n{script}\n")).unwrap();
    std::fs::set_permissions(&agent, std::fs::Permissions::from_mode(0o755)).unwrap();

    let config_path = dir.path().join("config");
    std::fs::write(
        &config_path,
        format!(
            "agent_command={}\nworktree_root={}\nagent_stop_timeout_sec=5\ngc_interval_sec=3600\n",
            agent.display(),
            dir.path().join("worktrees").display()
        ),
    )
    .unwrap();

    let daemon = Daemon::new(DaemonConfig {
        db_path: dir.path().join("crewd.db"),
        port: 0,
        auth_token: Some(TOKEN.to_string()),
        webhook_secret: Some(SECRET.to_string()),
        github_token: None,
        config_path: Some(config_path),
    })
    .await
    .unwrap();

    let repo = setup_repo();
    let project = Project {
        id: Id::new(),
        name: "demo".to_string(),
        repo_path: repo.path().to_string_lossy().to_string(),
        repo_url: Some("https://github.com/acme/demo.git".to_string()),
        default_branch: "main".to_string(),
        created_at: Utc::now(),
    };
    daemon.storage().insert_project(&project).await.unwrap();

    let handles = daemon.start_background().await.unwrap();
    let app = daemon.router();
    TestDaemon {
        daemon,
        app,
        project,
        repo,
        handles,
        _dir: dir,
    }
}

async fn add_task(td: &TestDaemon, title: &str) -> Task {
    let now = Utc::now();
    let task = Task {
        id: Id::new(),
        project_id: td.project.id.clone(),
        title: title.to_string(),
        description: Some("details".to_string()),
        status: TaskStatus::Todo,
        created_at: now,
        updated_at: now,
    };
    td.daemon.storage().insert_task(&task).await.unwrap();
    task
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {TOKEN}"));
    let body = match body {
        Some(json) => {
            builder = builder.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let response: Response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

async fn send_webhook(app: &Router, delivery: &str, body: &Value) -> (StatusCode, Value) {
    let raw = body.to_string();
    let response: Response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhooks/github")
                .header("x-github-event", "pull_request")
                .header("x-github-delivery", delivery)
                .header("x-hub-signature-256", sign(SECRET.as_bytes(), raw.as_bytes()))
                .header("content-type", "application/json")
                .body(Body::from(raw))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

/// Poll GET /runs/{id} until `check` holds for the run detail.
async fn wait_for_run(app: &Router, run_id: &str, check: impl Fn(&Value) -> bool) -> Value {
    for _ in 0..300 {
        let (status, detail) = call(app, "GET", &format!("/runs/{run_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        if check(&detail) {
            return detail;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("run {run_id} did not reach the expected state");
}

#[tokio::test]
async fn requests_without_token_are_rejected() {
    let td = start_daemon("exit 0").await;
    let response: Response = td
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/projects/{}/run", td.project.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    td.shutdown().await;
}

#[tokio::test]
async fn attempt_flows_from_run_to_merged_pr_and_apply() {
    let td = start_daemon("printf 'changed\\n' > change.txt").await;
    let task = add_task(&td, "add change file").await;

    let (status, started) = call(
        &td.app,
        "POST",
        &format!("/projects/{}/runs", td.project.id),
        Some(json!({ "task_ids": [task.id], "max_parallel": 2 })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let run_id = started["run_id"].as_str().unwrap().to_string();

    let detail = wait_for_run(&td.app, &run_id, |d| d["run"]["status"] == "completed").await;
    let attempt = &detail["attempts"][0];
    assert_eq!(attempt["status"], "completed");
    let attempt_id = attempt["id"].as_str().unwrap().to_string();

    let (_, view) = call(&td.app, "GET", &format!("/attempts/{attempt_id}"), None).await;
    let diff = view["artifacts"]
        .as_array()
        .unwrap()
        .iter()
        .find(|a| a["kind"] == "diff")
        .unwrap();
    assert!(diff["content"].as_str().unwrap().contains("change.txt"));
    let task_now = td.daemon.storage().get_task(&task.id).await.unwrap();
    assert_eq!(task_now.status, TaskStatus::InReview);

    // A PR opened for the attempt is later merged upstream.
    let (status, _) = call(
        &td.app,
        "POST",
        &format!("/attempts/{attempt_id}/pr"),
        Some(json!({ "number": 7, "url": "https://github.com/acme/demo/pull/7" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let merged = json!({
        "action": "closed",
        "number": 7,
        "pull_request": { "number": 7, "merged": true },
        "repository": { "html_url": "https://github.com/acme/demo" }
    });
    let (status, ack) = send_webhook(&td.app, "delivery-1", &merged).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["updated"], "merged");
    assert_eq!(ack["attempt_id"], attempt_id.as_str());

    let (status, ack) = send_webhook(&td.app, "delivery-1", &merged).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["duplicate"], true);

    let (status, report) = call(&td.app, "POST", &format!("/attempts/{attempt_id}/apply"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["merge_status"], "applied");
    assert!(td.repo.path().join("change.txt").exists());

    // Completed workspaces are kept until collected.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let (status, gc) = call(&td.app, "POST", "/gc", Some(json!({ "min_age_minutes": 0 }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(gc["removed"], 1);
    let (_, view) = call(&td.app, "GET", &format!("/attempts/{attempt_id}"), None).await;
    assert_eq!(view["attempt"]["cleanup_status"], "cleaned");

    td.shutdown().await;
}

#[tokio::test]
async fn empty_change_fails_the_attempt_and_the_run() {
    let td = start_daemon("echo nothing to do").await;
    add_task(&td, "noop").await;

    let (status, started) = call(
        &td.app,
        "POST",
        &format!("/projects/{}/runs", td.project.id),
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let run_id = started["run_id"].as_str().unwrap().to_string();

    let detail = wait_for_run(&td.app, &run_id, |d| d["run"]["status"] == "failed").await;
    assert_eq!(detail["attempts"][0]["status"], "failed");
    assert_eq!(detail["attempts"][0]["error_code"], "EMPTY_DIFF");

    td.shutdown().await;
}

#[tokio::test]
async fn stopping_a_run_kills_the_agent() {
    let td = start_daemon("sleep 30").await;
    add_task(&td, "slow").await;

    let (_, started) = call(
        &td.app,
        "POST",
        &format!("/projects/{}/runs", td.project.id),
        Some(json!({})),
    )
    .await;
    let run_id = started["run_id"].as_str().unwrap().to_string();
    wait_for_run(&td.app, &run_id, |d| d["attempts"][0]["status"] == "running").await;

    // Let the agent process spawn after the running transition.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let (status, report) = call(
        &td.app,
        "POST",
        &format!("/runs/{run_id}/stop"),
        Some(json!({ "reason": "operator" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["stopped"], true);
    assert_eq!(report["cancelled_count"], 1);

    let detail = wait_for_run(&td.app, &run_id, |d| d["run"]["status"] == "cancelled").await;
    assert_eq!(detail["attempts"][0]["status"], "stopped");

    // A second stop is a no-op.
    let (status, report) = call(&td.app, "POST", &format!("/runs/{run_id}/stop"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["stopped"], false);

    td.shutdown().await;
}
