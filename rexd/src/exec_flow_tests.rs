//! End-to-end flows over the in-process router: real children, real files.

use std::path::Path;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use tower::ServiceExt;

use crate::config::{Config, Project};
use crate::service::{router, Service};

fn service_with(cfg: Config) -> Router {
    router(Service::new(cfg))
}

async fn post_json(router: &Router, uri: &str, body: &str) -> (StatusCode, serde_json::Value) {
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

async fn get_raw(router: &Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = router
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, bytes.to_vec())
}

async fn get_json(router: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let (status, bytes) = get_raw(router, uri).await;
    (status, serde_json::from_slice(&bytes).unwrap())
}

async fn start_exec(router: &Router, body: &str) -> String {
    let (status, json) = post_json(router, "/v1/exec", body).await;
    assert_eq!(status, StatusCode::OK, "start failed: {json}");
    assert_eq!(json["status"], "running");
    json["exec_id"].as_str().unwrap().to_string()
}

async fn wait_finished(router: &Router, exec_id: &str, timeout: Duration) -> serde_json::Value {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let (status, json) = get_json(router, &format!("/v1/exec/{exec_id}")).await;
        assert_eq!(status, StatusCode::OK);
        if json["status"] == "finished" {
            return json;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "exec {exec_id} did not finish in time: {json}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn wait_pid(router: &Router, exec_id: &str) -> u32 {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let (_, json) = get_json(router, &format!("/v1/exec/{exec_id}")).await;
        if let Some(pid) = json["pid"].as_u64() {
            return pid as u32;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "exec {exec_id} never spawned: {json}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn test_echo_roundtrip_with_jsonl_logs() {
    let dir = tempfile::tempdir().unwrap();
    let router = service_with(Config {
        data_dir: dir.path().to_path_buf(),
        ..Config::default()
    });

    let exec_id = start_exec(&router, r#"{"cmd":"echo hello"}"#).await;
    let meta = wait_finished(&router, &exec_id, Duration::from_secs(10)).await;
    assert_eq!(meta["exit_code"], 0);
    assert!(meta["pid"].as_u64().is_some());
    assert!(meta["finished_at"].as_str().is_some());

    let (status, body) = get_raw(
        &router,
        &format!("/v1/exec/{exec_id}/logs?format=jsonl&tail=2000&stream=stdout"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let events: Vec<serde_json::Value> = String::from_utf8(body)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert!(
        events.iter().any(|e| e["type"] == "log"
            && e["stream"] == "stdout"
            && e["line"] == "hello"),
        "expected a hello log event, got: {events:?}"
    );

    // Raw text fetch of the same window.
    let (status, body) = get_raw(&router, &format!("/v1/exec/{exec_id}/logs")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(String::from_utf8_lossy(&body).contains("hello"));
}

#[tokio::test]
async fn test_cancel_terminates_long_sleep() {
    let dir = tempfile::tempdir().unwrap();
    let router = service_with(Config {
        data_dir: dir.path().to_path_buf(),
        ..Config::default()
    });

    let exec_id = start_exec(&router, r#"{"cmd":"sleep 30"}"#).await;
    wait_pid(&router, &exec_id).await;

    let started = std::time::Instant::now();
    let (status, json) = post_json(&router, &format!("/v1/exec/{exec_id}/cancel"), "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["canceled"], true);

    let meta = wait_finished(&router, &exec_id, Duration::from_secs(5)).await;
    assert!(started.elapsed() < Duration::from_secs(5));
    let code = meta["exit_code"].as_i64().unwrap();
    assert_ne!(code, 0, "canceled exec should not report success");

    // Cancel after the fact stays idempotent.
    let (status, json) = post_json(&router, &format!("/v1/exec/{exec_id}/cancel"), "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["canceled"], true);
}

#[tokio::test]
async fn test_cancel_unknown_exec_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let router = service_with(Config {
        data_dir: dir.path().to_path_buf(),
        ..Config::default()
    });
    let (status, json) = post_json(&router, "/v1/exec/nope/cancel", "").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"], "exec_id not found");
}

#[tokio::test]
async fn test_retention_caps_exec_directories() {
    let dir = tempfile::tempdir().unwrap();
    let router = service_with(Config {
        data_dir: dir.path().to_path_buf(),
        retention_count: 2,
        ..Config::default()
    });

    for i in 0..3 {
        let exec_id = start_exec(&router, &format!(r#"{{"cmd":"echo {i}"}}"#)).await;
        wait_finished(&router, &exec_id, Duration::from_secs(10)).await;
        // Keep mtimes distinguishable across directories.
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let exec_root = dir.path().join("exec");
    let count = std::fs::read_dir(&exec_root).unwrap().count();
    assert!(count <= 2, "expected at most 2 exec dirs, found {count}");
}

#[tokio::test]
async fn test_failed_command_records_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let router = service_with(Config {
        data_dir: dir.path().to_path_buf(),
        ..Config::default()
    });

    let exec_id = start_exec(&router, r#"{"cmd":"exit 3"}"#).await;
    let meta = wait_finished(&router, &exec_id, Duration::from_secs(10)).await;
    assert_eq!(meta["exit_code"], 3);
    // A non-zero exit is the command's own outcome, not a daemon diagnostic.
    assert!(meta.get("error").is_none(), "meta: {meta}");

    let exec_dir = dir.path().join("exec").join(&exec_id);
    assert_eq!(
        std::fs::read_to_string(exec_dir.join("exit_code")).unwrap(),
        "3"
    );
}

#[tokio::test]
async fn test_rejected_absolute_cwd_finishes_with_126() {
    let dir = tempfile::tempdir().unwrap();
    let router = service_with(Config {
        data_dir: dir.path().to_path_buf(),
        ..Config::default()
    });

    let exec_id = start_exec(&router, r#"{"cmd":"true","cwd":"/definitely/not/allowed"}"#).await;
    let meta = wait_finished(&router, &exec_id, Duration::from_secs(10)).await;
    assert_eq!(meta["exit_code"], 126);
    assert_eq!(meta["error"], "cwd not allowed");
    assert!(meta["pid"].as_u64().is_none());
}

#[tokio::test]
async fn test_unknown_project_finishes_with_127() {
    let dir = tempfile::tempdir().unwrap();
    let router = service_with(Config {
        data_dir: dir.path().to_path_buf(),
        ..Config::default()
    });

    let exec_id = start_exec(&router, r#"{"cmd":"true","project_id":"ghost","ref":"HEAD"}"#).await;
    let meta = wait_finished(&router, &exec_id, Duration::from_secs(10)).await;
    assert_eq!(meta["exit_code"], 127);
    assert_eq!(meta["error"], "unknown project_id: ghost");
}

fn git_available() -> bool {
    std::process::Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn git(dir: &Path, args: &[&str]) {
    let out = std::process::Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .output()
        .unwrap();
    assert!(
        out.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
}

#[tokio::test]
async fn test_project_exec_runs_in_worktree_subdir() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source");
    std::fs::create_dir_all(source.join("sub")).unwrap();
    std::fs::write(source.join("sub/note.txt"), "note\n").unwrap();
    git(&source, &["init", "-q"]);
    git(&source, &["config", "user.email", "test@example.com"]);
    git(&source, &["config", "user.name", "test"]);
    git(&source, &["add", "-A"]);
    git(&source, &["commit", "-q", "-m", "init"]);

    let data_dir = dir.path().join("data");
    let router = service_with(Config {
        data_dir: data_dir.clone(),
        projects: vec![Project {
            id: "p1".to_string(),
            repo_url: source.to_string_lossy().into_owned(),
            mirror_dir: None,
        }],
        ..Config::default()
    });

    let exec_id = start_exec(
        &router,
        r#"{"project_id":"p1","ref":"HEAD","cwd":"sub","cmd":"pwd && echo $FOO","env":{"FOO":"bar"}}"#,
    )
    .await;
    let meta = wait_finished(&router, &exec_id, Duration::from_secs(30)).await;
    assert_eq!(meta["exit_code"], 0, "meta: {meta}");

    let stdout =
        std::fs::read_to_string(data_dir.join("exec").join(&exec_id).join("stdout.log")).unwrap();
    assert!(stdout.contains("bar"), "stdout: {stdout}");
    assert!(
        stdout.lines().any(|l| l.ends_with("/workdir/sub")),
        "stdout: {stdout}"
    );

    // The mirror is shared state that persists past the execution.
    assert!(data_dir.join("mirrors/p1.git").is_dir());
}
