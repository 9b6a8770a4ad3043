//! The HTTP API.
//!
//! Five endpoints: `/health`, start, get, logs, and cancel. Everything
//! under `/v1` sits behind the bearer-token middleware when `auth_token` is
//! configured. Validation, auth, and not-found surface synchronously;
//! execution failures only ever show up as terminal record fields.

use std::path::Path;
use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path as UrlPath, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use rex_common::mask::mask_sensitive_command;
use rex_common::protocol::{
    CancelResponse, ExecRecord, ExecStartRequest, ExecStartResponse, ExecStatus, WatchEvent,
};
use rex_common::tail;
use rex_common::timeutil::now_rfc3339;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::exec;
use crate::process;
use crate::store::ExecStore;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
const RUNTIME: &str = concat!("rust-", env!("CARGO_PKG_RUST_VERSION"));

const DEFAULT_TAIL_BYTES: i64 = 2000;

/// Shared daemon state handed to every handler.
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    cfg: Config,
    store: ExecStore,
}

impl Service {
    pub fn new(cfg: Config) -> Self {
        let store = ExecStore::new(cfg.data_dir.clone());
        Self {
            inner: Arc::new(ServiceInner { cfg, store }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.cfg
    }

    pub fn store(&self) -> &ExecStore {
        &self.inner.store
    }
}

pub fn router(svc: Service) -> Router {
    let api = Router::new()
        .route("/v1/exec", post(exec_start))
        .route("/v1/exec/{id}", get(exec_get))
        .route("/v1/exec/{id}/logs", get(exec_logs))
        .route("/v1/exec/{id}/cancel", post(exec_cancel))
        .route_layer(middleware::from_fn_with_state(svc.clone(), require_bearer));
    Router::new()
        .route("/health", get(health))
        .merge(api)
        .with_state(svc)
}

/// JSON error body with a conventional status code.
struct ApiError {
    status: StatusCode,
    message: &'static str,
}

impl ApiError {
    fn bad_request(message: &'static str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message,
        }
    }

    fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: "unauthorized",
        }
    }

    fn not_found(message: &'static str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message,
        }
    }

    fn internal(message: &'static str) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

async fn require_bearer(State(svc): State<Service>, req: Request, next: Next) -> Response {
    if let Some(token) = &svc.config().auth_token {
        let want = format!("Bearer {token}");
        let got = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if got != Some(want.as_str()) {
            return ApiError::unauthorized().into_response();
        }
    }
    next.run(req).await
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "ok": true,
        "version": VERSION,
        "time": now_rfc3339(),
        "runtime": RUNTIME,
    }))
}

async fn exec_start(
    State(svc): State<Service>,
    payload: Result<Json<ExecStartRequest>, JsonRejection>,
) -> Result<Json<ExecStartResponse>, ApiError> {
    let Json(mut req) = payload.map_err(|_| ApiError::bad_request("invalid json body"))?;
    req.cmd = req.cmd.trim().to_string();
    if req.cmd.is_empty() {
        return Err(ApiError::bad_request("cmd is required"));
    }

    let exec_id = Uuid::new_v4().simple().to_string();
    let exec_dir = svc
        .store()
        .create_exec_dir(&exec_id)
        .map_err(|_| ApiError::internal("failed to create exec dir"))?;

    let record = ExecRecord {
        exec_id: exec_id.clone(),
        status: ExecStatus::Running,
        project_id: req.project_id.clone().filter(|s| !s.is_empty()),
        git_ref: req.git_ref.clone().filter(|s| !s.is_empty()),
        cmd: req.cmd.clone(),
        cwd: req.cwd.clone().filter(|s| !s.is_empty()),
        env: req.env.clone(),
        pid: None,
        started_at: Some(now_rfc3339()),
        finished_at: None,
        exit_code: None,
        error: None,
    };
    svc.store()
        .write_meta(&exec_dir, &record)
        .map_err(|_| ApiError::internal("failed to write meta"))?;

    // Retention runs before the worker is dispatched so behavior under load
    // stays predictable.
    match svc.store().enforce_retention(svc.config().retention_count) {
        Ok(removed) if removed > 0 => debug!(removed, "retention pruned exec directories"),
        Err(err) => warn!(%err, "retention sweep failed"),
        _ => {}
    }

    info!(
        exec_id = %exec_id,
        cmd = %mask_sensitive_command(&req.cmd),
        project = req.project_id.as_deref().unwrap_or(""),
        "execution accepted"
    );
    exec::spawn_worker(svc.clone(), exec_dir, req, record);

    Ok(Json(ExecStartResponse {
        exec_id,
        status: ExecStatus::Running,
    }))
}

async fn exec_get(
    State(svc): State<Service>,
    UrlPath(id): UrlPath<String>,
) -> Result<Json<ExecRecord>, ApiError> {
    let exec_dir = svc.store().exec_dir(&id);
    let record = svc
        .store()
        .read_meta(&exec_dir)
        .map_err(|_| ApiError::not_found("exec_id not found"))?;
    Ok(Json(record))
}

#[derive(Debug, Default, Deserialize)]
struct LogsQuery {
    stream: Option<String>,
    tail: Option<i64>,
    tail_lines: Option<usize>,
    // Accepted for interface stability; log lines carry no timestamps to
    // filter on.
    #[allow(dead_code)]
    since: Option<String>,
    #[allow(dead_code)]
    until: Option<String>,
    format: Option<String>,
}

async fn exec_logs(
    State(svc): State<Service>,
    UrlPath(id): UrlPath<String>,
    query: Result<Query<LogsQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(q) = query.map_err(|_| ApiError::bad_request("invalid query"))?;
    let exec_dir = svc.store().exec_dir(&id);
    if !exec_dir.is_dir() {
        return Err(ApiError::not_found("exec_id not found"));
    }
    let stream = q.stream.as_deref().filter(|s| !s.is_empty()).unwrap_or("stdout");
    if stream != "stdout" && stream != "stderr" {
        return Err(ApiError::bad_request("stream must be stdout or stderr"));
    }

    let path = exec_dir.join(format!("{stream}.log"));
    let body = read_log_window(&path, &q).map_err(|_| ApiError::internal("failed to read logs"))?;

    if q.format.as_deref() != Some("jsonl") {
        return Ok((
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            body,
        )
            .into_response());
    }

    let mut out = String::new();
    for line in body.split(|&b| b == b'\n') {
        if line.is_empty() {
            continue;
        }
        let event = WatchEvent::Log {
            stream: stream.to_string(),
            line: String::from_utf8_lossy(line).into_owned(),
        };
        if let Ok(encoded) = serde_json::to_string(&event) {
            out.push_str(&encoded);
            out.push('\n');
        }
    }
    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson; charset=utf-8")],
        out,
    )
        .into_response())
}

fn read_log_window(path: &Path, q: &LogsQuery) -> std::io::Result<Vec<u8>> {
    if let Some(lines) = q.tail_lines.filter(|&n| n > 0) {
        return tail::read_tail_lines(path, lines);
    }
    let max_bytes = match q.tail {
        Some(n) if n >= 0 => n,
        _ => DEFAULT_TAIL_BYTES,
    };
    tail::read_tail_bytes(path, max_bytes)
}

async fn exec_cancel(
    State(svc): State<Service>,
    UrlPath(id): UrlPath<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    let exec_dir = svc.store().exec_dir(&id);
    let pid = match svc.store().read_pid(&exec_dir) {
        Ok(pid) => pid,
        Err(_) => {
            if svc.store().read_meta(&exec_dir).is_ok() {
                return Ok(Json(CancelResponse {
                    canceled: false,
                    reason: Some("not started yet".to_string()),
                }));
            }
            return Err(ApiError::not_found("exec_id not found"));
        }
    };

    info!(exec_id = %id, pid, "cancel requested");
    process::graceful_stop(pid)
        .await
        .map_err(|_| ApiError::internal("failed to signal process"))?;
    Ok(Json(CancelResponse {
        canceled: true,
        reason: None,
    }))
}
