//! Wire protocol shared by the rexd daemon and the rex CLI.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Exit code recorded when workdir preparation or the spawn itself failed.
pub const EXIT_SPAWN_FAILED: i32 = 127;

/// Exit code recorded when the requested working directory was rejected.
pub const EXIT_CWD_REJECTED: i32 = 126;

/// Lifecycle state of an execution as observable by clients.
///
/// There is no intermediate state: a record is `running` from the moment the
/// start request is accepted until the terminal metadata is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecStatus {
    Running,
    Finished,
}

impl ExecStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Finished)
    }
}

impl std::fmt::Display for ExecStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Finished => write!(f, "finished"),
        }
    }
}

/// Body of `POST /v1/exec`.
///
/// Unknown fields are rejected so that typos in automation fail loudly
/// instead of silently running with defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecStartRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    /// Git ref to check out; required whenever `project_id` is set.
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,
    /// Shell command, executed as `sh -lc <cmd>`.
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Merged over the daemon's inherited environment; request values win.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

/// Body returned by `POST /v1/exec`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecStartResponse {
    pub exec_id: String,
    pub status: ExecStatus,
}

/// One execution record, persisted as `meta.json` and served by
/// `GET /v1/exec/{id}`.
///
/// Once `status` is `finished` the record is immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRecord {
    pub exec_id: String,
    pub status: ExecStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Leader of the command's process group; present iff the spawn succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    /// Present iff `status` is `finished`. `127` for workdir or spawn
    /// failure, `126` for a rejected working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Diagnostic set when the exit was not the command's own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Body returned by `POST /v1/exec/{id}/cancel`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub canceled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// NDJSON events emitted by log endpoints and the watcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WatchEvent {
    Log {
        stream: String,
        line: String,
    },
    Summary {
        exec_id: String,
        status: ExecStatus,
        exit_code: i32,
        duration_ms: u64,
        stdout_log_path: String,
        stderr_log_path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        artifacts: Option<serde_json::Value>,
    },
}
