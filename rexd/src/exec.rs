//! The execution engine: one detached background task per accepted request.
//!
//! The worker owns the child process, its log file handles, and the
//! worktree cleanup for the lifetime of the execution. It never holds the
//! accepting request's context: executions outlive the HTTP call that
//! started them.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use rex_common::protocol::{
    ExecRecord, ExecStartRequest, ExecStatus, EXIT_CWD_REJECTED, EXIT_SPAWN_FAILED,
};
use rex_common::timeutil::now_rfc3339;
use tracing::{info, warn};

use crate::cwd::{resolve_cwd, CwdRules};
use crate::process;
use crate::service::Service;
use crate::workdir::{self, PreparedWorkdir};

pub fn spawn_worker(svc: Service, exec_dir: PathBuf, req: ExecStartRequest, record: ExecRecord) {
    tokio::spawn(run_exec(svc, exec_dir, req, record));
}

async fn run_exec(svc: Service, exec_dir: PathBuf, req: ExecStartRequest, mut record: ExecRecord) {
    let prepared = match workdir::prepare_workdir(
        svc.config(),
        &exec_dir,
        req.project_id.as_deref(),
        req.git_ref.as_deref(),
    )
    .await
    {
        Ok(prepared) => prepared,
        Err(err) => {
            finish(&svc, &exec_dir, &mut record, EXIT_SPAWN_FAILED, Some(err.to_string()));
            return;
        }
    };

    run_in_workdir(&svc, &exec_dir, &req, &mut record, prepared.path()).await;

    if let PreparedWorkdir::Worktree { path, mirror_dir } = prepared {
        workdir::remove_worktree(&mirror_dir, &path).await;
    }
}

async fn run_in_workdir(
    svc: &Service,
    exec_dir: &Path,
    req: &ExecStartRequest,
    record: &mut ExecRecord,
    workdir: &Path,
) {
    let has_project = req.project_id.as_deref().is_some_and(|p| !p.is_empty());
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"));
    let rules = CwdRules {
        allowed_roots: &svc.config().allowed_cwd_roots,
        home: &home,
        data_dir: &svc.config().data_dir,
    };
    let cwd = match resolve_cwd(&rules, workdir, has_project, req.cwd.as_deref()) {
        Ok(cwd) => cwd,
        Err(err) => {
            finish(svc, exec_dir, record, EXIT_CWD_REJECTED, Some(err.to_string()));
            return;
        }
    };

    let stdout = match svc.store().open_log(exec_dir, "stdout.log") {
        Ok(f) => f,
        Err(err) => {
            finish(svc, exec_dir, record, EXIT_SPAWN_FAILED, Some(err.to_string()));
            return;
        }
    };
    let stderr = match svc.store().open_log(exec_dir, "stderr.log") {
        Ok(f) => f,
        Err(err) => {
            finish(svc, exec_dir, record, EXIT_SPAWN_FAILED, Some(err.to_string()));
            return;
        }
    };

    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-lc")
        .arg(&record.cmd)
        .current_dir(&cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .envs(&req.env);
    process::set_process_group(&mut cmd);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            finish(svc, exec_dir, record, EXIT_SPAWN_FAILED, Some(err.to_string()));
            return;
        }
    };

    if let Some(pid) = child.id() {
        record.pid = Some(pid);
        if let Err(err) = svc.store().write_pid(exec_dir, pid) {
            warn!(exec_id = %record.exec_id, %err, "failed to write pid file");
        }
        if let Err(err) = svc.store().write_meta(exec_dir, record) {
            warn!(exec_id = %record.exec_id, %err, "failed to update meta");
        }
    }

    let (exit_code, error) = match child.wait().await {
        Ok(status) => (exit_code_of(&status), error_of(&status)),
        Err(err) => (1, Some(format!("wait failed: {err}"))),
    };
    finish(svc, exec_dir, record, exit_code, error);
}

fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            // Shell convention for signal deaths.
            return 128 + sig;
        }
    }
    1
}

/// A normal exit, zero or not, is the command's own outcome: no diagnostic.
/// Only deaths without an exit status (signals) populate `error`.
fn error_of(status: &std::process::ExitStatus) -> Option<String> {
    if status.code().is_some() {
        return None;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return Some(format!("terminated by signal {sig}"));
        }
    }
    Some("child terminated without an exit status".to_string())
}

/// Write the terminal record: meta, then the exit-code file. After this the
/// record is immutable.
fn finish(
    svc: &Service,
    exec_dir: &Path,
    record: &mut ExecRecord,
    exit_code: i32,
    error: Option<String>,
) {
    record.status = ExecStatus::Finished;
    record.finished_at = Some(now_rfc3339());
    record.exit_code = Some(exit_code);
    record.error = error;
    if let Err(err) = svc.store().write_meta(exec_dir, record) {
        warn!(exec_id = %record.exec_id, %err, "failed to finalize meta");
    }
    if let Err(err) = svc.store().write_exit_code(exec_dir, exit_code) {
        warn!(exec_id = %record.exec_id, %err, "failed to write exit_code");
    }
    info!(exec_id = %record.exec_id, exit_code, "execution finished");
}
