//! Per-execution working directories.
//!
//! Project executions check out an immutable commit into
//! `<exec_dir>/workdir` via a shared bare mirror that is cloned once and
//! refreshed with `fetch --prune`. Executions without a project context run
//! from the daemon user's home directory and need no cleanup.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;

#[derive(Debug, Error)]
pub enum WorkdirError {
    #[error("ref is required when project_id is set")]
    MissingRef,

    #[error("unknown project_id: {0}")]
    UnknownProject(String),

    #[error("home directory is not available")]
    NoHome,

    #[error("{0}")]
    Git(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Where an execution runs, and what to tear down afterwards.
#[derive(Debug)]
pub enum PreparedWorkdir {
    Home(PathBuf),
    Worktree { path: PathBuf, mirror_dir: PathBuf },
}

impl PreparedWorkdir {
    pub fn path(&self) -> &Path {
        match self {
            Self::Home(p) => p,
            Self::Worktree { path, .. } => path,
        }
    }
}

pub async fn prepare_workdir(
    cfg: &Config,
    exec_dir: &Path,
    project_id: Option<&str>,
    git_ref: Option<&str>,
) -> Result<PreparedWorkdir, WorkdirError> {
    let Some(project_id) = project_id.filter(|p| !p.is_empty()) else {
        let home = dirs::home_dir().ok_or(WorkdirError::NoHome)?;
        return Ok(PreparedWorkdir::Home(home));
    };
    let git_ref = git_ref
        .filter(|r| !r.is_empty())
        .ok_or(WorkdirError::MissingRef)?;
    let project = cfg
        .find_project(project_id)
        .ok_or_else(|| WorkdirError::UnknownProject(project_id.to_string()))?;

    let mirror_dir = cfg.mirror_dir_for(project);
    if let Some(parent) = mirror_dir.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if mirror_dir.exists() {
        run_git(Some(&mirror_dir), &["fetch", "--prune"])
            .await
            .map_err(|e| WorkdirError::Git(format!("git fetch failed: {e}")))?;
    } else {
        run_git(
            None,
            &[
                "clone",
                "--mirror",
                &project.repo_url,
                &mirror_dir.to_string_lossy(),
            ],
        )
        .await
        .map_err(|e| WorkdirError::Git(format!("git clone --mirror failed: {e}")))?;
    }

    let commit = rev_parse(&mirror_dir, git_ref).await?;
    debug!(project = project_id, %commit, "resolved ref");

    let workdir = exec_dir.join("workdir");
    run_git(
        Some(&mirror_dir),
        &[
            "worktree",
            "add",
            "--force",
            &workdir.to_string_lossy(),
            &commit,
        ],
    )
    .await
    .map_err(|e| WorkdirError::Git(format!("git worktree add failed: {e}")))?;

    Ok(PreparedWorkdir::Worktree {
        path: workdir,
        mirror_dir,
    })
}

/// Detach a worktree from its mirror. Runs on every exit path of an
/// execution; failures are logged, not propagated, because the exec
/// directory itself may already be gone to retention.
pub async fn remove_worktree(mirror_dir: &Path, workdir: &Path) {
    if let Err(err) = run_git(
        Some(mirror_dir),
        &["worktree", "remove", "--force", &workdir.to_string_lossy()],
    )
    .await
    {
        warn!(workdir = %workdir.display(), %err, "worktree removal failed");
    }
}

/// Resolve a ref to an immutable commit id via the mirror.
async fn rev_parse(mirror_dir: &Path, git_ref: &str) -> Result<String, WorkdirError> {
    let out = run_git(Some(mirror_dir), &["rev-parse", &format!("{git_ref}^{{commit}}")])
        .await
        .map_err(|e| WorkdirError::Git(format!("git rev-parse failed: {e}")))?;
    Ok(out.trim().to_string())
}

async fn run_git(dir: Option<&Path>, args: &[&str]) -> Result<String, String> {
    let mut cmd = tokio::process::Command::new("git");
    if let Some(dir) = dir {
        cmd.arg("-C").arg(dir);
    }
    cmd.args(args);
    let output = cmd.output().await.map_err(|e| e.to_string())?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        if stderr.is_empty() {
            return Err(format!("git exited with {}", output.status));
        }
        return Err(stderr.to_string());
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Project;

    fn config_with_project(data_dir: &Path, id: &str, repo_url: &str) -> Config {
        Config {
            data_dir: data_dir.to_path_buf(),
            projects: vec![Project {
                id: id.to_string(),
                repo_url: repo_url.to_string(),
                mirror_dir: None,
            }],
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_no_project_runs_from_home() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::default();
        let prepared = prepare_workdir(&cfg, dir.path(), None, None).await.unwrap();
        assert_eq!(prepared.path(), dirs::home_dir().unwrap());
    }

    #[tokio::test]
    async fn test_project_without_ref_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config_with_project(dir.path(), "p1", "/tmp/nowhere.git");
        let err = prepare_workdir(&cfg, dir.path(), Some("p1"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkdirError::MissingRef));
    }

    #[tokio::test]
    async fn test_unknown_project_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::default();
        let err = prepare_workdir(&cfg, dir.path(), Some("ghost"), Some("HEAD"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkdirError::UnknownProject(_)));
    }

    #[tokio::test]
    async fn test_clone_failure_carries_git_diagnostic() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist.git");
        let cfg = config_with_project(dir.path(), "p1", &missing.to_string_lossy());
        let err = prepare_workdir(&cfg, dir.path(), Some("p1"), Some("HEAD"))
            .await
            .unwrap_err();
        let WorkdirError::Git(msg) = err else {
            panic!("expected git error");
        };
        assert!(msg.starts_with("git clone --mirror failed:"), "got: {msg}");
    }
}
