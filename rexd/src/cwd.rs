//! Effective working-directory resolution for executions.
//!
//! Project executions are confined to their checked-out worktree; free-form
//! executions may only enter allow-listed roots, the daemon user's home, or
//! the data directory.

use std::path::{Path, PathBuf};

use rex_common::pathutil::is_within;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CwdError {
    #[error("cwd must be within project workdir")]
    OutsideWorkdir,

    #[error("cwd not allowed")]
    NotAllowed,
}

/// Daemon-level context for absolute-path checks.
pub struct CwdRules<'a> {
    pub allowed_roots: &'a [PathBuf],
    pub home: &'a Path,
    pub data_dir: &'a Path,
}

pub fn resolve_cwd(
    rules: &CwdRules<'_>,
    workdir: &Path,
    has_project: bool,
    cwd: Option<&str>,
) -> Result<PathBuf, CwdError> {
    let Some(cwd) = cwd.filter(|c| !c.is_empty()) else {
        return Ok(workdir.to_path_buf());
    };
    let requested = Path::new(cwd);

    if requested.is_absolute() {
        if has_project {
            if !is_within(workdir, requested) {
                return Err(CwdError::OutsideWorkdir);
            }
            return Ok(requested.to_path_buf());
        }
        let allowed = rules
            .allowed_roots
            .iter()
            .map(PathBuf::as_path)
            .chain([rules.home, rules.data_dir])
            .any(|root| is_within(root, requested));
        if !allowed {
            return Err(CwdError::NotAllowed);
        }
        return Ok(requested.to_path_buf());
    }

    // Relative: anchored at the worktree for project executions, at the
    // daemon user's home otherwise.
    let base = if has_project { workdir } else { rules.home };
    Ok(base.join(requested))
}
