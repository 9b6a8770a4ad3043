//! On-disk execution records.
//!
//! Layout under `<data_dir>/exec/<exec_id>/`:
//!
//! ```text
//! meta.json     indented JSON of the execution record
//! stdout.log    append-only
//! stderr.log    append-only
//! pid           decimal ASCII
//! exit_code     decimal ASCII
//! workdir/      present during the run for project executions
//! ```
//!
//! `meta.json` is rewritten whole on each transition; a crash leaves the
//! last durable version. Log files are opened append-only and never
//! truncated.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use rex_common::protocol::ExecRecord;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid record: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid pid file")]
    InvalidPid,
}

pub struct ExecStore {
    data_dir: PathBuf,
    // Single holder for retention sweeps; concurrent starts must not prune
    // the same directories twice.
    gc_lock: Mutex<()>,
}

impl ExecStore {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            gc_lock: Mutex::new(()),
        }
    }

    pub fn exec_root(&self) -> PathBuf {
        self.data_dir.join("exec")
    }

    pub fn exec_dir(&self, exec_id: &str) -> PathBuf {
        self.exec_root().join(exec_id)
    }

    pub fn create_exec_dir(&self, exec_id: &str) -> std::io::Result<PathBuf> {
        let dir = self.exec_dir(exec_id);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn write_meta(&self, exec_dir: &Path, record: &ExecRecord) -> Result<(), StoreError> {
        let body = serde_json::to_vec_pretty(record)?;
        std::fs::write(exec_dir.join("meta.json"), body)?;
        Ok(())
    }

    pub fn read_meta(&self, exec_dir: &Path) -> Result<ExecRecord, StoreError> {
        let body = std::fs::read(exec_dir.join("meta.json"))?;
        Ok(serde_json::from_slice(&body)?)
    }

    pub fn write_pid(&self, exec_dir: &Path, pid: u32) -> Result<(), StoreError> {
        std::fs::write(exec_dir.join("pid"), pid.to_string())?;
        Ok(())
    }

    pub fn read_pid(&self, exec_dir: &Path) -> Result<u32, StoreError> {
        let body = std::fs::read_to_string(exec_dir.join("pid"))?;
        body.trim().parse().map_err(|_| StoreError::InvalidPid)
    }

    pub fn write_exit_code(&self, exec_dir: &Path, code: i32) -> Result<(), StoreError> {
        std::fs::write(exec_dir.join("exit_code"), code.to_string())?;
        Ok(())
    }

    /// Open a log file for appending, creating it if needed.
    pub fn open_log(&self, exec_dir: &Path, name: &str) -> std::io::Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(exec_dir.join(name))
    }

    /// Remove the oldest exec directories until at most `keep` remain.
    /// `keep <= 0` disables the sweep. Returns how many were removed.
    pub fn enforce_retention(&self, keep: i64) -> std::io::Result<usize> {
        if keep <= 0 {
            return Ok(0);
        }
        let _guard = self.gc_lock.lock().expect("retention lock poisoned");

        let root = self.exec_root();
        std::fs::create_dir_all(&root)?;
        let mut entries: Vec<(PathBuf, SystemTime)> = Vec::new();
        for entry in std::fs::read_dir(&root)? {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_dir() {
                continue;
            }
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            entries.push((entry.path(), modified));
        }
        let keep = keep as usize;
        if entries.len() <= keep {
            return Ok(0);
        }
        entries.sort_by_key(|(_, modified)| *modified);
        let excess = entries.len() - keep;
        let mut removed = 0;
        for (path, _) in entries.into_iter().take(excess) {
            match std::fs::remove_dir_all(&path) {
                Ok(()) => removed += 1,
                Err(err) => debug!(path = %path.display(), %err, "retention removal failed"),
            }
        }
        Ok(removed)
    }
}
