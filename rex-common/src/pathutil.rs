//! Path helpers: user-home expansion and containment checks.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("home directory is not available")]
    HomeNotFound,

    #[error("only current user home expansion (~ or ~/...) is supported")]
    UnsupportedTilde,
}

/// Expand a leading `~` to the current user's home directory.
///
/// Only `~` and `~/...` are supported; `~other/...` is an error rather than
/// a silent literal path.
pub fn expand_user(p: &str) -> Result<PathBuf, PathError> {
    if !p.starts_with('~') {
        return Ok(PathBuf::from(p));
    }
    let home = dirs::home_dir().ok_or(PathError::HomeNotFound)?;
    if p == "~" {
        return Ok(home);
    }
    if let Some(rest) = p.strip_prefix("~/") {
        return Ok(home.join(rest));
    }
    Err(PathError::UnsupportedTilde)
}

/// Lexically normalize a path: resolve `.` and `..` components without
/// touching the filesystem.
pub fn clean(p: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in p.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                // `..` at the root stays at the root.
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Whether `p` is `root` or lexically inside it. `..` escapes do not count
/// as inside.
pub fn is_within(root: &Path, p: &Path) -> bool {
    let root = clean(root);
    let p = clean(p);
    if root == p {
        return true;
    }
    match p.strip_prefix(&root) {
        Ok(rest) => !rest
            .components()
            .any(|c| matches!(c, Component::ParentDir)),
        Err(_) => false,
    }
}
