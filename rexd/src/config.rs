//! Daemon configuration.
//!
//! The config file is either JSON or the mini-YAML subset; the format is
//! sniffed from the first non-whitespace byte. Tilde paths are expanded at
//! load time so the rest of the daemon only sees absolute paths.

use std::path::{Path, PathBuf};

use rex_common::miniyaml::{self, Item, Scalar};
use rex_common::pathutil::{self, clean, expand_user};
use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "~/.config/rexd/config.yaml";
pub const DEFAULT_LISTEN: &str = "127.0.0.1:7337";
pub const DEFAULT_DATA_DIR: &str = "~/.rexd";
pub const DEFAULT_RETENTION_COUNT: i64 = 200;

const DEFAULT_CONFIG_TEMPLATE: &str = r#"# rexd configuration (YAML subset).
# listen: 127.0.0.1:7337
# data_dir: ~/.rexd
# auth_token: change-me
# retention_count: 200
# allowed_cwd_roots:
#   - /srv/builds
# projects:
#   - id: myproj
#     repo_url: https://example.com/myproj.git
#     mirror_dir: ~/.rexd/mirrors/myproj.git
"#;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid json config: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] miniyaml::YamlError),

    #[error(transparent)]
    Path(#[from] pathutil::PathError),

    #[error("project id is required")]
    ProjectIdRequired,

    #[error("project repo_url is required")]
    ProjectRepoUrlRequired,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A registered project: executions may bind to an immutable revision of it.
#[derive(Debug, Clone)]
pub struct Project {
    pub id: String,
    pub repo_url: String,
    /// Bare mirror location; defaults to `<data_dir>/mirrors/<id>.git`.
    pub mirror_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub data_dir: PathBuf,
    pub auth_token: Option<String>,
    /// Maximum number of exec directories kept on disk; `<= 0` disables
    /// retention GC.
    pub retention_count: i64,
    pub allowed_cwd_roots: Vec<PathBuf>,
    pub projects: Vec<Project>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            auth_token: None,
            retention_count: DEFAULT_RETENTION_COUNT,
            allowed_cwd_roots: Vec::new(),
            projects: Vec::new(),
        }
    }
}

impl Config {
    pub fn find_project(&self, id: &str) -> Option<&Project> {
        self.projects.iter().find(|p| p.id == id)
    }

    pub fn mirror_dir_for(&self, project: &Project) -> PathBuf {
        match &project.mirror_dir {
            Some(dir) => dir.clone(),
            None => self
                .data_dir
                .join("mirrors")
                .join(format!("{}.git", project.id)),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    listen: Option<String>,
    data_dir: Option<String>,
    auth_token: Option<String>,
    retention_count: Option<i64>,
    #[serde(default)]
    allowed_cwd_roots: Vec<String>,
    #[serde(default)]
    projects: Vec<RawProject>,
}

#[derive(Debug, Deserialize)]
struct RawProject {
    #[serde(default)]
    id: String,
    #[serde(default)]
    repo_url: String,
    #[serde(default)]
    mirror_dir: Option<String>,
}

/// Write a commented default config on first use. Returns whether a file
/// was created and the resolved path.
pub fn ensure_default_config(path: &str) -> Result<(bool, PathBuf), ConfigError> {
    let p = expand_user(path)?;
    if p.exists() {
        return Ok((false, p));
    }
    if let Some(parent) = p.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&p, DEFAULT_CONFIG_TEMPLATE)?;
    Ok((true, p))
}

pub fn load(path: &str) -> Result<Config, ConfigError> {
    let p = expand_user(path)?;
    let text = std::fs::read_to_string(&p).map_err(|source| ConfigError::Read {
        path: p.clone(),
        source,
    })?;
    let raw = if text.trim_start().starts_with('{') {
        serde_json::from_str::<RawConfig>(&text)?
    } else {
        raw_from_yaml(&text)?
    };
    finalize(raw)
}

fn raw_from_yaml(text: &str) -> Result<RawConfig, ConfigError> {
    let doc = miniyaml::parse(text)?;
    let mut raw = RawConfig::default();
    if let Some(v) = doc.get("listen") {
        raw.listen = v.as_str().map(str::to_string);
    }
    if let Some(v) = doc.get("data_dir") {
        raw.data_dir = v.as_str().map(str::to_string);
    }
    if let Some(v) = doc.get("auth_token") {
        raw.auth_token = v.as_str().map(str::to_string);
    }
    if let Some(v) = doc.get("retention_count") {
        raw.retention_count = v.as_int();
    }
    if let Some(items) = doc.get("allowed_cwd_roots").and_then(|v| v.as_list()) {
        for item in items {
            if let Item::Scalar(Scalar::Str(s)) = item {
                raw.allowed_cwd_roots.push(s.clone());
            }
        }
    }
    if let Some(items) = doc.get("projects").and_then(|v| v.as_list()) {
        for item in items {
            let Item::Map(map) = item else { continue };
            raw.projects.push(RawProject {
                id: map
                    .get("id")
                    .and_then(Scalar::as_str)
                    .unwrap_or_default()
                    .to_string(),
                repo_url: map
                    .get("repo_url")
                    .and_then(Scalar::as_str)
                    .unwrap_or_default()
                    .to_string(),
                mirror_dir: map
                    .get("mirror_dir")
                    .and_then(Scalar::as_str)
                    .map(str::to_string),
            });
        }
    }
    Ok(raw)
}

fn finalize(raw: RawConfig) -> Result<Config, ConfigError> {
    let mut cfg = Config::default();
    if let Some(listen) = raw.listen.filter(|s| !s.is_empty()) {
        cfg.listen = listen;
    }
    let data_dir = raw
        .data_dir
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_DATA_DIR.to_string());
    cfg.data_dir = clean(&expand_user(&data_dir)?);
    cfg.auth_token = raw.auth_token.filter(|s| !s.is_empty());
    if let Some(n) = raw.retention_count {
        // An explicit non-positive value disables retention GC.
        cfg.retention_count = n;
    }
    for root in raw.allowed_cwd_roots {
        cfg.allowed_cwd_roots.push(clean(&expand_user(&root)?));
    }
    for p in raw.projects {
        if p.id.is_empty() {
            return Err(ConfigError::ProjectIdRequired);
        }
        if p.repo_url.is_empty() {
            return Err(ConfigError::ProjectRepoUrlRequired);
        }
        let mirror_dir = match p.mirror_dir.filter(|s| !s.is_empty()) {
            Some(dir) => Some(clean(&expand_user(&dir)?)),
            None => None,
        };
        cfg.projects.push(Project {
            id: p.id,
            repo_url: p.repo_url,
            mirror_dir,
        });
    }
    Ok(cfg)
}

/// Load a config from an already-resolved path, test helper style.
pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
    load(&path.to_string_lossy())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn test_load_yaml_with_projects() {
        let (_dir, path) = write_config(concat!(
            "listen: 127.0.0.1:9000\n",
            "data_dir: /tmp/rexd-test\n",
            "auth_token: sekrit\n",
            "retention_count: 5\n",
            "allowed_cwd_roots:\n",
            "  - /srv\n",
            "projects:\n",
            "  - id: p1\n",
            "    repo_url: /tmp/p1.git\n",
        ));
        let cfg = load_from(&path).unwrap();
        assert_eq!(cfg.listen, "127.0.0.1:9000");
        assert_eq!(cfg.data_dir, PathBuf::from("/tmp/rexd-test"));
        assert_eq!(cfg.auth_token.as_deref(), Some("sekrit"));
        assert_eq!(cfg.retention_count, 5);
        assert_eq!(cfg.allowed_cwd_roots, vec![PathBuf::from("/srv")]);
        assert_eq!(cfg.projects.len(), 1);
        assert_eq!(cfg.projects[0].id, "p1");
    }

    #[test]
    fn test_load_json() {
        let (_dir, path) = write_config(
            r#"{"listen":"127.0.0.1:9001","data_dir":"/tmp/rexd-json","retention_count":7}"#,
        );
        let cfg = load_from(&path).unwrap();
        assert_eq!(cfg.listen, "127.0.0.1:9001");
        assert_eq!(cfg.retention_count, 7);
    }

    #[test]
    fn test_defaults_applied() {
        let (_dir, path) = write_config("data_dir: /tmp/rexd-defaults\n");
        let cfg = load_from(&path).unwrap();
        assert_eq!(cfg.listen, DEFAULT_LISTEN);
        assert_eq!(cfg.retention_count, DEFAULT_RETENTION_COUNT);
        assert!(cfg.auth_token.is_none());
        assert!(cfg.projects.is_empty());
    }

    #[test]
    fn test_explicit_zero_retention_disables_gc() {
        let (_dir, path) = write_config("data_dir: /tmp/x\nretention_count: 0\n");
        let cfg = load_from(&path).unwrap();
        assert_eq!(cfg.retention_count, 0);
    }

    #[test]
    fn test_project_without_repo_url_rejected() {
        let (_dir, path) = write_config("projects:\n  - id: p1\n");
        assert!(matches!(
            load_from(&path),
            Err(ConfigError::ProjectRepoUrlRequired)
        ));
    }

    #[test]
    fn test_mirror_dir_default() {
        let cfg = Config {
            data_dir: PathBuf::from("/data"),
            ..Config::default()
        };
        let project = Project {
            id: "p1".to_string(),
            repo_url: "u".to_string(),
            mirror_dir: None,
        };
        assert_eq!(
            cfg.mirror_dir_for(&project),
            PathBuf::from("/data/mirrors/p1.git")
        );
    }

    #[test]
    fn test_ensure_default_config_creates_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub/config.yaml");
        let path_str = path.to_string_lossy().to_string();
        let (created, resolved) = ensure_default_config(&path_str).unwrap();
        assert!(created);
        assert_eq!(resolved, path);
        let (created_again, _) = ensure_default_config(&path_str).unwrap();
        assert!(!created_again);
        // The template is all comments, so loading yields pure defaults.
        let cfg = load_from(&path).unwrap();
        assert_eq!(cfg.listen, DEFAULT_LISTEN);
    }
}
