//! Client configuration: the machines this CLI can talk to.

use std::path::PathBuf;

use rex_common::miniyaml::{self, Item, Scalar};
use rex_common::pathutil::{self, expand_user};
use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "~/.config/rex/config.yaml";
pub const DEFAULT_DAEMON_PORT: u16 = 7337;
pub const DEFAULT_DAEMON_CMD: &str =
    "nohup rexd serve --config ~/.config/rexd/config.yaml >/tmp/rexd.log 2>&1 &";

const DEFAULT_CONFIG_TEMPLATE: &str = r#"# rex client config (YAML subset).
machines:
  - name: builder1
    # Option A (recommended): SSH target; rex creates a temporary local
    # port-forward per command.
    ssh: user@builder1.example.com
    daemon_port: 7337

    # Option B: direct addr (e.g. an editor port-forward already exists)
    # addr: http://127.0.0.1:7337

    # Optional: token if rexd has auth_token configured
    # token: change-me

    # Optional: keep a persistent ssh -f -N -L tunnel for exec commands.
    # use_direct_addr: true

    # Optional: how to start rexd over SSH (used by machine up)
    # daemon_cmd: "nohup rexd serve --config ~/.config/rexd/config.yaml >/tmp/rexd.log 2>&1 &"
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

    #[error("machine.name is required")]
    MachineNameRequired,

    #[error("machine {0} requires addr or ssh")]
    MachineAddrOrSshRequired(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One remote daemon the client can reach.
#[derive(Debug, Clone)]
pub struct Machine {
    pub name: String,
    /// Direct base URL of the daemon, scheme included.
    pub addr: Option<String>,
    /// SSH target (`user@host`) for forwards, tunnels, and bring-up.
    pub ssh: Option<String>,
    pub token: Option<String>,
    pub daemon_port: u16,
    pub daemon_cmd: String,
    /// Use a persistent background tunnel for exec commands; requires `ssh`.
    pub use_direct_addr: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub machines: Vec<Machine>,
}

impl Config {
    pub fn find_machine(&self, name: &str) -> Option<&Machine> {
        self.machines.iter().find(|m| m.name == name)
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    machines: Vec<RawMachine>,
}

#[derive(Debug, Default, Deserialize)]
struct RawMachine {
    #[serde(default)]
    name: String,
    #[serde(default)]
    addr: Option<String>,
    #[serde(default)]
    ssh: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    daemon_port: Option<u16>,
    #[serde(default)]
    daemon_cmd: Option<String>,
    #[serde(default)]
    use_direct_addr: Option<bool>,
}

/// Write a commented starter config on first use. Returns whether a file
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
    let Some(items) = doc.get("machines").and_then(|v| v.as_list()) else {
        return Ok(raw);
    };
    for item in items {
        let Item::Map(map) = item else { continue };
        let field = |key: &str| map.get(key).and_then(Scalar::as_str).map(str::to_string);
        raw.machines.push(RawMachine {
            name: field("name").unwrap_or_default(),
            addr: field("addr"),
            ssh: field("ssh"),
            token: field("token"),
            daemon_port: map
                .get("daemon_port")
                .and_then(Scalar::as_int)
                .map(|n| n as u16),
            daemon_cmd: field("daemon_cmd"),
            use_direct_addr: map.get("use_direct_addr").and_then(Scalar::as_bool),
        });
    }
    Ok(raw)
}

fn finalize(raw: RawConfig) -> Result<Config, ConfigError> {
    let mut cfg = Config::default();
    for m in raw.machines {
        if m.name.is_empty() {
            return Err(ConfigError::MachineNameRequired);
        }
        let addr = m
            .addr
            .filter(|a| !a.is_empty())
            .map(|a| normalize_addr(&a));
        let ssh = m.ssh.filter(|s| !s.is_empty());
        if addr.is_none() && ssh.is_none() {
            return Err(ConfigError::MachineAddrOrSshRequired(m.name));
        }
        cfg.machines.push(Machine {
            name: m.name,
            addr,
            ssh,
            token: m.token.filter(|t| !t.is_empty()),
            daemon_port: m.daemon_port.unwrap_or(DEFAULT_DAEMON_PORT),
            daemon_cmd: m
                .daemon_cmd
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| DEFAULT_DAEMON_CMD.to_string()),
            use_direct_addr: m.use_direct_addr.unwrap_or(false),
        });
    }
    Ok(cfg)
}

fn normalize_addr(addr: &str) -> String {
    if addr.starts_with("http://") || addr.starts_with("https://") {
        return addr.to_string();
    }
    format!("http://{addr}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::Path;

    fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        (dir, path)
    }

    fn load_from(path: &Path) -> Result<Config, ConfigError> {
        load(&path.to_string_lossy())
    }

    #[test]
    fn test_load_machines_with_defaults() {
        let (_dir, path) = write_config(concat!(
            "machines:\n",
            "  - name: m1\n",
            "    ssh: user@host\n",
            "  - name: m2\n",
            "    addr: 127.0.0.1:7337\n",
            "    daemon_port: 8000\n",
            "    use_direct_addr: false\n",
        ));
        let cfg = load_from(&path).unwrap();
        assert_eq!(cfg.machines.len(), 2);

        let m1 = cfg.find_machine("m1").unwrap();
        assert_eq!(m1.ssh.as_deref(), Some("user@host"));
        assert_eq!(m1.daemon_port, DEFAULT_DAEMON_PORT);
        assert_eq!(m1.daemon_cmd, DEFAULT_DAEMON_CMD);
        assert!(!m1.use_direct_addr);

        let m2 = cfg.find_machine("m2").unwrap();
        assert_eq!(m2.addr.as_deref(), Some("http://127.0.0.1:7337"));
        assert_eq!(m2.daemon_port, 8000);
    }

    #[test]
    fn test_use_direct_addr_spellings() {
        let (_dir, path) = write_config(concat!(
            "machines:\n",
            "  - name: m1\n",
            "    ssh: user@host\n",
            "    use_direct_addr: yes\n",
        ));
        let cfg = load_from(&path).unwrap();
        assert!(cfg.find_machine("m1").unwrap().use_direct_addr);
    }

    #[test]
    fn test_machine_without_name_rejected() {
        let (_dir, path) = write_config("machines:\n  - ssh: user@host\n");
        assert!(matches!(
            load_from(&path),
            Err(ConfigError::MachineNameRequired)
        ));
    }

    #[test]
    fn test_machine_without_transport_rejected() {
        let (_dir, path) = write_config("machines:\n  - name: m1\n");
        assert!(matches!(
            load_from(&path),
            Err(ConfigError::MachineAddrOrSshRequired(name)) if name == "m1"
        ));
    }

    #[test]
    fn test_find_machine_miss() {
        let (_dir, path) = write_config("machines:\n  - name: m1\n    ssh: u@h\n");
        let cfg = load_from(&path).unwrap();
        assert!(cfg.find_machine("absent").is_none());
    }

    #[test]
    fn test_ensure_default_config_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let path_str = path.to_string_lossy().to_string();
        let (created, _) = ensure_default_config(&path_str).unwrap();
        assert!(created);
        let cfg = load(&path_str).unwrap();
        assert_eq!(cfg.machines.len(), 1);
        assert_eq!(cfg.machines[0].name, "builder1");
    }
}
