//! CLI command handlers.
//!
//! Every handler returns the process exit code: 0 success, 1 runtime
//! failure, 2 usage/config error. Handlers print their own errors to
//! stderr, matching the interface contract rather than bubbling anyhow up
//! to a generic reporter.

pub mod exec;
pub mod machine;
pub mod update;

use clap::Args;

use crate::config::{self, Config, Machine};

pub const EXIT_OK: i32 = 0;
pub const EXIT_RUNTIME: i32 = 1;
pub const EXIT_USAGE: i32 = 2;

#[derive(Debug, Clone, Args)]
pub struct ConnectArgs {
    /// Config file path
    #[arg(long, default_value = config::DEFAULT_CONFIG_PATH)]
    pub config: String,

    /// Machine name
    #[arg(long)]
    pub machine: String,
}

/// Load the config (bootstrapping a default file on first use) and resolve
/// one machine. Failures are config-class: printed, exit 2.
pub fn load_machine(args: &ConnectArgs) -> Result<(Config, Machine), i32> {
    let cfg = load_config(&args.config)?;
    let Some(m) = cfg.find_machine(&args.machine) else {
        eprintln!("unknown machine: {}", args.machine);
        return Err(EXIT_USAGE);
    };
    let m = m.clone();
    Ok((cfg, m))
}

pub fn load_config(path: &str) -> Result<Config, i32> {
    match config::ensure_default_config(path) {
        Ok((created, resolved)) => {
            if created {
                eprintln!("created default config: {}", resolved.display());
            }
        }
        Err(err) => {
            eprintln!("failed to load config: {err}");
            return Err(EXIT_USAGE);
        }
    }
    match config::load(path) {
        Ok(cfg) => Ok(cfg),
        Err(err) => {
            eprintln!("failed to load config: {err}");
            Err(EXIT_USAGE)
        }
    }
}

/// Print a value as one JSON line on stdout.
pub fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{s}"),
        Err(err) => eprintln!("failed to encode json: {err}"),
    }
}
