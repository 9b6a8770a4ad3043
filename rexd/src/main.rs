//! rexd - remote execution daemon.
//!
//! Accepts commands over an authenticated HTTP API, runs each under a
//! supervised process group in its own workspace, and persists the results
//! under the data directory.

#![forbid(unsafe_code)]

mod config;
mod cwd;
mod exec;
#[cfg(test)]
mod exec_flow_tests;
mod process;
mod service;
mod store;
mod workdir;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rex_common::selfupdate::Updater;
use serde_json::json;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "rexd")]
#[command(author, version, about = "rexd - remote execution daemon")]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon.
    Serve {
        /// Path to config yaml
        #[arg(long, default_value = config::DEFAULT_CONFIG_PATH)]
        config: String,
    },
    /// Print the daemon version.
    Version,
    /// Check for and apply a released update.
    Update {
        /// Check the latest release only
        #[arg(long)]
        check: bool,
        /// Apply the update without a prompt
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Command::Serve { config } => serve(&config).await,
        Command::Version => {
            println!("{}", service::VERSION);
            Ok(())
        }
        Command::Update { check, yes } => update(check, yes).await,
    }
}

async fn serve(config_path: &str) -> Result<()> {
    let (created, resolved) = config::ensure_default_config(config_path)
        .context("failed to bootstrap config")?;
    if created {
        info!(path = %resolved.display(), "created default config");
    }
    let cfg = config::load(config_path).context("failed to load config")?;
    std::fs::create_dir_all(&cfg.data_dir).context("failed to create data_dir")?;

    let listen = cfg.listen.clone();
    let svc = service::Service::new(cfg);
    let router = service::router(svc);

    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    info!(%listen, version = service::VERSION, "listening");
    axum::serve(listener, router).await.context("server error")
}

async fn update(check_only: bool, yes: bool) -> Result<()> {
    let updater = Updater::new("rexd", service::VERSION);
    let os = std::env::consts::OS;
    let arch = std::env::consts::ARCH;

    let check = updater.check(os, arch).await.context("update check failed")?;
    if check_only {
        println!(
            "{}",
            json!({
                "binary": "rexd",
                "current_version": check.current_version,
                "latest_version": check.latest_version,
                "comparable": check.comparable,
                "update_available": check.update_available,
                "asset": check.asset_name,
            })
        );
        return Ok(());
    }
    if check.comparable && !check.update_available {
        println!("rexd is up to date ({})", check.current_version);
        return Ok(());
    }
    if !yes {
        eprintln!(
            "update rexd from {} to {}? use --yes to confirm",
            check.current_version, check.latest_version
        );
        std::process::exit(2);
    }
    let latest = updater.update(os, arch).await.context("update failed")?;
    println!("updated rexd to {latest}");
    Ok(())
}
