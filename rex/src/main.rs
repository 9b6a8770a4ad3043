//! rex - control-plane client for rexd daemons.
//!
//! Connects to remote daemons directly, over an on-demand SSH port forward,
//! or over a persistent background tunnel, and drives executions end to
//! end: start, inspect, tail, watch, cancel, plus machine health checks and
//! daemon bring-up.

#![forbid(unsafe_code)]

mod bringup;
mod broker;
mod check;
mod client;
mod commands;
mod config;
mod retry;
mod ssh;
mod timebound;
mod watch;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use commands::exec::ExecCommand;
use commands::machine::MachineCommand;

#[derive(Parser)]
#[command(name = "rex")]
#[command(author, version, about = "rex - control-plane client for rexd daemons")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Work with remote executions.
    Exec {
        #[command(subcommand)]
        command: ExecCommand,
    },
    /// Inspect and manage configured machines.
    Machine {
        #[command(subcommand)]
        command: MachineCommand,
    },
    /// Check for and apply a released update.
    Update {
        /// Check the latest release only
        #[arg(long)]
        check: bool,
        /// Apply the update without a prompt
        #[arg(long)]
        yes: bool,
    },
    /// Print the client version.
    Version,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Stay quiet by default: stdout carries NDJSON events, stderr carries
    // structured tunnel events. RUST_LOG opts into tracing output.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let code = match cli.command {
        Command::Exec { command } => commands::exec::dispatch(command).await,
        Command::Machine { command } => commands::machine::dispatch(command).await,
        Command::Update { check, yes } => commands::update::update(check, yes).await,
        Command::Version => {
            println!("{}", commands::update::VERSION);
            commands::EXIT_OK
        }
    };
    if code != 0 {
        std::process::exit(code);
    }
}
