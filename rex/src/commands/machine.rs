//! `rex machine ...` handlers.

use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Subcommand};
use rex_common::timeutil::now_rfc3339;
use serde_json::json;
use tokio::sync::Semaphore;

use crate::bringup;
use crate::check::{self, MachineStatus};
use crate::commands::{load_config, load_machine, print_json, ConnectArgs, EXIT_OK, EXIT_RUNTIME, EXIT_USAGE};
use crate::config::{self, Machine};
use crate::ssh;
use crate::timebound::parse_duration;

#[derive(Debug, Subcommand)]
pub enum MachineCommand {
    /// Probe SSH and daemon health for one machine.
    Check(ConnectArgs),
    /// Probe every configured machine in parallel.
    #[command(alias = "ls")]
    List(ListArgs),
    /// Start the daemon on a machine and verify it came up.
    Up(ConnectArgs),
    /// Run a one-shot command over SSH with agent forwarding.
    Ssh(SshArgs),
}

#[derive(Debug, Args)]
pub struct ListArgs {
    /// Config file path
    #[arg(long, default_value = config::DEFAULT_CONFIG_PATH)]
    pub config: String,

    /// Output json
    #[arg(long)]
    pub json: bool,

    /// Per-machine check timeout (like 8s)
    #[arg(long, default_value = "8s")]
    pub timeout: String,

    /// Max parallel machine checks
    #[arg(long, default_value_t = 6)]
    pub parallel: usize,
}

#[derive(Debug, Args)]
pub struct SshArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,

    /// Remote command string
    #[arg(long)]
    pub cmd: String,

    /// Request a tty (-tt)
    #[arg(long)]
    pub tty: bool,
}

pub async fn dispatch(command: MachineCommand) -> i32 {
    match command {
        MachineCommand::Check(args) => check_cmd(args).await,
        MachineCommand::List(args) => list(args).await,
        MachineCommand::Up(args) => up(args).await,
        MachineCommand::Ssh(args) => ssh_cmd(args).await,
    }
}

async fn check_cmd(args: ConnectArgs) -> i32 {
    let (_cfg, m) = match load_machine(&args) {
        Ok(v) => v,
        Err(code) => return code,
    };
    let st = check::check(&m).await;
    print_json(&st);
    EXIT_OK
}

async fn up(args: ConnectArgs) -> i32 {
    let (_cfg, m) = match load_machine(&args) {
        Ok(v) => v,
        Err(code) => return code,
    };
    if m.ssh.as_deref().map_or(true, |s| s.trim().is_empty()) {
        eprintln!("machine.ssh is required");
        return EXIT_USAGE;
    }
    let report = bringup::up(&m).await;
    print_json(&report);
    if report.ok {
        EXIT_OK
    } else {
        EXIT_RUNTIME
    }
}

async fn ssh_cmd(args: SshArgs) -> i32 {
    if args.cmd.trim().is_empty() {
        eprintln!("--cmd is required");
        return EXIT_USAGE;
    }
    let (_cfg, m) = match load_machine(&args.connect) {
        Ok(v) => v,
        Err(code) => return code,
    };
    let Some(ssh_target) = m.ssh.as_deref() else {
        eprintln!("machine.ssh is required");
        return EXIT_USAGE;
    };
    let res = ssh::run_ssh_with_options(ssh_target, &args.cmd, true, args.tty).await;
    print_json(&json!({
        "ok": res.success(),
        "ssh": ssh_target,
        "forward_agent": true,
        "tty": args.tty,
        "stdout": res.stdout,
        "stderr": res.stderr,
        "code": res.code,
    }));
    EXIT_OK
}

async fn list(args: ListArgs) -> i32 {
    let Some(timeout) = parse_duration(&args.timeout) else {
        eprintln!("--timeout must be a duration like 8s");
        return EXIT_USAGE;
    };
    let cfg = match load_config(&args.config) {
        Ok(cfg) => cfg,
        Err(code) => return code,
    };

    let statuses = check_all_machines(&cfg.machines, timeout, args.parallel.max(1)).await;
    let summary = summarize(&statuses);
    if args.json {
        print_json(&json!({
            "total": summary.total,
            "ssh_ok": summary.ssh_ok,
            "daemon_ok": summary.daemon_ok,
            "failed": summary.failed,
            "checked_at": now_rfc3339(),
            "machines": statuses,
        }));
        return EXIT_OK;
    }

    print_table(&statuses);
    println!(
        "\nsummary: total={} ssh_ok={} daemon_ok={} failed={}",
        summary.total, summary.ssh_ok, summary.daemon_ok, summary.failed
    );
    EXIT_OK
}

async fn check_all_machines(
    machines: &[Machine],
    timeout: Duration,
    parallel: usize,
) -> Vec<MachineStatus> {
    let semaphore = Arc::new(Semaphore::new(parallel));
    let mut handles = Vec::with_capacity(machines.len());
    for m in machines {
        let m = m.clone();
        let permit = semaphore.clone().acquire_owned().await.expect("semaphore");
        handles.push(tokio::spawn(async move {
            let _permit = permit;
            match tokio::time::timeout(timeout, check::check(&m)).await {
                Ok(st) => st,
                Err(_) => MachineStatus {
                    name: m.name.clone(),
                    daemon_port: m.daemon_port,
                    checked_at: now_rfc3339(),
                    error: Some("check timed out".to_string()),
                    ..MachineStatus::default()
                },
            }
        }));
    }

    let mut out = Vec::with_capacity(handles.len());
    for handle in handles {
        match handle.await {
            Ok(st) => out.push(st),
            Err(err) => {
                // A panicking check should not hide the other machines.
                tracing::warn!(%err, "machine check task failed");
            }
        }
    }
    out
}

struct ListSummary {
    total: usize,
    ssh_ok: usize,
    daemon_ok: usize,
    failed: usize,
}

fn summarize(statuses: &[MachineStatus]) -> ListSummary {
    let mut summary = ListSummary {
        total: statuses.len(),
        ssh_ok: 0,
        daemon_ok: 0,
        failed: 0,
    };
    for st in statuses {
        if st.ssh_ok {
            summary.ssh_ok += 1;
        }
        if st.daemon_ok {
            summary.daemon_ok += 1;
        }
        let has_error = st.error.as_deref().is_some_and(|e| !e.trim().is_empty());
        if !st.daemon_ok || has_error {
            summary.failed += 1;
        }
    }
    summary
}

fn print_table(statuses: &[MachineStatus]) {
    let name_width = statuses
        .iter()
        .map(|s| s.name.len())
        .chain(["NAME".len()])
        .max()
        .unwrap_or(4);
    println!("{:<name_width$}  SSH   DAEMON  LATENCY_MS  ERROR", "NAME");
    for st in statuses {
        let ssh = if st.ssh_ok { "ok" } else { "down" };
        let daemon = if st.daemon_ok { "ok" } else { "down" };
        let error = st
            .error
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .unwrap_or("-");
        println!(
            "{:<name_width$}  {:<4}  {:<6}  {:<10}  {}",
            st.name, ssh, daemon, st.latency_ms, error
        );
    }
}
