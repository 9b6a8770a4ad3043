//! `rex exec ...` handlers.

use std::collections::BTreeMap;

use anyhow::anyhow;
use clap::{Args, Subcommand};
use rex_common::protocol::ExecStartRequest;
use serde_json::json;

use crate::broker::{self, Connection, Teardown, TunnelMeta};
use crate::check;
use crate::client::ExecLogsOptions;
use crate::commands::{load_machine, print_json, ConnectArgs, EXIT_OK, EXIT_RUNTIME, EXIT_USAGE};
use crate::config::Machine;
use crate::retry::{is_transient_error, with_retry};
use crate::ssh;
use crate::timebound::{normalize_time_bound, parse_duration};
use crate::watch::{self, WatchOptions};

#[derive(Debug, Subcommand)]
pub enum ExecCommand {
    /// Start an execution and stream it to completion.
    Run(StartArgs),
    /// Start an execution and print its id.
    Start(StartArgs),
    /// Fetch the full execution record.
    Result(IdArgs),
    /// Fetch one tail window of a log stream.
    Logs(LogsArgs),
    /// Follow logs until the execution finishes.
    Watch(WatchArgs),
    /// Cancel a running execution.
    Cancel(IdArgs),
    /// Diagnose connectivity and remote tooling for a machine.
    Doctor(DoctorArgs),
}

#[derive(Debug, Args)]
pub struct StartArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,

    /// Project id
    #[arg(long)]
    pub project: Option<String>,

    /// Git ref (required if --project is set)
    #[arg(long = "ref")]
    pub git_ref: Option<String>,

    /// Command string
    #[arg(long)]
    pub cmd: String,

    /// Working dir (relative or absolute)
    #[arg(long)]
    pub cwd: Option<String>,

    /// Environment variable KEY=VAL (repeatable)
    #[arg(long = "env")]
    pub env: Vec<String>,
}

#[derive(Debug, Args)]
pub struct IdArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,

    /// Exec id
    #[arg(long)]
    pub id: String,
}

#[derive(Debug, Args)]
pub struct LogsArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,

    /// Exec id
    #[arg(long)]
    pub id: String,

    /// stdout or stderr
    #[arg(long, default_value = "stdout")]
    pub stream: String,

    /// Tail bytes
    #[arg(long, default_value_t = 2000)]
    pub tail: i64,

    /// Tail lines (overrides --tail when positive)
    #[arg(long, default_value_t = 0)]
    pub tail_lines: usize,

    /// Lower time bound (RFC3339 or relative like 10m)
    #[arg(long, default_value = "")]
    pub since: String,

    /// Upper time bound (RFC3339 or relative like 10m)
    #[arg(long, default_value = "")]
    pub until: String,
}

#[derive(Debug, Args)]
pub struct WatchArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,

    /// Exec id
    #[arg(long)]
    pub id: String,

    /// stdout|stderr|both
    #[arg(long, default_value = "both")]
    pub stream: String,

    /// Poll interval (like 1s or 500ms)
    #[arg(long, default_value = "1s")]
    pub poll: String,

    /// Tail bytes fetched each poll
    #[arg(long, default_value_t = 2000)]
    pub tail: i64,
}

#[derive(Debug, Args)]
pub struct DoctorArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,
}

pub async fn dispatch(command: ExecCommand) -> i32 {
    match command {
        ExecCommand::Run(args) => run(args).await,
        ExecCommand::Start(args) => start(args).await,
        ExecCommand::Result(args) => result(args).await,
        ExecCommand::Logs(args) => logs(args).await,
        ExecCommand::Watch(args) => watch_cmd(args).await,
        ExecCommand::Cancel(args) => cancel(args).await,
        ExecCommand::Doctor(args) => doctor(args).await,
    }
}

fn build_request(args: &StartArgs) -> ExecStartRequest {
    let mut env = BTreeMap::new();
    for kv in &args.env {
        if let Some((k, v)) = kv.split_once('=') {
            env.insert(k.to_string(), v.to_string());
        }
    }
    ExecStartRequest {
        project_id: args.project.clone(),
        git_ref: args.git_ref.clone(),
        cmd: args.cmd.clone(),
        cwd: args.cwd.clone(),
        env,
    }
}

fn tunnel_fields(tm: &TunnelMeta) -> serde_json::Value {
    json!({
        "machine": tm.machine,
        "local_port": tm.local_port,
        "tunnel_pid": tm.tunnel_pid,
        "health_latency": format!("{:?}", tm.health_latency),
        "retry_count": tm.retry_count,
    })
}

fn merge_fields(base: serde_json::Value, extra: serde_json::Value) -> serde_json::Value {
    let (serde_json::Value::Object(mut base), serde_json::Value::Object(extra)) = (base, extra)
    else {
        unreachable!("tunnel event fields are objects");
    };
    base.extend(extra);
    serde_json::Value::Object(base)
}

/// Start once; on failure over a tunnel, decide whether the fault is the
/// tunnel's (rebuild once) or the daemon's (surface unchanged).
async fn start_with_tunnel_recovery(
    conn: &mut Connection,
    m: &Machine,
    req: &ExecStartRequest,
) -> anyhow::Result<rex_common::protocol::ExecStartResponse> {
    let first = conn.client.exec_start(req).await;
    let Err(err) = first else {
        return first;
    };
    let Some(tm) = conn.tunnel.clone() else {
        return Err(err);
    };

    let (latency, health) = broker::check_health(&conn.client).await;
    if health.is_ok() && !is_transient_error(&err) {
        broker::log_tunnel_event(
            "exec_start",
            merge_fields(
                tunnel_fields(&tm),
                json!({
                    "error_source": "rexd",
                    "error": format!("{err:#}"),
                    "health_latency": format!("{latency:?}"),
                    "retry_count": 0,
                }),
            ),
        );
        return Err(err);
    }

    broker::log_tunnel_event(
        "exec_start",
        merge_fields(
            tunnel_fields(&tm),
            json!({
                "error_source": "tunnel",
                "error": format!("{err:#}"),
                "health_latency": format!("{latency:?}"),
                "retry_count": 1,
            }),
        ),
    );
    let old = std::mem::replace(&mut conn.teardown, Teardown::None);
    old.close().await;
    match broker::connect_for_exec(m).await {
        Ok(rebuilt) => {
            *conn = rebuilt;
            conn.client.exec_start(req).await
        }
        Err(rebuild_err) => Err(anyhow!(
            "tunnel error: {rebuild_err:#} (orig exec start error: {err:#})"
        )),
    }
}

async fn start(args: StartArgs) -> i32 {
    let (_cfg, m) = match load_machine(&args.connect) {
        Ok(v) => v,
        Err(code) => return code,
    };
    let mut conn = match broker::connect_for_exec(&m).await {
        Ok(c) => c,
        Err(err) => {
            eprintln!("{err:#}");
            return EXIT_RUNTIME;
        }
    };

    let req = build_request(&args);
    let outcome = start_with_tunnel_recovery(&mut conn, &m, &req).await;
    let response = match outcome {
        Ok(r) => r,
        Err(err) => {
            eprintln!("{err:#}");
            conn.close().await;
            return EXIT_RUNTIME;
        }
    };

    if let Some(tm) = &conn.tunnel {
        broker::log_tunnel_event(
            "exec_start",
            merge_fields(tunnel_fields(tm), json!({ "exec_id": response.exec_id })),
        );
    }
    print_json(&json!({
        "exec_id": response.exec_id,
        "machine": m.name,
        "status": response.status,
        "base_url": conn.client.base_url(),
    }));
    conn.close().await;
    EXIT_OK
}

async fn run(args: StartArgs) -> i32 {
    let (_cfg, m) = match load_machine(&args.connect) {
        Ok(v) => v,
        Err(code) => return code,
    };
    let mut conn = match broker::connect_for_exec(&m).await {
        Ok(c) => c,
        Err(err) => {
            eprintln!("{err:#}");
            return EXIT_RUNTIME;
        }
    };

    let req = build_request(&args);
    let response = match start_with_tunnel_recovery(&mut conn, &m, &req).await {
        Ok(r) => r,
        Err(err) => {
            eprintln!("{err:#}");
            conn.close().await;
            return EXIT_RUNTIME;
        }
    };

    let opts = WatchOptions::default();
    let mut stdout = std::io::stdout();
    let outcome = watch::watch_exec(&conn.client, &response.exec_id, &opts, &mut stdout).await;

    if let Some(tm) = &conn.tunnel {
        broker::log_tunnel_event(
            "exec_run",
            merge_fields(tunnel_fields(tm), json!({ "exec_id": response.exec_id })),
        );
    }
    conn.close().await;
    match outcome {
        Ok(exit_code) => exit_code,
        Err(err) => {
            eprintln!("{err:#}");
            EXIT_RUNTIME
        }
    }
}

async fn result(args: IdArgs) -> i32 {
    let (_cfg, m) = match load_machine(&args.connect) {
        Ok(v) => v,
        Err(code) => return code,
    };
    let conn = match broker::connect_for_exec(&m).await {
        Ok(c) => c,
        Err(err) => {
            eprintln!("{err:#}");
            return EXIT_RUNTIME;
        }
    };

    let client = conn.client.clone();
    let id = args.id.clone();
    let record = with_retry(3, || {
        let client = client.clone();
        let id = id.clone();
        async move { client.exec_get(&id).await }
    })
    .await;

    let code = match record {
        Ok(record) => {
            if let Some(tm) = &conn.tunnel {
                broker::log_tunnel_event(
                    "exec_result",
                    merge_fields(tunnel_fields(tm), json!({ "exec_id": args.id })),
                );
            }
            println!("{record}");
            EXIT_OK
        }
        Err(err) => {
            eprintln!("{err:#}");
            EXIT_RUNTIME
        }
    };
    conn.close().await;
    code
}

async fn logs(args: LogsArgs) -> i32 {
    let since = match normalize_time_bound(&args.since) {
        Ok(s) => s,
        Err(err) => {
            eprintln!("--since: {err}");
            return EXIT_USAGE;
        }
    };
    let until = match normalize_time_bound(&args.until) {
        Ok(s) => s,
        Err(err) => {
            eprintln!("--until: {err}");
            return EXIT_USAGE;
        }
    };

    let (_cfg, m) = match load_machine(&args.connect) {
        Ok(v) => v,
        Err(code) => return code,
    };
    let conn = match broker::connect_for_exec(&m).await {
        Ok(c) => c,
        Err(err) => {
            eprintln!("{err:#}");
            return EXIT_RUNTIME;
        }
    };

    let opts = ExecLogsOptions {
        stream: Some(args.stream.clone()),
        tail_bytes: Some(args.tail),
        tail_lines: args.tail_lines,
        since: Some(since),
        until: Some(until),
        format: Some("jsonl".to_string()),
    };
    let client = conn.client.clone();
    let id = args.id.clone();
    let body = with_retry(3, || {
        let client = client.clone();
        let id = id.clone();
        let opts = opts.clone();
        async move { client.exec_logs(&id, &opts).await }
    })
    .await;

    let code = match body {
        Ok(body) => {
            use std::io::Write;
            let mut stdout = std::io::stdout();
            let _ = stdout.write_all(&body);
            if let Some(tm) = &conn.tunnel {
                broker::log_tunnel_event(
                    "exec_logs",
                    merge_fields(
                        tunnel_fields(tm),
                        json!({ "exec_id": args.id, "stream": args.stream }),
                    ),
                );
            }
            EXIT_OK
        }
        Err(err) => {
            eprintln!("{err:#}");
            EXIT_RUNTIME
        }
    };
    conn.close().await;
    code
}

async fn watch_cmd(args: WatchArgs) -> i32 {
    let streams = match watch::streams_for(&args.stream) {
        Ok(s) => s,
        Err(err) => {
            eprintln!("{err}");
            return EXIT_USAGE;
        }
    };
    let Some(poll) = parse_duration(&args.poll) else {
        eprintln!("--poll must be a duration like 1s or 500ms");
        return EXIT_USAGE;
    };

    let (_cfg, m) = match load_machine(&args.connect) {
        Ok(v) => v,
        Err(code) => return code,
    };
    let conn = match broker::connect_for_exec(&m).await {
        Ok(c) => c,
        Err(err) => {
            eprintln!("{err:#}");
            return EXIT_RUNTIME;
        }
    };

    let opts = WatchOptions {
        streams,
        poll,
        tail_bytes: args.tail,
    };
    let mut stdout = std::io::stdout();
    let outcome = watch::watch_exec(&conn.client, &args.id, &opts, &mut stdout).await;
    conn.close().await;
    match outcome {
        Ok(exit_code) => exit_code,
        Err(err) => {
            eprintln!("{err:#}");
            EXIT_RUNTIME
        }
    }
}

async fn cancel(args: IdArgs) -> i32 {
    let (_cfg, m) = match load_machine(&args.connect) {
        Ok(v) => v,
        Err(code) => return code,
    };
    let conn = match broker::connect_for_exec(&m).await {
        Ok(c) => c,
        Err(err) => {
            eprintln!("{err:#}");
            return EXIT_RUNTIME;
        }
    };

    let code = match conn.client.exec_cancel(&args.id).await {
        Ok(body) => {
            if let Some(tm) = &conn.tunnel {
                broker::log_tunnel_event(
                    "exec_cancel",
                    merge_fields(tunnel_fields(tm), json!({ "exec_id": args.id })),
                );
            }
            println!("{body}");
            EXIT_OK
        }
        Err(err) => {
            eprintln!("{err:#}");
            EXIT_RUNTIME
        }
    };
    conn.close().await;
    code
}

/// Remote tools worth having on an exec host: project checkouts need git,
/// the health probe path needs curl, file sync workflows need rsync.
const DOCTOR_TOOLS: &[&str] = &["git", "curl", "rsync"];

async fn doctor(args: DoctorArgs) -> i32 {
    let (_cfg, m) = match load_machine(&args.connect) {
        Ok(v) => v,
        Err(code) => return code,
    };

    let st = check::check(&m).await;
    #[derive(serde::Serialize)]
    struct Check {
        name: String,
        ok: bool,
        #[serde(skip_serializing_if = "String::is_empty")]
        detail: String,
    }
    let mut checks = vec![
        Check {
            name: "ssh".to_string(),
            ok: st.ssh_ok,
            detail: st.error.clone().unwrap_or_default(),
        },
        Check {
            name: "rexd_health".to_string(),
            ok: st.daemon_ok,
            detail: st.error.clone().unwrap_or_default(),
        },
    ];

    if let Some(ssh_target) = m.ssh.as_deref() {
        for tool in DOCTOR_TOOLS {
            let res = ssh::run_ssh(
                ssh_target,
                &format!("command -v {tool} >/dev/null 2>&1"),
            )
            .await;
            let ok = res.success();
            checks.push(Check {
                name: tool.to_string(),
                ok,
                detail: if ok {
                    String::new()
                } else {
                    format!("{tool} not found")
                },
            });
        }
    }

    let mut hints = Vec::new();
    let mut overall = true;
    for c in &checks {
        if c.ok {
            continue;
        }
        overall = false;
        match c.name.as_str() {
            "ssh" => hints.push("check SSH key/auth and host reachability".to_string()),
            "rexd_health" => hints.push(format!(
                "run `rex machine up --machine {}` and re-check",
                m.name
            )),
            tool => hints.push(format!("install {tool} on remote machine")),
        }
    }

    print_json(&json!({
        "machine": m.name,
        "overall_ok": overall,
        "checks": checks,
        "hints": hints,
    }));
    if overall {
        EXIT_OK
    } else {
        EXIT_RUNTIME
    }
}
