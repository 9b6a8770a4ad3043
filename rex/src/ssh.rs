//! SSH transport primitives: one-shot commands, ephemeral local port
//! forwards, and persistent background tunnels.
//!
//! Everything here shells out to the system `ssh` with `BatchMode=yes` so a
//! missing key fails fast instead of prompting.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing::debug;

const CONNECT_TIMEOUT_SECS: u32 = 5;
const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(150);
const PORT_PROBE_INTERVAL: Duration = Duration::from_millis(50);
const PORT_READY_DEADLINE: Duration = Duration::from_secs(2);

pub const LOCAL_HOST: &str = "127.0.0.1";
pub const REMOTE_HOST: &str = "127.0.0.1";

/// Outcome of a remote command. `code` is `255` when ssh itself could not
/// run or was killed, matching ssh's own convention for transport errors.
#[derive(Debug, Clone, Default)]
pub struct SshResult {
    pub stdout: String,
    pub stderr: String,
    pub code: i32,
}

impl SshResult {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

pub async fn run_ssh(target: &str, remote_cmd: &str) -> SshResult {
    run_ssh_with_options(target, remote_cmd, false, false).await
}

pub async fn run_ssh_with_options(
    target: &str,
    remote_cmd: &str,
    forward_agent: bool,
    tty: bool,
) -> SshResult {
    let mut cmd = tokio::process::Command::new("ssh");
    cmd.arg("-o")
        .arg("BatchMode=yes")
        .arg("-o")
        .arg(format!("ConnectTimeout={CONNECT_TIMEOUT_SECS}"));
    if forward_agent {
        cmd.arg("-A");
    }
    if tty {
        cmd.arg("-tt");
    }
    cmd.arg(target).arg(remote_cmd).stdin(Stdio::null());

    match cmd.output().await {
        Ok(output) => SshResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            code: output.status.code().unwrap_or(255),
        },
        Err(err) => SshResult {
            stdout: String::new(),
            stderr: err.to_string(),
            code: 255,
        },
    }
}

/// Reserve an ephemeral local TCP port by binding and immediately closing
/// a listener.
fn reserve_local_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind((LOCAL_HOST, 0))?;
    Ok(listener.local_addr()?.port())
}

async fn wait_port_ready(port: u16, deadline: Duration) -> bool {
    let until = tokio::time::Instant::now() + deadline;
    while tokio::time::Instant::now() < until {
        match tokio::time::timeout(PORT_PROBE_TIMEOUT, TcpStream::connect((LOCAL_HOST, port))).await
        {
            Ok(Ok(_)) => return true,
            _ => tokio::time::sleep(PORT_PROBE_INTERVAL).await,
        }
    }
    false
}

/// An `ssh -N -L` child owned by this process; dropped forwards die with us,
/// `close` tears them down early.
#[derive(Debug)]
pub struct LocalForward {
    pub local_port: u16,
    child: tokio::process::Child,
}

pub async fn start_local_forward(ssh_target: &str, remote_port: u16) -> Result<LocalForward> {
    let local_port = reserve_local_port()?;
    let mut child = tokio::process::Command::new("ssh")
        .arg("-o")
        .arg("ExitOnForwardFailure=yes")
        .arg("-o")
        .arg("BatchMode=yes")
        .arg("-o")
        .arg(format!("ConnectTimeout={CONNECT_TIMEOUT_SECS}"))
        .arg("-N")
        .arg("-L")
        .arg(format!("{LOCAL_HOST}:{local_port}:{REMOTE_HOST}:{remote_port}"))
        .arg(ssh_target)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()?;

    if wait_port_ready(local_port, PORT_READY_DEADLINE).await {
        debug!(local_port, remote_port, "ssh forward ready");
        return Ok(LocalForward { child, local_port });
    }

    let _ = child.kill().await;
    let mut stderr = String::new();
    if let Some(mut pipe) = child.stderr.take() {
        let _ = pipe.read_to_string(&mut stderr).await;
    }
    let msg = stderr.trim();
    if msg.is_empty() {
        bail!("ssh port forward did not become ready");
    }
    bail!("{msg}");
}

impl LocalForward {
    pub async fn close(mut self) {
        let _ = self.child.kill().await;
        let _ = self.child.wait().await;
    }
}

/// A persistent `ssh -f -N -L` tunnel. The ssh child reparents to init and
/// outlives this process; we only keep its PID and the forward pattern.
#[derive(Debug, Clone)]
pub struct Tunnel {
    pub machine: String,
    pub ssh_target: String,
    pub local_host: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    pub pid: i32,
}

pub async fn ensure_tunnel(
    machine: &str,
    ssh_target: &str,
    local_port: u16,
    remote_port: u16,
) -> Result<Tunnel> {
    let local_port = if local_port == 0 {
        reserve_local_port()?
    } else {
        local_port
    };
    let remote_port = if remote_port == 0 { 7337 } else { remote_port };

    let output = tokio::process::Command::new("ssh")
        .arg("-f")
        .arg("-N")
        .arg("-o")
        .arg("ExitOnForwardFailure=yes")
        .arg("-o")
        .arg("BatchMode=yes")
        .arg("-o")
        .arg(format!("ConnectTimeout={CONNECT_TIMEOUT_SECS}"))
        .arg("-L")
        .arg(format!("{LOCAL_HOST}:{local_port}:{REMOTE_HOST}:{remote_port}"))
        .arg(ssh_target)
        .stdin(Stdio::null())
        .output()
        .await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let msg = stderr.trim();
        if msg.is_empty() {
            bail!("ssh tunnel setup exited with {}", output.status);
        }
        bail!("{msg}");
    }

    if !wait_port_ready(local_port, PORT_READY_DEADLINE).await {
        return Err(anyhow!("ssh tunnel did not become ready"));
    }
    let pid = lookup_tunnel_pid(local_port).await;
    Ok(Tunnel {
        machine: machine.to_string(),
        ssh_target: ssh_target.to_string(),
        local_host: LOCAL_HOST.to_string(),
        local_port,
        remote_host: REMOTE_HOST.to_string(),
        remote_port,
        pid,
    })
}

impl Tunnel {
    pub fn addr(&self) -> String {
        format!("http://{}:{}", self.local_host, self.local_port)
    }

    /// SIGTERM the owning ssh process; fall back to a pattern kill when the
    /// PID was never discovered or has gone stale.
    pub async fn close(&self) {
        #[cfg(unix)]
        if self.pid > 0 {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            if kill(Pid::from_raw(self.pid), Signal::SIGTERM).is_ok() {
                return;
            }
        }
        let pattern = format!(
            "{}:{}:{}:{}",
            self.local_host, self.local_port, self.remote_host, self.remote_port
        );
        let _ = tokio::process::Command::new("pkill")
            .arg("-f")
            .arg(&pattern)
            .output()
            .await;
    }
}

/// Recover the PID of the listener that `ssh -f` left behind.
///
/// `lsof` is host-dependent; hosts without it just report PID 0 and close
/// falls back to the pattern kill.
async fn lookup_tunnel_pid(local_port: u16) -> i32 {
    let output = tokio::process::Command::new("lsof")
        .arg("-nP")
        .arg(format!("-tiTCP:{local_port}"))
        .arg("-sTCP:LISTEN")
        .output()
        .await;
    let Ok(output) = output else { return 0 };
    if !output.status.success() {
        return 0;
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .and_then(|line| line.trim().parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_local_port_is_free_to_rebind() {
        let port = reserve_local_port().unwrap();
        assert!(port > 0);
        // The listener was closed, so the port can be bound again.
        std::net::TcpListener::bind((LOCAL_HOST, port)).unwrap();
    }

    #[tokio::test]
    async fn test_wait_port_ready_detects_listener() {
        let listener = tokio::net::TcpListener::bind((LOCAL_HOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });
        assert!(wait_port_ready(port, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_wait_port_ready_times_out_on_closed_port() {
        let port = reserve_local_port().unwrap();
        assert!(!wait_port_ready(port, Duration::from_millis(300)).await);
    }

    #[tokio::test]
    async fn test_run_ssh_reports_transport_failure_as_255() {
        // An unresolvable host fails inside ssh itself.
        let res = run_ssh("nobody@invalid.invalid", "echo ok").await;
        assert_eq!(res.code, 255);
        assert!(!res.success());
    }
}
