//! Remote daemon bring-up: precheck, start over SSH, verify.
//!
//! The probe seam exists so the state machine can be exercised without a
//! network: tests script the SSH and health-check outcomes.

use async_trait::async_trait;
use serde::Serialize;

use crate::check::{self, MachineStatus};
use crate::config::Machine;
use crate::ssh::{self, SshResult};

const DEFAULT_MAX_CHECKS: u32 = 5;

#[async_trait]
pub trait MachineProbe: Send + Sync {
    async fn run_ssh(&self, target: &str, cmd: &str) -> SshResult;
    async fn check(&self, m: &Machine) -> MachineStatus;
    /// Delay between verify rounds.
    async fn pause(&self);
}

pub struct LiveProbe;

#[async_trait]
impl MachineProbe for LiveProbe {
    async fn run_ssh(&self, target: &str, cmd: &str) -> SshResult {
        ssh::run_ssh(target, cmd).await
    }

    async fn check(&self, m: &Machine) -> MachineStatus {
        check::check(m).await
    }

    async fn pause(&self) {
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    }
}

#[derive(Debug, Serialize)]
pub struct BringupReport {
    pub ok: bool,
    pub phase: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    pub code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<MachineStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<MachineStatus>,
}

impl BringupReport {
    fn failed(phase: &str, message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self {
            ok: false,
            phase: phase.to_string(),
            message: message.into(),
            error: None,
            hint: Some(hint.into()),
            stdout: None,
            stderr: None,
            code: 0,
            before: None,
            after: None,
        }
    }
}

pub async fn up(m: &Machine) -> BringupReport {
    up_with(&LiveProbe, m, DEFAULT_MAX_CHECKS).await
}

pub async fn up_with(probe: &dyn MachineProbe, m: &Machine, max_checks: u32) -> BringupReport {
    let max_checks = max_checks.max(1);

    let Some(ssh_target) = m.ssh.as_deref().filter(|s| !s.trim().is_empty()) else {
        return BringupReport::failed(
            "precheck",
            "machine.ssh is required",
            format!(
                "set machine.ssh in config, then run `rex machine check --machine {}`",
                m.name
            ),
        );
    };
    if m.daemon_cmd.trim().is_empty() {
        return BringupReport::failed(
            "precheck",
            "machine.daemon_cmd is required",
            "set daemon_cmd in config to start rexd on the remote machine".to_string(),
        );
    }

    let before = probe.check(m).await;
    if before.daemon_ok {
        return BringupReport {
            ok: true,
            phase: "precheck".to_string(),
            message: "daemon already healthy".to_string(),
            error: None,
            hint: None,
            stdout: None,
            stderr: None,
            code: 0,
            before: Some(before.clone()),
            after: Some(before),
        };
    }
    if !before.ssh_ok {
        let error = first_non_empty(&[before.error.as_deref().unwrap_or(""), "ssh check failed before start"]);
        return BringupReport {
            ok: false,
            phase: "precheck".to_string(),
            message: "machine up precheck".to_string(),
            error: Some(error),
            hint: Some(format!(
                "fix SSH connectivity first, then retry `rex machine up --machine {}`",
                m.name
            )),
            stdout: None,
            stderr: None,
            code: 0,
            before: Some(before.clone()),
            after: Some(before),
        };
    }

    let run = probe.run_ssh(ssh_target, &m.daemon_cmd).await;

    let mut after = probe.check(m).await;
    let mut checks = 1;
    while checks < max_checks && !after.daemon_ok {
        probe.pause().await;
        after = probe.check(m).await;
        checks += 1;
    }

    if after.daemon_ok {
        let (message, error) = if run.success() {
            ("daemon is healthy".to_string(), None)
        } else {
            (
                "daemon is healthy, but start command reported an error".to_string(),
                Some(first_non_empty(&[
                    run.stderr.trim(),
                    &format!("exit status {}", run.code),
                ])),
            )
        };
        return BringupReport {
            ok: true,
            phase: "verify".to_string(),
            message,
            error,
            hint: None,
            stdout: some_trimmed(&run.stdout),
            stderr: some_trimmed(&run.stderr),
            code: run.code,
            before: Some(before),
            after: Some(after),
        };
    }

    let (phase, message, error) = if !run.success() {
        (
            "start",
            "failed to execute daemon start command".to_string(),
            first_non_empty(&[run.stderr.trim(), &format!("exit status {}", run.code)]),
        )
    } else {
        (
            "verify",
            "daemon did not become healthy after start".to_string(),
            first_non_empty(&[
                after.error.as_deref().unwrap_or(""),
                "daemon health check failed",
            ]),
        )
    };
    BringupReport {
        ok: false,
        phase: phase.to_string(),
        message,
        error: Some(error),
        hint: Some(failure_hint(&m.name, phase)),
        stdout: some_trimmed(&run.stdout),
        stderr: some_trimmed(&run.stderr),
        code: run.code,
        before: Some(before),
        after: Some(after),
    }
}

fn failure_hint(machine_name: &str, phase: &str) -> String {
    if phase == "start" {
        return format!(
            "verify daemon_cmd and remote permissions; then run `rex machine check --machine {machine_name}`"
        );
    }
    format!(
        "inspect remote logs (for example `/tmp/rexd.log`) and then run `rex machine check --machine {machine_name}`"
    )
}

fn first_non_empty(candidates: &[&str]) -> String {
    for c in candidates {
        let c = c.trim();
        if !c.is_empty() {
            return c.to_string();
        }
    }
    "unknown error".to_string()
}

fn some_trimmed(s: &str) -> Option<String> {
    let s = s.trim();
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}
