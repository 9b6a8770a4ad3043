//! Machine health probe: SSH reachability, then daemon health.

use std::time::Duration;

use rex_common::timeutil::now_rfc3339;
use serde::Serialize;

use crate::config::Machine;
use crate::ssh::run_ssh;

const DIRECT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default, Serialize)]
pub struct MachineStatus {
    pub name: String,
    pub ssh_ok: bool,
    pub daemon_ok: bool,
    pub latency_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub checked_at: String,
    pub daemon_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daemon_addr: Option<String>,
}

pub async fn check(m: &Machine) -> MachineStatus {
    let start = std::time::Instant::now();
    let mut st = MachineStatus {
        name: m.name.clone(),
        daemon_port: m.daemon_port,
        checked_at: now_rfc3339(),
        ..MachineStatus::default()
    };

    let Some(ssh_target) = m.ssh.as_deref() else {
        st.error = Some("machine.ssh is required for check".to_string());
        st.latency_ms = start.elapsed().as_millis() as i64;
        return st;
    };

    let res = run_ssh(ssh_target, "echo ok").await;
    if !res.success() || res.stdout.trim() != "ok" {
        let msg = res.stderr.trim();
        st.error = Some(if msg.is_empty() {
            "ssh not reachable".to_string()
        } else {
            msg.to_string()
        });
        st.latency_ms = start.elapsed().as_millis() as i64;
        return st;
    }
    st.ssh_ok = true;

    // The daemon listens on loopback; probe it from the machine itself.
    let health_cmd = format!("curl -fsS http://127.0.0.1:{}/health", m.daemon_port);
    let res = run_ssh(ssh_target, &health_cmd).await;
    if res.success() && serde_json::from_str::<serde_json::Value>(&res.stdout).is_ok() {
        st.daemon_ok = true;
    }

    // An already-forwarded addr counts too.
    if !st.daemon_ok {
        if let Some(addr) = m.addr.as_deref() {
            if direct_health_ok(addr).await {
                st.daemon_ok = true;
                st.daemon_addr = Some(addr.to_string());
            }
        }
    }

    if st.ssh_ok && !st.daemon_ok {
        st.error = Some("daemon not healthy".to_string());
    }
    st.latency_ms = start.elapsed().as_millis() as i64;
    st
}

async fn direct_health_ok(addr: &str) -> bool {
    let Ok(client) = reqwest::Client::builder()
        .timeout(DIRECT_PROBE_TIMEOUT)
        .build()
    else {
        return false;
    };
    let url = format!("{}/health", addr.trim_end_matches('/'));
    match client.get(&url).send().await {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    }
}
