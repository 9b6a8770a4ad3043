//! Connection broker: turns a configured machine into a ready HTTP client.
//!
//! Three transports:
//! 1. `addr` configured: plain client, nothing to tear down.
//! 2. `ssh` configured: ephemeral `ssh -N -L` forward owned by this process.
//! 3. `use_direct_addr`: persistent background tunnel, health-probed with
//!    bounded backoff; failures are reported with a `tunnel error:` prefix
//!    so callers can tell tunnel faults from daemon faults.

use std::time::Duration;

use anyhow::{anyhow, bail, Result};

use crate::client::ExecClient;
use crate::config::Machine;
use crate::ssh::{self, LocalForward, Tunnel};

const TUNNEL_ATTEMPTS: u32 = 3;
const TUNNEL_BACKOFF: Duration = Duration::from_millis(250);
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Facts about the tunnel behind a connection, for structured logging.
#[derive(Debug, Clone)]
pub struct TunnelMeta {
    pub machine: String,
    pub local_port: u16,
    pub tunnel_pid: i32,
    pub health_latency: Duration,
    pub retry_count: u32,
}

/// Whatever must be released when the connection is done.
#[derive(Debug)]
pub enum Teardown {
    None,
    Forward(LocalForward),
    Tunnel(Tunnel),
}

impl Teardown {
    pub async fn close(self) {
        match self {
            Self::None => {}
            Self::Forward(forward) => forward.close().await,
            Self::Tunnel(tunnel) => tunnel.close().await,
        }
    }
}

#[derive(Debug)]
pub struct Connection {
    pub client: ExecClient,
    pub teardown: Teardown,
    pub tunnel: Option<TunnelMeta>,
}

impl Connection {
    pub async fn close(self) {
        self.teardown.close().await;
    }
}

/// Plain connection: direct addr if present, else an ephemeral forward.
pub async fn connect(m: &Machine) -> Result<Connection> {
    if let Some(addr) = &m.addr {
        return Ok(Connection {
            client: ExecClient::new(addr, m.token.as_deref()),
            teardown: Teardown::None,
            tunnel: None,
        });
    }
    let Some(ssh_target) = m.ssh.as_deref() else {
        bail!("machine {} has neither addr nor ssh", m.name);
    };
    let forward = ssh::start_local_forward(ssh_target, m.daemon_port)
        .await
        .map_err(|err| anyhow!("failed to create ssh forward: {err:#}"))?;
    let base = format!("http://{}:{}", ssh::LOCAL_HOST, forward.local_port);
    Ok(Connection {
        client: ExecClient::new(&base, m.token.as_deref()),
        teardown: Teardown::Forward(forward),
        tunnel: None,
    })
}

/// Connection for exec commands: adds the persistent-tunnel mode with a
/// health-probed establish loop.
pub async fn connect_for_exec(m: &Machine) -> Result<Connection> {
    if !m.use_direct_addr {
        return connect(m).await;
    }
    let Some(ssh_target) = m.ssh.as_deref() else {
        bail!(
            "tunnel error: machine {} requires machine.ssh for direct addr mode",
            m.name
        );
    };

    let mut last_err: Option<anyhow::Error> = None;
    for attempt in 1..=TUNNEL_ATTEMPTS {
        match ssh::ensure_tunnel(&m.name, ssh_target, 0, m.daemon_port).await {
            Ok(tunnel) => {
                let client = ExecClient::new(&tunnel.addr(), m.token.as_deref());
                let (latency, health) = check_health(&client).await;
                match health {
                    Ok(()) => {
                        let meta = TunnelMeta {
                            machine: m.name.clone(),
                            local_port: tunnel.local_port,
                            tunnel_pid: tunnel.pid,
                            health_latency: latency,
                            retry_count: attempt - 1,
                        };
                        return Ok(Connection {
                            client,
                            teardown: Teardown::Tunnel(tunnel),
                            tunnel: Some(meta),
                        });
                    }
                    Err(err) => {
                        tunnel.close().await;
                        last_err = Some(err);
                    }
                }
            }
            Err(err) => last_err = Some(err),
        }
        if attempt < TUNNEL_ATTEMPTS {
            tokio::time::sleep(TUNNEL_BACKOFF * 2u32.pow(attempt - 1)).await;
        }
    }
    Err(anyhow!(
        "tunnel error: unable to establish healthy direct tunnel for machine {}: {:#}",
        m.name,
        last_err.expect("at least one attempt ran")
    ))
}

/// Probe `/health` and report how long it took.
pub async fn check_health(client: &ExecClient) -> (Duration, Result<()>) {
    let start = std::time::Instant::now();
    let outcome = match tokio::time::timeout(HEALTH_PROBE_TIMEOUT, client.health()).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(anyhow!("health probe timeout")),
    };
    (start.elapsed(), outcome)
}

/// Emit one structured tunnel event as a JSON line on stderr. This is the
/// contract watchers of the CLI rely on; keep it one object per line.
pub fn log_tunnel_event(event: &str, fields: serde_json::Value) {
    let mut obj = match fields {
        serde_json::Value::Object(map) => map,
        other => {
            let mut map = serde_json::Map::new();
            map.insert("detail".to_string(), other);
            map
        }
    };
    obj.insert("event".to_string(), event.into());
    obj.insert("mode".to_string(), "direct_addr_tunnel".into());
    eprintln!("{}", serde_json::Value::Object(obj));
}
