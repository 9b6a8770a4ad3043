//! Log watching: rebuild a monotonic line stream out of stateless tail
//! snapshots, and drive an execution to its summary.
//!
//! Each poll fetches the latest NDJSON tail of a stream. Consecutive
//! snapshots overlap whenever the window still covers the last emitted
//! line; the reconstructor finds the maximal suffix/prefix overlap and
//! emits only the new part. If the overlap falls off the window (huge burst
//! of output between polls) lines may repeat or drop; that is the accepted
//! failure mode of a stateless tail.

use std::io::Write;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rex_common::protocol::{ExecStatus, WatchEvent};

use crate::client::{ExecClient, ExecLogsOptions};
use crate::retry::{is_transient_error, with_retry};

/// Per-stream reconstruction state: the previous ordered snapshot.
#[derive(Debug, Default)]
pub struct StreamDelta {
    prev: Vec<String>,
}

impl StreamDelta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next snapshot; returns only the lines not already emitted.
    pub fn advance(&mut self, curr: Vec<String>) -> Vec<String> {
        let emitted = delta_lines(&self.prev, &curr);
        self.prev = curr;
        emitted
    }
}

fn delta_lines(prev: &[String], curr: &[String]) -> Vec<String> {
    if prev.is_empty() {
        return curr.to_vec();
    }
    let max = prev.len().min(curr.len());
    let mut overlap = 0;
    for k in (1..=max).rev() {
        if prev[prev.len() - k..] == curr[..k] {
            overlap = k;
            break;
        }
    }
    curr[overlap..].to_vec()
}

/// Extract the `line` fields of `type == "log"` events from an NDJSON body.
/// Unparseable lines are skipped; the server may be mid-write.
pub fn parse_log_lines(raw: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(raw);
    let mut out = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(obj) = serde_json::from_str::<serde_json::Value>(line) else {
            continue;
        };
        if obj["type"] != "log" {
            continue;
        }
        if let Some(s) = obj["line"].as_str() {
            out.push(s.to_string());
        }
    }
    out
}

pub struct WatchOptions {
    /// Streams to follow, in emit order.
    pub streams: Vec<String>,
    pub poll: Duration,
    /// Tail window in bytes fetched each poll.
    pub tail_bytes: i64,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            streams: vec!["stdout".to_string(), "stderr".to_string()],
            poll: Duration::from_secs(1),
            tail_bytes: 2000,
        }
    }
}

/// Poll logs and metadata until the execution finishes; emit NDJSON events
/// to `out` and return the remote exit code.
pub async fn watch_exec<W: Write>(
    client: &ExecClient,
    exec_id: &str,
    opts: &WatchOptions,
    out: &mut W,
) -> Result<i32> {
    let started = std::time::Instant::now();
    let mut deltas: Vec<StreamDelta> = opts.streams.iter().map(|_| StreamDelta::new()).collect();
    let meta;

    loop {
        for (stream, delta) in opts.streams.iter().zip(deltas.iter_mut()) {
            let lines = match fetch_log_lines(client, exec_id, stream, opts.tail_bytes).await {
                Ok(lines) => lines,
                // Transient trouble: skip the stream this cycle.
                Err(err) if is_transient_error(&err) => continue,
                Err(err) => return Err(err),
            };
            for line in delta.advance(lines) {
                let event = WatchEvent::Log {
                    stream: stream.clone(),
                    line,
                };
                writeln!(out, "{}", serde_json::to_string(&event)?)?;
            }
        }

        match fetch_exec_meta(client, exec_id).await {
            Ok(m) => {
                if m["status"] == "finished" {
                    meta = m;
                    break;
                }
            }
            Err(err) if is_transient_error(&err) => {}
            Err(err) => return Err(err),
        }
        tokio::time::sleep(opts.poll).await;
    }

    let exit_code = meta["exit_code"].as_i64().unwrap_or(0) as i32;
    let summary = WatchEvent::Summary {
        exec_id: exec_id.to_string(),
        status: ExecStatus::Finished,
        exit_code,
        duration_ms: started.elapsed().as_millis() as u64,
        stdout_log_path: format!("exec/{exec_id}/stdout.log"),
        stderr_log_path: format!("exec/{exec_id}/stderr.log"),
        artifacts: meta.get("artifacts").cloned(),
    };
    writeln!(out, "{}", serde_json::to_string(&summary)?)?;
    Ok(exit_code)
}

async fn fetch_log_lines(
    client: &ExecClient,
    exec_id: &str,
    stream: &str,
    tail_bytes: i64,
) -> Result<Vec<String>> {
    let raw = with_retry(3, || {
        let opts = ExecLogsOptions {
            stream: Some(stream.to_string()),
            tail_bytes: Some(tail_bytes),
            format: Some("jsonl".to_string()),
            ..ExecLogsOptions::default()
        };
        async move { client.exec_logs(exec_id, &opts).await }
    })
    .await?;
    Ok(parse_log_lines(&raw))
}

async fn fetch_exec_meta(client: &ExecClient, exec_id: &str) -> Result<serde_json::Value> {
    with_retry(3, || async move { client.exec_get(exec_id).await })
        .await
        .context("failed to fetch exec record")
}

/// Validate a `--stream` argument into the list of streams to follow.
pub fn streams_for(arg: &str) -> Result<Vec<String>> {
    match arg {
        "both" => Ok(vec!["stdout".to_string(), "stderr".to_string()]),
        "stdout" | "stderr" => Ok(vec![arg.to_string()]),
        other => bail!("--stream must be stdout|stderr|both, got {other:?}"),
    }
}
