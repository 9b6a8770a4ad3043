//! Bounded-exponential retry over transient transport errors.

use std::future::Future;
use std::time::Duration;

use anyhow::{anyhow, Result};

const BASE_BACKOFF: Duration = Duration::from_millis(200);

const TRANSIENT_PATTERNS: &[&str] = &[
    "connection reset by peer",
    "connection refused",
    "broken pipe",
    "eof",
    "timeout",
    "file already closed",
];

/// Whether an error looks like a transport hiccup worth retrying: a
/// connect/timeout failure from the HTTP stack, or one of the well-known
/// message fragments anywhere in the chain.
pub fn is_transient_error(err: &anyhow::Error) -> bool {
    for cause in err.chain() {
        if let Some(re) = cause.downcast_ref::<reqwest::Error>() {
            if re.is_timeout() || re.is_connect() {
                return true;
            }
        }
    }
    let msg = format!("{err:#}").to_lowercase();
    TRANSIENT_PATTERNS.iter().any(|p| msg.contains(p))
}

/// Run `f` up to `max_attempts` times, backing off `200ms * 2^(n-1)`
/// between attempts. Non-transient errors stop the loop immediately.
pub async fn with_retry<T, F, Fut>(max_attempts: u32, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = max_attempts.max(1);
    let mut last: Option<anyhow::Error> = None;
    for attempt in 1..=max_attempts {
        match f().await {
            Ok(v) => return Ok(v),
            Err(err) => {
                let transient = is_transient_error(&err);
                last = Some(err);
                if !transient || attempt == max_attempts {
                    break;
                }
                tokio::time::sleep(BASE_BACKOFF * 2u32.pow(attempt - 1)).await;
            }
        }
    }
    let cause = last.expect("loop ran at least once");
    Err(anyhow!(
        "request failed after {max_attempts} attempts: {cause:#}"
    ))
}
