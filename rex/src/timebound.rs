//! `--since` / `--until` normalization: RFC3339 timestamps pass through,
//! relative durations like `10m` become `now - d`, both rendered as
//! RFC3339-nanosecond UTC.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimeBoundError {
    #[error("must be RFC3339 or duration like 10m/2h")]
    Invalid,
}

pub fn normalize_time_bound(v: &str) -> Result<String, TimeBoundError> {
    let v = v.trim();
    if v.is_empty() {
        return Ok(String::new());
    }
    if let Ok(t) = DateTime::parse_from_rfc3339(v) {
        return Ok(t
            .with_timezone(&Utc)
            .to_rfc3339_opts(SecondsFormat::Nanos, true));
    }
    let d = parse_duration(v).ok_or(TimeBoundError::Invalid)?;
    let bound = Utc::now() - chrono::Duration::from_std(d).map_err(|_| TimeBoundError::Invalid)?;
    Ok(bound.to_rfc3339_opts(SecondsFormat::Nanos, true))
}

/// Parse compound durations like `1h30m` or `250ms`. Units: ns, us, ms,
/// s, m, h.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let mut total = Duration::ZERO;
    let mut rest = s;
    if rest.is_empty() {
        return None;
    }
    while !rest.is_empty() {
        let digits_end = rest.find(|c: char| !c.is_ascii_digit())?;
        if digits_end == 0 {
            return None;
        }
        let value: u64 = rest[..digits_end].parse().ok()?;
        rest = &rest[digits_end..];
        let (unit, consumed) = match rest.as_bytes() {
            [b'n', b's', ..] => (Duration::from_nanos(1), 2),
            [b'u', b's', ..] => (Duration::from_micros(1), 2),
            [b'm', b's', ..] => (Duration::from_millis(1), 2),
            [b'm', ..] => (Duration::from_secs(60), 1),
            [b's', ..] => (Duration::from_secs(1), 1),
            [b'h', ..] => (Duration::from_secs(3600), 1),
            _ => return None,
        };
        rest = &rest[consumed..];
        total = total.checked_add(unit.checked_mul(value as u32)?)?;
    }
    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_passes_through() {
        assert_eq!(normalize_time_bound("").unwrap(), "");
        assert_eq!(normalize_time_bound("   ").unwrap(), "");
    }

    #[test]
    fn test_rfc3339_is_normalized_to_utc_nanos() {
        let out = normalize_time_bound("2025-06-01T12:00:00+02:00").unwrap();
        assert_eq!(out, "2025-06-01T10:00:00.000000000Z");
    }

    #[test]
    fn test_relative_duration_is_before_now() {
        let out = normalize_time_bound("10m").unwrap();
        let t = DateTime::parse_from_rfc3339(&out).unwrap().with_timezone(&Utc);
        let delta = Utc::now() - t;
        assert!(delta >= chrono::Duration::minutes(10));
        assert!(delta < chrono::Duration::minutes(11));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10m"), Some(Duration::from_secs(600)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(
            parse_duration("1h30m"),
            Some(Duration::from_secs(5400))
        );
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("1s"), Some(Duration::from_secs(1)));
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("10"), None);
        assert_eq!(parse_duration("m10"), None);
        assert_eq!(parse_duration("10x"), None);
    }

    #[test]
    fn test_garbage_rejected() {
        assert_eq!(
            normalize_time_bound("yesterday"),
            Err(TimeBoundError::Invalid)
        );
    }
}
