//! Timestamp formatting shared by the daemon and the CLI.

use chrono::{SecondsFormat, Utc};

/// Current time as an RFC3339 UTC timestamp with nanosecond precision,
/// the format used in `meta.json` and all API responses.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    #[test]
    fn test_now_rfc3339_parses_back() {
        let s = now_rfc3339();
        assert!(s.ends_with('Z'), "expected UTC designator, got {s}");
        DateTime::parse_from_rfc3339(&s).unwrap();
    }
}
