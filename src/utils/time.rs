use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};

/// Drop the sub-second part so timestamps from sources with and without
/// fractional seconds compare equal.
pub fn normalize(timestamp: DateTime<Utc>) -> DateTime<Utc> {
    timestamp.trunc_subsecs(0)
}

/// Ledger text form: `YYYY-MM-DDTHH:MM:SSZ`. Fixed width, so string order is
/// chronological order inside SQLite.
pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    normalize(timestamp).to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(value).map(|parsed| normalize(parsed.with_timezone(&Utc)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_discards_milliseconds() {
        let parsed = parse_timestamp("2024-01-05T10:20:30.456Z").unwrap();
        assert_eq!(format_timestamp(parsed), "2024-01-05T10:20:30Z");
    }

    #[test]
    fn test_fractional_and_whole_seconds_compare_equal() {
        let with_millis = parse_timestamp("2024-01-05T10:20:30.999Z").unwrap();
        let without = parse_timestamp("2024-01-05T10:20:30Z").unwrap();
        assert_eq!(with_millis, without);
    }

    #[test]
    fn test_offsets_are_converted_to_utc() {
        let parsed = parse_timestamp("2024-01-05T12:00:00+02:00").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 1, 5, 10, 0, 0).unwrap());
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(parse_timestamp("yesterday").is_err());
    }
}
