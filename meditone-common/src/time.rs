//! Timestamp utilities

use chrono::{DateTime, Utc};

/// Current time as Unix milliseconds (queue scheduling clock)
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Format a timestamp as `ddmmyyyy`, the date tag used in artifact names
pub fn date_tag(timestamp: &DateTime<Utc>) -> String {
    timestamp.format("%d%m%Y").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_now_millis_is_recent() {
        let millis = now_millis();
        assert!(millis > 946_684_800_000); // 2000-01-01
        assert!((millis / 1000 - Utc::now().timestamp()).abs() <= 1);
    }

    #[test]
    fn test_date_tag_format() {
        let ts = Utc.with_ymd_and_hms(2025, 8, 3, 14, 30, 0).unwrap();
        assert_eq!(date_tag(&ts), "03082025");
    }
}
