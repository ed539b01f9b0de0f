use chrono::{DateTime, NaiveDate, Utc};

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn to_date(ms: i64) -> DateTime<Utc> {
    // from_timestamp_millis returns Option<DateTime<Utc>>
    DateTime::<Utc>::from_timestamp_millis(ms)
        .unwrap_or_else(|| DateTime::<Utc>::from_timestamp_millis(0).unwrap())
}

/// Today's date in UTC. Term resolution takes the date as a parameter so
/// tests stay deterministic; this is the production default.
pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

/// Parses an ISO `YYYY-MM-DD` date as used by OSM term and member payloads.
pub fn parse_iso_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ms_is_reasonable() {
        let a = now_ms();
        assert!(a > 1_500_000_000_000); // after 2017
        assert!(a < 4_100_000_000_000); // before year ~2100
    }

    #[test]
    fn to_date_epoch() {
        let d = to_date(0);
        assert_eq!(d.timestamp_millis(), 0);
    }

    #[test]
    fn parses_iso_dates_and_rejects_garbage() {
        assert_eq!(
            parse_iso_date("2025-10-15"),
            NaiveDate::from_ymd_opt(2025, 10, 15)
        );
        assert_eq!(
            parse_iso_date(" 2025-01-02 "),
            NaiveDate::from_ymd_opt(2025, 1, 2)
        );
        assert_eq!(parse_iso_date("15/10/2025"), None);
        assert_eq!(parse_iso_date(""), None);
    }
}
