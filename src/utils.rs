use chrono::{DateTime, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use core::fmt;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Wall-clock timestamp format used by the monitoring API, in both directions.
pub const PROVIDER_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const PROVIDER_DATE_FORMAT: &str = "%Y-%m-%d";

/// Errors that can occur while interpreting a provider timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimestampError {
    /// The text does not match `YYYY-MM-DD HH:MM:SS`
    Unparseable(String),
    /// The wall-clock time falls into a DST gap of the site timezone
    Nonexistent(String),
}

impl Display for TimestampError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TimestampError::Unparseable(s) => write!(f, "unparseable timestamp \"{}\"", s),
            TimestampError::Nonexistent(s) => write!(f, "timestamp \"{}\" does not exist in site timezone", s),
        }
    }
}

impl Error for TimestampError {}

/// Interpret a provider wall-clock timestamp in the site timezone.
///
/// Ambiguous instants (the repeated hour when DST ends) resolve to the earlier one.
pub fn parse_provider_time(raw: &str, tz: Tz) -> Result<DateTime<Utc>, TimestampError> {
    let naive = NaiveDateTime::parse_from_str(raw.trim(), PROVIDER_DATETIME_FORMAT)
        .map_err(|_| TimestampError::Unparseable(raw.to_string()))?;
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(t) => Ok(t.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Ok(earliest.with_timezone(&Utc)),
        LocalResult::None => Err(TimestampError::Nonexistent(raw.to_string())),
    }
}

pub fn format_provider_time(ts: DateTime<Utc>, tz: Tz) -> String {
    ts.with_timezone(&tz).format(PROVIDER_DATETIME_FORMAT).to_string()
}

pub fn format_provider_date(date: NaiveDate) -> String {
    date.format(PROVIDER_DATE_FORMAT).to_string()
}

/// First instant of `date` in the site timezone.
pub fn local_midnight(date: NaiveDate, tz: Tz) -> DateTime<Utc> {
    let naive = date.and_time(NaiveTime::MIN);
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(t) | LocalResult::Ambiguous(t, _) => t.with_timezone(&Utc),
        // Midnight skipped by a DST jump; the day starts one hour later.
        LocalResult::None => tz
            .from_local_datetime(&(naive + chrono::Duration::hours(1)))
            .earliest()
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|| naive.and_utc()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Europe::Berlin;

    #[test]
    fn parses_in_site_timezone() {
        let ts = parse_provider_time("2024-01-01 01:00:00", Berlin).unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());

        let utc = parse_provider_time("2024-01-01 00:00:00", chrono_tz::UTC).unwrap();
        assert_eq!(utc, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn dst_edges() {
        // 2024-03-31 02:30 does not exist in Berlin
        assert!(matches!(
            parse_provider_time("2024-03-31 02:30:00", Berlin),
            Err(TimestampError::Nonexistent(_))
        ));
        // 2024-10-27 02:30 happens twice; the first (CEST) wins
        let ts = parse_provider_time("2024-10-27 02:30:00", Berlin).unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 10, 27, 0, 30, 0).unwrap());
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            parse_provider_time("2024-01-01T00:00:00Z", Berlin),
            Err(TimestampError::Unparseable(_))
        ));
    }

    #[test]
    fn formats_round_trip_through_site_time() {
        let ts = Utc.with_ymd_and_hms(2023, 8, 10, 22, 0, 0).unwrap();
        assert_eq!(format_provider_time(ts, Berlin), "2023-08-11 00:00:00");
        assert_eq!(
            format_provider_date(NaiveDate::from_ymd_opt(2023, 8, 10).unwrap()),
            "2023-08-10"
        );
    }

    #[test]
    fn local_midnight_uses_site_offset() {
        let d = NaiveDate::from_ymd_opt(2023, 8, 10).unwrap();
        assert_eq!(local_midnight(d, Berlin), Utc.with_ymd_and_hms(2023, 8, 9, 22, 0, 0).unwrap());
    }
}
