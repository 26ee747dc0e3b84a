//! Resume point of the next poll, re-derived from the sink on every cycle.

use crate::db::influx::{PointSink, SinkError};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use log::debug;

/// Offset added to a stored watermark so the stored instant is not fetched again.
pub const RESUME_OFFSET: Duration = Duration::seconds(1);

/// Stand-in for "no data stored yet"; never written anywhere.
pub fn sentinel() -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(2199, 12, 31)
        .unwrap_or(NaiveDate::MAX)
        .and_time(NaiveTime::MIN)
        .and_utc()
}

/// Earliest "last stored point" across a set of series, or the sentinel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Watermark(pub DateTime<Utc>);

impl Watermark {
    pub fn is_sentinel(&self) -> bool {
        self.0 == sentinel()
    }

    /// Start of the next fetch: one second past the watermark, or
    /// `first_run_start` when nothing has been stored yet.
    pub fn resume_at(&self, first_run_start: DateTime<Utc>) -> DateTime<Utc> {
        if self.is_sentinel() {
            first_run_start
        } else {
            self.0 + RESUME_OFFSET
        }
    }
}

/// Flux query returning the last point of every series of `measurements`
/// written within `lookback`.
pub fn last_points_query(bucket: &str, measurements: &[&str], lookback: Duration) -> String {
    let mut flux = format!(
        "from(bucket: \"{}\")\n  |> range(start: -{}s)",
        flux_escape(bucket),
        lookback.num_seconds().max(1)
    );
    if !measurements.is_empty() {
        let predicate = measurements
            .iter()
            .map(|m| format!("r._measurement == \"{}\"", flux_escape(m)))
            .collect::<Vec<_>>()
            .join(" or ");
        flux.push_str(&format!("\n  |> filter(fn: (r) => {})", predicate));
    }
    flux.push_str("\n  |> last()");
    flux
}

fn flux_escape(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Resolve the watermark for `measurements`.
///
/// Taking the minimum makes a lagging series pull the resume point back, so
/// no series skips data when they have drifted apart.
pub fn resolve(
    sink: &dyn PointSink,
    bucket: &str,
    measurements: &[&str],
    lookback: Duration,
) -> Result<Watermark, SinkError> {
    let flux = last_points_query(bucket, measurements, lookback);
    let times = sink.query_times(&flux)?;
    let watermark = Watermark(times.into_iter().fold(sentinel(), |acc, t| acc.min(t)));
    debug!(
        "Watermark for {}: {}",
        measurements.join("/"),
        if watermark.is_sentinel() {
            "none stored".to_string()
        } else {
            watermark.0.to_rfc3339()
        }
    );
    Ok(watermark)
}
