use crate::db::influx::{PointSink, WRITE_BATCH_SIZE, WriteMode, WriteReport};
use crate::db::models::{Point, names};
use crate::services::backfill::ChunkedFetch;
use crate::services::normalize::Normalized;
use chrono_tz::Tz;
use log::info;

/// Outcome of one fetch → normalize → write pass over a time range.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestReport {
    pub requests: usize,
    pub failed_windows: usize,
    pub rejected: usize,
    pub stored: WriteReport,
}

/// Normalize what `fetched` returned and hand the points to the sink.
pub fn ingest<T>(
    fetched: &ChunkedFetch<T>,
    normalize: impl FnOnce(&[T]) -> Normalized,
    sink: &dyn PointSink,
    bucket: &str,
    mode: WriteMode,
    echo: Option<Tz>,
) -> IngestReport {
    let normalized = normalize(&fetched.items);
    IngestReport {
        requests: fetched.requests,
        failed_windows: fetched.failures.len(),
        rejected: normalized.rejections.len(),
        stored: store_points(sink, bucket, &normalized.points, mode, echo),
    }
}

/// Write `points` to `bucket`, optionally echoing one progress line per stored
/// point to stdout.
///
/// Points go to the sink one batch at a time so that only batches the sink took
/// are echoed.
pub fn store_points(
    sink: &dyn PointSink,
    bucket: &str,
    points: &[Point],
    mode: WriteMode,
    echo: Option<Tz>,
) -> WriteReport {
    let mut report = WriteReport::default();
    for batch in points.chunks(WRITE_BATCH_SIZE) {
        let stored = sink.write(bucket, batch, mode);
        if let Some(tz) = echo {
            for line in accepted_lines(batch, &stored, tz) {
                println!("{}", line);
            }
        }
        report.written += stored.written;
        report.failed += stored.failed;
    }

    if !points.is_empty() {
        info!(
            "Stored {} point(s) in {} ({} failed, {:?})",
            report.written, bucket, report.failed, mode
        );
    }
    report
}

/// Progress lines for the points of one batch that the sink wrote or queued.
///
/// A batch fits a single request, so either all of its valid points went
/// through or none did. Points without a line-protocol form never do.
fn accepted_lines(batch: &[Point], stored: &WriteReport, tz: Tz) -> Vec<String> {
    if stored.written == 0 {
        return Vec::new();
    }
    batch
        .iter()
        .filter(|p| p.to_line_protocol().is_ok())
        .map(|p| progress_line(p, tz))
        .collect()
}

/// One human-readable line per point, in site time.
pub fn progress_line(point: &Point, tz: Tz) -> String {
    let ts = point.timestamp.with_timezone(&tz).format("%Y-%m-%d %H:%M:%S");
    let power = point.fields.get(names::FIELD_POWER);
    let watts = point.fields.get(names::FIELD_WATTS);
    let pct = point.fields.get(names::FIELD_PCT);

    match (power, watts, pct) {
        (Some(power), _, _) => format!(
            "{} {:.0} {} {}",
            ts,
            power,
            point.tags.get(names::TAG_UNIT).map(String::as_str).unwrap_or("?"),
            point.measurement
        ),
        (None, Some(watts), Some(pct)) => format!(
            "{} {:.0} W; {:.0} % {}",
            ts,
            watts,
            pct,
            point.tags.get(names::TAG_BATTERY).map(String::as_str).unwrap_or("")
        ),
        _ => format!("{} {}", ts, point.series_key()),
    }
}
