//! Windowing engine: split a requested range into provider-compliant
//! sub-windows, fetch them one after another and aggregate what came back.

use crate::client::{MonitoringApi, SolarEdgeError};
use crate::models::solaredge::PowerDetails;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use log::{debug, info, warn};
use serde_json::Value;
use std::fmt;

/// Hard ceiling of the power-details endpoint; longer windows get a 403.
pub const POWER_DETAILS_PROVIDER_LIMIT: Duration = Duration::days(31);
/// Chunk used when polling; small enough to bound a lost request.
pub const POWER_DETAILS_POLL_CHUNK: Duration = Duration::weeks(4);
/// Chunk used for the full-history import.
pub const POWER_DETAILS_HISTORY_CHUNK: Duration = Duration::weeks(2);
/// Storage data has no documented limit; a week keeps responses small.
pub const STORAGE_CHUNK: Duration = Duration::weeks(1);

/// Half-open request range `[start, end)`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FetchWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl fmt::Display for FetchWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            self.start.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.end.to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }
}

#[derive(Debug)]
pub struct ChunkFailure {
    pub window: FetchWindow,
    pub error: SolarEdgeError,
}

/// Aggregate of one chunked fetch, in window order.
#[derive(Debug)]
pub struct ChunkedFetch<T> {
    pub items: Vec<T>,
    pub requests: usize,
    pub failures: Vec<ChunkFailure>,
}

impl<T> Default for ChunkedFetch<T> {
    fn default() -> Self {
        ChunkedFetch {
            items: Vec::new(),
            requests: 0,
            failures: Vec::new(),
        }
    }
}

/// Tile `[start, end)` with consecutive windows of at most `max_chunk`.
///
/// Returns nothing when `start >= end` (the normal steady state when polling
/// faster than data arrives) or when `max_chunk` is not positive.
pub fn plan_windows(start: DateTime<Utc>, end: DateTime<Utc>, max_chunk: Duration) -> Vec<FetchWindow> {
    let mut windows = Vec::new();
    if max_chunk <= Duration::zero() {
        warn!("Backfill: refusing to plan windows with non-positive chunk {}", max_chunk);
        return windows;
    }

    let mut cursor = start;
    while cursor < end {
        let next = cursor
            .checked_add_signed(max_chunk)
            .map_or(end, |candidate| candidate.min(end));
        windows.push(FetchWindow { start: cursor, end: next });
        cursor = next;
    }
    windows
}

/// Fetch every window of `[start, end)` sequentially.
///
/// A failed window is logged and skipped; its data is simply absent. The next
/// poll cycle re-requests from the stored watermark, so nothing is retried here.
pub fn fetch_chunked<T, F>(
    label: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    max_chunk: Duration,
    mut fetch: F,
) -> ChunkedFetch<T>
where
    F: FnMut(&FetchWindow) -> Result<Vec<T>, SolarEdgeError>,
{
    let mut out = ChunkedFetch::default();
    let windows = plan_windows(start, end, max_chunk);
    if windows.is_empty() {
        debug!(
            "{}: nothing to fetch for {}",
            label,
            FetchWindow { start, end }
        );
        return out;
    }

    info!(
        "{}: fetching {} in {} window(s)",
        label,
        FetchWindow { start, end },
        windows.len()
    );

    for window in windows {
        out.requests += 1;
        match fetch(&window) {
            Ok(mut chunk) => {
                debug!("{}: {} returned {} item(s)", label, window, chunk.len());
                out.items.append(&mut chunk);
            }
            Err(error) => {
                warn!(
                    "{}: window {} failed ({}), skipping: {}",
                    label,
                    window,
                    error.kind(),
                    error
                );
                out.failures.push(ChunkFailure { window, error });
            }
        }
    }

    out
}

/// Power details for `[start, end)`, one [`PowerDetails`] per successful window.
///
/// `max_chunk` is clamped to the provider ceiling.
pub fn fetch_power_details(
    api: &dyn MonitoringApi,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    max_chunk: Duration,
) -> ChunkedFetch<PowerDetails> {
    let chunk = max_chunk.min(POWER_DETAILS_PROVIDER_LIMIT);
    fetch_chunked("Power details", start, end, chunk, |w| {
        api.power_details(w).map(|d| vec![d])
    })
}

/// Raw battery entries for `[start, end)`, concatenated across windows.
pub fn fetch_storage_data(
    api: &dyn MonitoringApi,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    max_chunk: Duration,
) -> ChunkedFetch<Value> {
    fetch_chunked("Storage data", start, end, max_chunk, |w| api.storage_data(w))
}
