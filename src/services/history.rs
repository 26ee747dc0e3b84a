//! One-time import of everything since the installation date.

use crate::client::MonitoringApi;
use crate::config::Config;
use crate::db::influx::{PointSink, WriteMode};
use crate::services::backfill::{self, ChunkedFetch, POWER_DETAILS_HISTORY_CHUNK, STORAGE_CHUNK};
use crate::services::ingest::{self, IngestReport};
use crate::services::normalize;
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde_json::Value;
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Clone)]
pub struct HistoryOptions {
    /// Drop and recreate the bucket first.
    pub reset_bucket: bool,
    /// Save the raw battery entries to this file.
    pub dump_path: Option<PathBuf>,
    /// Take battery entries from an earlier dump instead of the provider.
    pub load_path: Option<PathBuf>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HistoryReport {
    pub battery: IngestReport,
    pub power: IngestReport,
}

pub fn run(
    api: &dyn MonitoringApi,
    sink: &dyn PointSink,
    cfg: &Config,
    opts: &HistoryOptions,
    now: DateTime<Utc>,
) -> Result<HistoryReport, String> {
    let bucket = cfg.influx_bucket.as_str();
    let start = cfg.installation_start();

    if opts.reset_bucket {
        warn!("Resetting bucket {}; all stored points are dropped", bucket);
        sink.reset_bucket(bucket)
            .map_err(|e| format!("Resetting bucket {} failed: {}", bucket, e))?;
    }

    let batteries = match &opts.load_path {
        Some(path) => {
            let items = load_dump(path)?;
            info!("Loaded {} battery entries from {}", items.len(), path.display());
            ChunkedFetch {
                items,
                ..ChunkedFetch::default()
            }
        }
        None => backfill::fetch_storage_data(api, start, now, STORAGE_CHUNK),
    };
    if let Some(path) = &opts.dump_path {
        let body = serde_json::to_string(&batteries.items)
            .map_err(|e| format!("Serializing battery dump failed: {}", e))?;
        std::fs::write(path, body).map_err(|e| format!("Writing {} failed: {}", path.display(), e))?;
        info!("Wrote {} battery entries to {}", batteries.items.len(), path.display());
    }
    let battery = ingest::ingest(
        &batteries,
        |items| normalize::battery_points(items, cfg.timezone),
        sink,
        bucket,
        WriteMode::WaitForAck,
        None,
    );

    let details = backfill::fetch_power_details(api, start, now, POWER_DETAILS_HISTORY_CHUNK);
    let power = ingest::ingest(
        &details,
        |items| normalize::power_details_points(items, cfg.timezone),
        sink,
        bucket,
        WriteMode::WaitForAck,
        None,
    );

    info!(
        "History import done: {} battery and {} power point(s) stored, {} failed window(s)",
        battery.stored.written,
        power.stored.written,
        battery.failed_windows + power.failed_windows
    );
    Ok(HistoryReport { battery, power })
}

fn load_dump(path: &Path) -> Result<Vec<Value>, String> {
    let body = std::fs::read_to_string(path).map_err(|e| format!("Reading {} failed: {}", path.display(), e))?;
    let de = &mut serde_json::Deserializer::from_str(&body);
    serde_path_to_error::deserialize(de).map_err(|e| {
        format!(
            "{} is not a battery dump: {} at `{}`",
            path.display(),
            e.inner(),
            e.path()
        )
    })
}
