use crate::client::MonitoringApi;
use crate::config::Config;
use crate::db::influx::{PointSink, WriteMode};
use crate::db::models::names;
use crate::services::backfill::{self, POWER_DETAILS_POLL_CHUNK, STORAGE_CHUNK};
use crate::services::ingest::{self, IngestReport};
use crate::services::{normalize, watermark};
use chrono::{DateTime, TimeZone, Utc};
use log::{error, info};
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::time::Duration;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub battery: IngestReport,
    pub power: IngestReport,
}

/// One poll: battery first, then power details, each resuming from its own
/// watermark and fetching up to `now`.
///
/// The two parts are independent; a part that cannot resolve its watermark is
/// reported in the error while the other still runs.
pub fn run_cycle(
    api: &dyn MonitoringApi,
    sink: &dyn PointSink,
    cfg: &Config,
    now: DateTime<Utc>,
) -> Result<CycleReport, String> {
    let battery = poll_battery(api, sink, cfg, now);
    let power = poll_power_details(api, sink, cfg, now);

    match (battery, power) {
        (Ok(battery), Ok(power)) => Ok(CycleReport { battery, power }),
        (battery, power) => Err([battery.err(), power.err()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join("; ")),
    }
}

fn poll_battery(
    api: &dyn MonitoringApi,
    sink: &dyn PointSink,
    cfg: &Config,
    now: DateTime<Utc>,
) -> Result<IngestReport, String> {
    let wm = watermark::resolve(sink, &cfg.influx_bucket, &[names::BATTERY], cfg.watermark_lookback)
        .map_err(|e| format!("battery watermark query failed: {}", e))?;
    let start = wm.resume_at(cfg.installation_start());

    let fetched = backfill::fetch_storage_data(api, start, now, STORAGE_CHUNK);
    Ok(ingest::ingest(
        &fetched,
        |items| normalize::battery_points(items, cfg.timezone),
        sink,
        &cfg.influx_bucket,
        WriteMode::WaitForAck,
        Some(cfg.timezone),
    ))
}

fn poll_power_details(
    api: &dyn MonitoringApi,
    sink: &dyn PointSink,
    cfg: &Config,
    now: DateTime<Utc>,
) -> Result<IngestReport, String> {
    let wm = watermark::resolve(
        sink,
        &cfg.influx_bucket,
        &[names::PRODUCTION, names::CONSUMPTION],
        cfg.watermark_lookback,
    )
    .map_err(|e| format!("power details watermark query failed: {}", e))?;
    let start = wm.resume_at(cfg.installation_start());

    let fetched = backfill::fetch_power_details(api, start, now, POWER_DETAILS_POLL_CHUNK);
    let mut report = ingest::ingest(
        &fetched,
        |items| normalize::power_details_points(items, cfg.timezone),
        sink,
        &cfg.influx_bucket,
        WriteMode::FireAndForget,
        Some(cfg.timezone),
    );

    // Queued batches must land before the next cycle reads the watermark.
    let flushed = sink.flush();
    report.stored.failed += flushed.failed;
    Ok(report)
}

/// `*/N` minute grid, aligned to the top of the hour.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Schedule {
    period_secs: i64,
}

impl Schedule {
    /// `minutes` has to divide the hour evenly and leave at least two slots.
    pub fn every_minutes(minutes: u32) -> Result<Self, String> {
        if !(1..=30).contains(&minutes) || 60 % minutes != 0 {
            return Err(format!(
                "--mins must divide 60 and lie between 1 and 30, got {}",
                minutes
            ));
        }
        Ok(Schedule {
            period_secs: i64::from(minutes) * 60,
        })
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs.unsigned_abs())
    }

    /// First grid instant strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let slot = now.timestamp().div_euclid(self.period_secs) + 1;
        Utc.timestamp_opt(slot * self.period_secs, 0)
            .single()
            .unwrap_or(now + chrono::Duration::seconds(self.period_secs))
    }
}

/// Poll right away, then on `schedule` until `shutdown` fires.
///
/// Without a schedule this is a single poll whose failure is returned. A
/// shutdown requested while the first cycle runs is honoured as soon as it ends.
pub fn run_polling(
    api: &dyn MonitoringApi,
    sink: &dyn PointSink,
    cfg: &Config,
    schedule: Option<Schedule>,
    shutdown: &Receiver<()>,
) -> Result<(), String> {
    let first = run_cycle(api, sink, cfg, Utc::now());
    let Some(schedule) = schedule else {
        let report = first.map_err(|e| format!("Poll cycle failed: {}", e))?;
        log_cycle(&report);
        return Ok(());
    };
    match first {
        Ok(report) => log_cycle(&report),
        Err(e) => error!("Poll cycle failed: {}", e),
    }

    match shutdown.try_recv() {
        Err(TryRecvError::Empty) => {}
        Ok(()) | Err(TryRecvError::Disconnected) => {
            info!("Shutting down after the first poll");
            return Ok(());
        }
    }

    info!("Polling every {} minute(s)", schedule.period().as_secs() / 60);
    run_loop(api, sink, cfg, schedule, shutdown);
    Ok(())
}

/// Run cycles on `schedule` until `shutdown` fires or its sender goes away.
///
/// Cycles never overlap; a cycle in progress finishes before shutdown is seen.
pub fn run_loop(
    api: &dyn MonitoringApi,
    sink: &dyn PointSink,
    cfg: &Config,
    schedule: Schedule,
    shutdown: &Receiver<()>,
) {
    loop {
        let now = Utc::now();
        let next = schedule.next_after(now);
        info!("Next poll at {}", next.with_timezone(&cfg.timezone).format("%Y-%m-%d %H:%M:%S"));

        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        match shutdown.recv_timeout(wait) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                info!("Shutting down poll loop");
                return;
            }
        }

        match run_cycle(api, sink, cfg, Utc::now()) {
            Ok(report) => log_cycle(&report),
            Err(e) => error!("Poll cycle failed: {}", e),
        }
    }
}

pub fn log_cycle(report: &CycleReport) {
    info!(
        "Poll cycle done: battery {} stored/{} failed, power {} stored/{} failed ({} failed window(s), {} rejected entries)",
        report.battery.stored.written,
        report.battery.stored.failed,
        report.power.stored.written,
        report.power.stored.failed,
        report.battery.failed_windows + report.power.failed_windows,
        report.battery.rejected + report.power.rejected
    );
}
