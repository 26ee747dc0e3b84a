pub mod models {
    pub mod solaredge;
}

pub mod client;
pub mod config;
pub mod db {
    pub mod influx;
    pub mod models;
}
pub mod env_file;
pub mod utils;
pub mod services {
    pub mod backfill;
    pub mod history;
    pub mod ingest;
    pub mod normalize;
    pub mod realtime;
    #[cfg(test)]
    pub mod testing;
    pub mod watermark;
}

use crate::client::SolarEdgeClient;
use crate::config::Config;
use crate::db::influx::InfluxClient;
use crate::models::solaredge::TimeUnit;
use crate::services::backfill::FetchWindow;
use crate::services::history::{self, HistoryOptions};
use crate::services::realtime::{self, Schedule};
use chrono::{Duration, Utc};
use clap::{Parser, ValueEnum};
use log::{error, info};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::mpsc;

#[derive(Parser, Debug)]
#[command(name = "solaredge-influx", version, about = "Poll SolarEdge monitoring data into InfluxDB")]
struct Cli {
    /// Poll once, then exit
    #[arg(long)]
    once: bool,

    /// Poll every N minutes, on the hour grid (N must divide 60)
    #[arg(long, value_name = "N", default_value_t = 15)]
    mins: u32,

    /// Import everything since INSTALLATION_DATE, then exit
    #[arg(long, conflicts_with = "once")]
    history: bool,

    /// Drop and recreate the bucket before the import
    #[arg(long, requires = "history")]
    reset_bucket: bool,

    /// Save raw battery data fetched during the import to FILE
    #[arg(long, value_name = "FILE", requires = "history")]
    history_dump: Option<PathBuf>,

    /// Import battery data from an earlier --history-dump FILE instead of the API
    #[arg(long, value_name = "FILE", requires = "history")]
    history_load: Option<PathBuf>,

    /// Print one provider endpoint as JSON, then exit
    #[arg(long, value_enum, value_name = "ENDPOINT", conflicts_with_all = ["once", "history"])]
    show: Option<ShowEndpoint>,

    /// Read settings from PATH instead of ./.env
    #[arg(long, value_name = "PATH")]
    env_file: Option<PathBuf>,
}

#[derive(ValueEnum, Debug, Copy, Clone, PartialEq, Eq)]
enum ShowEndpoint {
    Inventory,
    PowerFlow,
    Equipment,
    Sensors,
    /// Daily energy of the last 30 days
    Energy,
    /// Quarter-hourly meter readings of the last 24 hours
    Meters,
}

fn show(api: &SolarEdgeClient, cfg: &Config, endpoint: ShowEndpoint) -> Result<(), String> {
    let now = Utc::now();
    let value = match endpoint {
        ShowEndpoint::Inventory => api.get_inventory(),
        ShowEndpoint::PowerFlow => api.get_power_flow(),
        ShowEndpoint::Equipment => api.get_equipment_list().map(Value::Array),
        ShowEndpoint::Sensors => api.get_sensors(),
        ShowEndpoint::Energy => {
            let today = now.with_timezone(&cfg.timezone).date_naive();
            api.get_energy(today - Duration::days(30), today, TimeUnit::Day)
        }
        ShowEndpoint::Meters => api.get_meters(
            &FetchWindow {
                start: now - Duration::days(1),
                end: now,
            },
            TimeUnit::QuarterOfAnHour,
        ),
    }
    .map_err(|e| format!("{:?} request failed: {}", endpoint, e))?;

    let pretty = serde_json::to_string_pretty(&value).map_err(|e| format!("Formatting {:?} failed: {}", endpoint, e))?;
    println!("{}", pretty);
    Ok(())
}

fn run(cli: &Cli) -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (site={}, bucket={}, timezone={}, installation_date={}, watermark_lookback={}d, http_timeout={}s)",
        cfg.site_id,
        cfg.influx_bucket,
        cfg.timezone,
        cfg.installation_date,
        cfg.watermark_lookback.num_days(),
        cfg.http_timeout.as_secs()
    );

    // 2) Provider client
    let api = SolarEdgeClient::new(
        &cfg.solaredge_base_url,
        cfg.site_id.clone(),
        &cfg.api_key,
        cfg.timezone,
        cfg.http_timeout,
    );
    if let Some(endpoint) = cli.show {
        return show(&api, &cfg, endpoint);
    }

    // 3) Sink
    let sink = InfluxClient::new(&cfg.influx_url, &cfg.influx_token, &cfg.influx_org, cfg.http_timeout);
    info!("Writing to InfluxDB at {} (org {})", cfg.influx_url, cfg.influx_org);

    // 4) Full history import
    if cli.history {
        let opts = HistoryOptions {
            reset_bucket: cli.reset_bucket,
            dump_path: cli.history_dump.clone(),
            load_path: cli.history_load.clone(),
        };
        history::run(&api, &sink, &cfg, &opts, Utc::now())?;
        return Ok(());
    }

    // 5) Poll right away, then on the grid until Ctrl-C
    let schedule = poll_schedule(cli)?;
    let (stop_tx, stop_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .map_err(|e| format!("Installing Ctrl-C handler failed: {}", e))?;

    realtime::run_polling(&api, &sink, &cfg, schedule, &stop_rx)
}

/// The polling grid, or `None` for a single poll.
fn poll_schedule(cli: &Cli) -> Result<Option<Schedule>, String> {
    if cli.once {
        return Ok(None);
    }
    Schedule::every_minutes(cli.mins).map(Some)
}

fn main() {
    let cli = Cli::parse();

    let loaded_env = match env_file::load(cli.env_file.as_deref()) {
        Ok(info) => info,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(info) = loaded_env.as_ref() {
        let origin = if info.explicit { "CLI-specified" } else { "default" };
        info!("Environment loaded from {} .env file: {}", origin, info.path.display());
    }

    info!(
        "solaredge-influx {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run(&cli) {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
