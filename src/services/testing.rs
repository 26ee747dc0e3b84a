//! In-memory stand-ins for the provider and the sink, shared by service tests.

use crate::client::{MonitoringApi, SolarEdgeError};
use crate::config::Config;
use crate::db::influx::{PointSink, SinkError, WriteMode, WriteReport};
use crate::db::models::Point;
use crate::models::solaredge::{PowerDetails, SiteId};
use crate::services::backfill::FetchWindow;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::BTreeMap;

/// Provider answering from closures and recording every requested window.
pub struct FakeApi {
    pub power_calls: RefCell<Vec<FetchWindow>>,
    pub storage_calls: RefCell<Vec<FetchWindow>>,
    power: Box<dyn Fn(&FetchWindow) -> Result<PowerDetails, SolarEdgeError>>,
    storage: Box<dyn Fn(&FetchWindow) -> Result<Vec<Value>, SolarEdgeError>>,
}

impl FakeApi {
    pub fn new(
        power: impl Fn(&FetchWindow) -> Result<PowerDetails, SolarEdgeError> + 'static,
        storage: impl Fn(&FetchWindow) -> Result<Vec<Value>, SolarEdgeError> + 'static,
    ) -> Self {
        FakeApi {
            power_calls: RefCell::new(Vec::new()),
            storage_calls: RefCell::new(Vec::new()),
            power: Box::new(power),
            storage: Box::new(storage),
        }
    }

    /// Provider with no data at all.
    pub fn empty() -> Self {
        FakeApi::new(
            |_| {
                Ok(PowerDetails {
                    unit: "W".to_string(),
                    meters: Vec::new(),
                })
            },
            |_| Ok(Vec::new()),
        )
    }
}

impl MonitoringApi for FakeApi {
    fn power_details(&self, window: &FetchWindow) -> Result<PowerDetails, SolarEdgeError> {
        self.power_calls.borrow_mut().push(*window);
        (self.power)(window)
    }

    fn storage_data(&self, window: &FetchWindow) -> Result<Vec<Value>, SolarEdgeError> {
        self.storage_calls.borrow_mut().push(*window);
        (self.storage)(window)
    }
}

/// Sink keeping the latest fields per (bucket, series, timestamp), like the
/// real store does, and answering watermark queries from what it holds.
#[derive(Default)]
pub struct MemorySink {
    pub rows: RefCell<BTreeMap<(String, String, DateTime<Utc>), BTreeMap<String, f64>>>,
    pub measurements: RefCell<BTreeMap<String, String>>,
    pub writes: RefCell<Vec<WriteMode>>,
    /// Every point in the order it was written.
    pub log: RefCell<Vec<Point>>,
    pub resets: RefCell<Vec<String>>,
    pub fail_queries: bool,
}

impl MemorySink {
    pub fn len(&self) -> usize {
        self.rows.borrow().len()
    }

    pub fn last_per_series(&self, measurements: &[&str]) -> Vec<DateTime<Utc>> {
        let names = self.measurements.borrow();
        let mut last: BTreeMap<String, DateTime<Utc>> = BTreeMap::new();
        for (_, series, ts) in self.rows.borrow().keys() {
            let measurement = names.get(series).map(String::as_str).unwrap_or("");
            if measurements.is_empty() || measurements.contains(&measurement) {
                let entry = last.entry(series.clone()).or_insert(*ts);
                if *ts > *entry {
                    *entry = *ts;
                }
            }
        }
        last.into_values().collect()
    }
}

impl PointSink for MemorySink {
    fn write(&self, bucket: &str, points: &[Point], mode: WriteMode) -> WriteReport {
        self.writes.borrow_mut().push(mode);
        self.log.borrow_mut().extend(points.iter().cloned());
        let mut rows = self.rows.borrow_mut();
        for p in points {
            let key = p.series_key();
            self.measurements
                .borrow_mut()
                .insert(key.clone(), p.measurement.clone());
            rows.entry((bucket.to_string(), key, p.timestamp))
                .or_default()
                .extend(p.fields.iter().map(|(k, v)| (k.clone(), *v)));
        }
        WriteReport {
            written: points.len(),
            failed: 0,
        }
    }

    fn flush(&self) -> WriteReport {
        WriteReport::default()
    }

    fn query_times(&self, flux: &str) -> Result<Vec<DateTime<Utc>>, SinkError> {
        if self.fail_queries {
            return Err(SinkError::Transport("connection refused".to_string()));
        }
        let wanted: Vec<&str> = flux
            .split("r._measurement == \"")
            .skip(1)
            .filter_map(|rest| rest.split('"').next())
            .collect();
        Ok(self.last_per_series(&wanted))
    }

    fn reset_bucket(&self, bucket: &str) -> Result<(), SinkError> {
        self.resets.borrow_mut().push(bucket.to_string());
        self.rows.borrow_mut().retain(|(b, _, _), _| b != bucket);
        Ok(())
    }
}

fn fixture(path: &str) -> Value {
    let body = std::fs::read_to_string(path).expect("fixture present");
    serde_json::from_str(&body).expect("fixture is valid JSON")
}

/// `powerDetails` of `tests/data/power-details.json`.
pub fn power_fixture() -> PowerDetails {
    let v = fixture("tests/data/power-details.json");
    PowerDetails {
        unit: v["powerDetails"]["unit"].as_str().unwrap_or_default().to_string(),
        meters: v["powerDetails"]["meters"].as_array().cloned().unwrap_or_default(),
    }
}

/// `storageData.batteries` of `tests/data/storage-data.json`.
pub fn storage_fixture() -> Vec<Value> {
    let v = fixture("tests/data/storage-data.json");
    v["storageData"]["batteries"].as_array().cloned().unwrap_or_default()
}

pub fn test_config(timezone: Tz, installation_date: NaiveDate) -> Config {
    Config {
        site_id: SiteId("4242".to_string()),
        api_key: "secret".to_string(),
        solaredge_base_url: "http://127.0.0.1:9".to_string(),
        influx_url: "http://127.0.0.1:9".to_string(),
        influx_token: "tok".to_string(),
        influx_org: "home".to_string(),
        influx_bucket: "solar".to_string(),
        timezone,
        installation_date,
        watermark_lookback: Duration::weeks(2),
        http_timeout: std::time::Duration::from_secs(5),
    }
}
