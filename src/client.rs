//! Blocking HTTP client for the SolarEdge monitoring API (read-only subset).
//!
//! - Blocking client using `ureq` (no async).
//! - Authenticates every request with the `api_key` query parameter.
//! - Each `get_*` method unwraps the response envelope and reports a mismatch
//!   as [`SolarEdgeError::Shape`]; callers decide how to degrade (see
//!   [`or_no_data`] and the chunked fetchers in `services::backfill`).
//!
//! Request timestamps are rendered in the site timezone, as the API expects
//! wall-clock times.

use chrono::NaiveDate;
use chrono_tz::Tz;
use log::{debug, warn};
use serde_json::Value;
use std::time::Duration;

use crate::models::solaredge::{ALL_METERS, Meter, PowerDetails, SiteId, TimeUnit};
use crate::services::backfill::FetchWindow;
use crate::utils::{format_provider_date, format_provider_time};

pub const DEFAULT_BASE_URL: &str = "https://monitoringapi.solaredge.com";

/// Upper bound for error bodies copied into [`SolarEdgeError::Http`].
const MAX_ERROR_BODY: usize = 300;

#[derive(Debug)]
pub enum SolarEdgeError {
    /// Connection-level failure (DNS, refused, timeout, broken body)
    Transport(String),
    /// Non-2xx response
    Http { status: u16, message: String },
    /// Body is not valid JSON
    Json(serde_json::Error),
    /// Valid JSON without the expected envelope
    Shape(String),
}

impl SolarEdgeError {
    /// Short stable name of the error kind, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            SolarEdgeError::Transport(_) => "transport",
            SolarEdgeError::Http { .. } => "http",
            SolarEdgeError::Json(_) => "decode",
            SolarEdgeError::Shape(_) => "shape",
        }
    }
}

impl core::fmt::Display for SolarEdgeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SolarEdgeError::Transport(s) => write!(f, "transport error: {}", s),
            SolarEdgeError::Http { status, message } => write!(f, "http {}: {}", status, message),
            SolarEdgeError::Json(e) => write!(f, "json error: {}", e),
            SolarEdgeError::Shape(s) => write!(f, "unexpected response shape: {}", s),
        }
    }
}

impl std::error::Error for SolarEdgeError {}

impl From<serde_json::Error> for SolarEdgeError {
    fn from(value: serde_json::Error) -> Self {
        SolarEdgeError::Json(value)
    }
}

/// The two windowed endpoints the polling and history paths depend on.
pub trait MonitoringApi {
    /// Quarter-hour power per meter type for `window`.
    fn power_details(&self, window: &FetchWindow) -> Result<PowerDetails, SolarEdgeError>;

    /// Raw `storageData.batteries` entries for `window`.
    fn storage_data(&self, window: &FetchWindow) -> Result<Vec<Value>, SolarEdgeError>;
}

/// Degrade a provider failure to "no data", leaving a diagnostic behind.
pub fn or_no_data<T>(endpoint: &str, result: Result<T, SolarEdgeError>) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("SolarEdge {} returned no data ({}): {}", endpoint, e.kind(), e);
            None
        }
    }
}

pub struct SolarEdgeClient {
    agent: ureq::Agent,
    base_url: String,
    site_id: SiteId,
    api_key: String,
    tz: Tz,
}

impl SolarEdgeClient {
    pub fn new(
        base_url: impl Into<String>,
        site_id: SiteId,
        api_key: impl Into<String>,
        tz: Tz,
        timeout: Duration,
    ) -> Self {
        let config = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(timeout))
            .build();
        let base_url: String = base_url.into();

        SolarEdgeClient {
            agent: config.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            site_id,
            api_key: api_key.into(),
            tz,
        }
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn window_params(&self, window: &FetchWindow) -> Vec<(&'static str, String)> {
        vec![
            ("startTime", format_provider_time(window.start, self.tz)),
            ("endTime", format_provider_time(window.end, self.tz)),
        ]
    }

    /// Issue one GET against `path` and parse the body as JSON.
    pub fn query(&self, path: &str, params: &[(&str, String)]) -> Result<Value, SolarEdgeError> {
        let url = self.url(path);
        debug!(
            "SolarEdge GET {} ({})",
            url,
            params
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(", ")
        );

        let mut req = self.agent.get(&url).header("Accept", "application/json");
        for (k, v) in params {
            req = req.query(*k, v);
        }
        req = req.query("api_key", &self.api_key);

        let mut res = req.call().map_err(|e| SolarEdgeError::Transport(e.to_string()))?;
        let status: http::StatusCode = res.status();
        let body = res
            .body_mut()
            .read_to_string()
            .map_err(|e| SolarEdgeError::Transport(e.to_string()))?;

        if !status.is_success() {
            let trimmed = body.trim();
            let message = if trimmed.is_empty() {
                status.canonical_reason().unwrap_or("<no body>").to_string()
            } else {
                trimmed.chars().take(MAX_ERROR_BODY).collect()
            };
            let err = SolarEdgeError::Http {
                status: status.as_u16(),
                message,
            };
            warn!("SolarEdge GET {} failed: {}", path, err);
            return Err(err);
        }

        serde_json::from_str(&body).map_err(|e| {
            warn!("SolarEdge GET {} returned invalid JSON: {}", path, e);
            SolarEdgeError::Json(e)
        })
    }

    /// Site energy aggregated per `time_unit` between two site-local dates.
    pub fn get_energy(&self, start: NaiveDate, end: NaiveDate, time_unit: TimeUnit) -> Result<Value, SolarEdgeError> {
        let params = [
            ("startDate", format_provider_date(start)),
            ("endDate", format_provider_date(end)),
            ("timeUnit", time_unit.as_str().to_string()),
        ];
        let data = self.query(&format!("/site/{}/energy", self.site_id), &params)?;
        unwrap_envelope(data, &["energy"])
    }

    /// Lifetime meter readings per meter.
    pub fn get_meters(&self, window: &FetchWindow, time_unit: TimeUnit) -> Result<Value, SolarEdgeError> {
        let mut params = self.window_params(window);
        params.push(("timeUnit", time_unit.as_str().to_string()));
        let data = self.query(&format!("/site/{}/meters", self.site_id), &params)?;
        unwrap_envelope(data, &["meterEnergyDetails"])
    }

    pub fn get_inventory(&self) -> Result<Value, SolarEdgeError> {
        let data = self.query(&format!("/site/{}/inventory", self.site_id), &[])?;
        unwrap_envelope(data, &["Inventory"])
    }

    pub fn get_power_flow(&self) -> Result<Value, SolarEdgeError> {
        let data = self.query(&format!("/site/{}/currentPowerFlow", self.site_id), &[])?;
        unwrap_envelope(data, &["siteCurrentPowerFlow"])
    }

    /// Inverters and SMIs of the site.
    pub fn get_equipment_list(&self) -> Result<Vec<Value>, SolarEdgeError> {
        let data = self.query(&format!("/equipment/{}/list", self.site_id), &[])?;
        into_array(unwrap_envelope(data, &["reporters", "list"])?, "reporters.list")
    }

    /// Sensors of the site together with the device they are connected to.
    pub fn get_sensors(&self) -> Result<Value, SolarEdgeError> {
        let data = self.query(&format!("/equipment/{}/sensors", self.site_id), &[])?;
        unwrap_envelope(data, &["SiteSensors"])
    }

    /// Detailed power per meter type.
    ///
    /// The provider rejects windows longer than one month (HTTP 403); keeping
    /// windows within that limit is the caller's job.
    pub fn get_power_details(
        &self,
        window: &FetchWindow,
        time_unit: TimeUnit,
        meters: &[Meter],
    ) -> Result<PowerDetails, SolarEdgeError> {
        let mut params = self.window_params(window);
        params.push(("timeUnit", time_unit.as_str().to_string()));
        params.push(("meters", Meter::join(meters)));
        let data = self.query(&format!("/site/{}/powerDetails", self.site_id), &params)?;

        let mut details = unwrap_envelope(data, &["powerDetails"])?;
        let unit = match details.get("unit").and_then(Value::as_str) {
            Some(u) => u.to_string(),
            None => return Err(SolarEdgeError::Shape("response lacks `powerDetails.unit`".to_string())),
        };
        let meters = into_array(unwrap_envelope(details.take(), &["meters"])?, "powerDetails.meters")?;
        Ok(PowerDetails { unit, meters })
    }

    /// Battery state of energy, power and lifetime energy.
    pub fn get_storage_data(&self, window: &FetchWindow) -> Result<Vec<Value>, SolarEdgeError> {
        let params = self.window_params(window);
        let data = self.query(&format!("/site/{}/storageData", self.site_id), &params)?;
        into_array(
            unwrap_envelope(data, &["storageData", "batteries"])?,
            "storageData.batteries",
        )
    }
}

impl MonitoringApi for SolarEdgeClient {
    fn power_details(&self, window: &FetchWindow) -> Result<PowerDetails, SolarEdgeError> {
        self.get_power_details(window, TimeUnit::QuarterOfAnHour, &ALL_METERS)
    }

    fn storage_data(&self, window: &FetchWindow) -> Result<Vec<Value>, SolarEdgeError> {
        self.get_storage_data(window)
    }
}

fn unwrap_envelope(mut value: Value, path: &[&str]) -> Result<Value, SolarEdgeError> {
    for (depth, key) in path.iter().enumerate() {
        value = match value.get_mut(*key) {
            Some(inner) => inner.take(),
            None => {
                return Err(SolarEdgeError::Shape(format!(
                    "response lacks `{}`",
                    path[..=depth].join(".")
                )));
            }
        };
    }
    Ok(value)
}

fn into_array(value: Value, what: &str) -> Result<Vec<Value>, SolarEdgeError> {
    match value {
        Value::Array(items) => Ok(items),
        // An explicit null list is how the API reports "nothing in this window".
        Value::Null => Ok(Vec::new()),
        other => Err(SolarEdgeError::Shape(format!(
            "`{}` is not a list (got {})",
            what,
            json_type_name(&other)
        ))),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
