//! Runtime configuration, read once at startup from the environment.
//! A `.env` file, when present, is loaded into the environment before this runs.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use std::time::Duration as StdDuration;

use crate::client::DEFAULT_BASE_URL;
use crate::models::solaredge::SiteId;
use crate::utils::{PROVIDER_DATE_FORMAT, local_midnight};

pub const DEFAULT_WATERMARK_LOOKBACK_DAYS: i64 = 14;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct Config {
    pub site_id: SiteId,
    pub api_key: String,
    pub solaredge_base_url: String,
    pub influx_url: String,
    pub influx_token: String,
    pub influx_org: String,
    pub influx_bucket: String,
    /// Site timezone; the provider speaks wall-clock time in it.
    pub timezone: Tz,
    /// First day with data; used instead of a watermark on a fresh bucket.
    pub installation_date: NaiveDate,
    /// How far back the watermark query looks for the last stored point.
    pub watermark_lookback: Duration,
    /// Global timeout of every provider and sink request.
    pub http_timeout: StdDuration,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let require = |key: &str| get(key).ok_or_else(|| format!("Missing required setting {}", key));

        let timezone_name = require("TIMEZONE")?;
        let timezone = timezone_name
            .parse::<Tz>()
            .map_err(|_| format!("TIMEZONE \"{}\" is not a known IANA timezone", timezone_name))?;

        let installation_date = NaiveDate::parse_from_str(&require("INSTALLATION_DATE")?, PROVIDER_DATE_FORMAT)
            .map_err(|_| "INSTALLATION_DATE must be in YYYY-MM-DD format".to_string())?;

        let lookback_days = match get("WATERMARK_LOOKBACK_DAYS") {
            Some(s) => s
                .parse::<i64>()
                .ok()
                .filter(|d| *d > 0)
                .ok_or_else(|| "WATERMARK_LOOKBACK_DAYS must be a positive number of days".to_string())?,
            None => DEFAULT_WATERMARK_LOOKBACK_DAYS,
        };

        let timeout_secs = match get("HTTP_TIMEOUT_SECS") {
            Some(s) => s
                .parse::<u64>()
                .ok()
                .filter(|s| *s > 0)
                .ok_or_else(|| "HTTP_TIMEOUT_SECS must be a positive number of seconds".to_string())?,
            None => DEFAULT_HTTP_TIMEOUT_SECS,
        };

        Ok(Config {
            site_id: SiteId(require("SITE_ID")?),
            api_key: require("API_KEY")?,
            solaredge_base_url: get("SOLAREDGE_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            influx_url: require("INFLUXDB_URL")?,
            influx_token: require("INFLUXDB_TOKEN")?,
            influx_org: require("INFLUXDB_ORG")?,
            influx_bucket: require("INFLUXDB_BUCKET")?,
            timezone,
            installation_date,
            watermark_lookback: Duration::days(lookback_days),
            http_timeout: StdDuration::from_secs(timeout_secs),
        })
    }

    /// Midnight of the installation date in the site timezone.
    pub fn installation_start(&self) -> DateTime<Utc> {
        local_midnight(self.installation_date, self.timezone)
    }
}
