//! Time-series point model and its InfluxDB line-protocol rendering.
//!
//! Important: a point's identity in the store is (measurement, tag set,
//! timestamp). Tags and fields are kept in sorted maps so the same point always
//! renders to the same line, which is what makes re-writes idempotent.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

// Measurement, tag and field names shared by the normalizer and the watermark queries.
pub mod names {
    pub const PRODUCTION: &str = "Production";
    pub const CONSUMPTION: &str = "Consumption";
    pub const BATTERY: &str = "battery";

    pub const TAG_UNIT: &str = "unit";
    pub const TAG_BATTERY: &str = "battery";

    pub const FIELD_POWER: &str = "power";
    pub const FIELD_PCT: &str = "pct";
    pub const FIELD_WATTS: &str = "watts";
}

#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, f64>,
    /// Second precision; sub-second parts are dropped when rendered.
    pub timestamp: DateTime<Utc>,
}

impl Point {
    pub fn new(measurement: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Point {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp,
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: f64) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// Series identity: measurement plus tag set, as rendered on the wire.
    pub fn series_key(&self) -> String {
        let mut key = escape(&self.measurement, &[',', ' ']);
        for (k, v) in &self.tags {
            // Influx drops empty tag values; mirror that so keys stay comparable.
            if v.is_empty() {
                continue;
            }
            key.push(',');
            key.push_str(&escape(k, TAG_SPECIALS));
            key.push('=');
            key.push_str(&escape(v, TAG_SPECIALS));
        }
        key
    }

    /// Render as one line of InfluxDB line protocol with a seconds timestamp.
    ///
    /// Fails for points without fields or with non-finite field values, both of
    /// which the store would reject.
    pub fn to_line_protocol(&self) -> Result<String, String> {
        if self.measurement.is_empty() {
            return Err("point has an empty measurement name".to_string());
        }
        if self.fields.is_empty() {
            return Err(format!("point {} has no fields", self.series_key()));
        }

        let mut fields = Vec::with_capacity(self.fields.len());
        for (k, v) in &self.fields {
            if !v.is_finite() {
                return Err(format!("field {} of {} is not finite ({})", k, self.series_key(), v));
            }
            fields.push(format!("{}={}", escape(k, TAG_SPECIALS), v));
        }

        Ok(format!(
            "{} {} {}",
            self.series_key(),
            fields.join(","),
            self.timestamp.timestamp()
        ))
    }
}

const TAG_SPECIALS: &[char] = &[',', '=', ' '];

fn escape(raw: &str, specials: &[char]) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c == '\\' || specials.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
