//! Models for the parts of the SolarEdge monitoring API this crate consumes.
//!
//! Notes
//! - Every field is optional. The API drops keys freely (future intervals carry a
//!   `date` but no `value`, batteries occasionally arrive without a serial number),
//!   so presence is checked by the normalizer, not by serde.
//! - List payloads stay as raw `serde_json::Value` until normalization so one
//!   malformed entry cannot fail the whole response.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteId(pub String);

impl std::fmt::Display for SiteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Aggregation granularity accepted by the energy, meters and power-details endpoints.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeUnit {
    QuarterOfAnHour,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl TimeUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeUnit::QuarterOfAnHour => "QUARTER_OF_AN_HOUR",
            TimeUnit::Hour => "HOUR",
            TimeUnit::Day => "DAY",
            TimeUnit::Week => "WEEK",
            TimeUnit::Month => "MONTH",
            TimeUnit::Year => "YEAR",
        }
    }
}

/// Meter types understood by the power-details endpoint. Self-consumption is a
/// virtual meter computed by the provider from the physical ones.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Meter {
    Production,
    Consumption,
    #[serde(rename = "SELFCONSUMPTION")]
    SelfConsumption,
    #[serde(rename = "FEEDIN")]
    FeedIn,
    Purchased,
}

impl Meter {
    pub fn as_str(&self) -> &'static str {
        match self {
            Meter::Production => "PRODUCTION",
            Meter::Consumption => "CONSUMPTION",
            Meter::SelfConsumption => "SELFCONSUMPTION",
            Meter::FeedIn => "FEEDIN",
            Meter::Purchased => "PURCHASED",
        }
    }

    /// Comma-separated list in the form the `meters` query parameter expects.
    pub fn join(meters: &[Meter]) -> String {
        meters.iter().map(Meter::as_str).collect::<Vec<_>>().join(",")
    }
}

pub const ALL_METERS: [Meter; 5] = [
    Meter::Production,
    Meter::Consumption,
    Meter::SelfConsumption,
    Meter::FeedIn,
    Meter::Purchased,
];

/// `powerDetails` envelope contents for a single request window.
#[derive(Debug, Clone, PartialEq)]
pub struct PowerDetails {
    /// Unit shared by every series in the response (usually "W").
    pub unit: String,
    /// Raw meter series; each is expected to look like [`MeterSeries`].
    pub meters: Vec<Value>,
}

/// One entry of `powerDetails.meters`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MeterSeries {
    #[serde(rename = "type", default)]
    pub meter_type: Option<String>,
    #[serde(default)]
    pub values: Option<Vec<Value>>,
}

/// One entry of `MeterSeries::values`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MeterSample {
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub value: Option<f64>,
}

/// One entry of `storageData.batteries`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Battery {
    #[serde(default)]
    pub model_number: Option<String>,
    #[serde(default)]
    pub serial_number: Option<String>,
    #[serde(default)]
    pub telemetries: Option<Vec<Value>>,
}

/// One entry of `Battery::telemetries`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatteryTelemetry {
    #[serde(default)]
    pub time_stamp: Option<String>,
    #[serde(default)]
    pub power: Option<f64>,
    #[serde(default)]
    pub battery_percentage_state: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meters_join_matches_query_format() {
        assert_eq!(
            Meter::join(&ALL_METERS),
            "PRODUCTION,CONSUMPTION,SELFCONSUMPTION,FEEDIN,PURCHASED"
        );
        assert_eq!(Meter::join(&[]), "");
    }

    #[test]
    fn serde_names_match_query_names() {
        for meter in ALL_METERS {
            let encoded = serde_json::to_value(meter).unwrap();
            assert_eq!(encoded.as_str(), Some(meter.as_str()));
        }
        let unit = serde_json::to_value(TimeUnit::QuarterOfAnHour).unwrap();
        assert_eq!(unit.as_str(), Some(TimeUnit::QuarterOfAnHour.as_str()));
    }

    #[test]
    fn telemetry_tolerates_missing_keys() {
        let t: BatteryTelemetry = serde_json::from_str(r#"{"timeStamp":"2023-08-10 00:05:00"}"#).unwrap();
        assert_eq!(t.time_stamp.as_deref(), Some("2023-08-10 00:05:00"));
        assert!(t.power.is_none());
        assert!(t.battery_percentage_state.is_none());
    }

    #[test]
    fn unread_battery_keys_may_hold_anything() {
        let b: Battery = serde_json::from_str(
            r#"{"modelNumber":"BAT","serialNumber":"1","nameplate":"9.7 kWh","telemetryCount":-1,
                "telemetries":[{"timeStamp":"2023-08-10 00:05:00","power":5.0,"batteryPercentageState":40,
                "batteryState":"Charging","internalTemp":null,"lifeTimeEnergyCharged":"n/a"}]}"#,
        )
        .unwrap();
        let t: BatteryTelemetry = serde_json::from_value(b.telemetries.unwrap()[0].clone()).unwrap();
        assert_eq!(t.battery_percentage_state, Some(40.0));
    }
}
