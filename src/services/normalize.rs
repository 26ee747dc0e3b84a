//! Turn aggregated provider payloads into write-ready points.
//!
//! Nothing in here fails: an entry that is missing a required key or has the
//! wrong shape is dropped, logged and recorded as a [`Rejection`], and the rest
//! of the batch carries on.

use crate::db::models::{Point, names};
use crate::models::solaredge::{Battery, BatteryTelemetry, MeterSample, MeterSeries, PowerDetails};
use crate::utils::parse_provider_time;
use chrono_tz::Tz;
use log::warn;
use serde::de::DeserializeOwned;
use serde_json::Value;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RejectionKind {
    /// A required key is absent
    MissingField(&'static str),
    /// The timestamp is unparseable or does not exist in the site timezone
    InvalidTimestamp,
    /// The entry does not have the expected structure
    Malformed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub kind: RejectionKind,
    pub detail: String,
}

#[derive(Debug, Default)]
pub struct Normalized {
    /// Sorted by timestamp; entries with equal timestamps keep input order.
    pub points: Vec<Point>,
    pub rejections: Vec<Rejection>,
}

impl Normalized {
    fn reject(&mut self, kind: RejectionKind, detail: String) {
        warn!("Normalize: {}", detail);
        self.rejections.push(Rejection { kind, detail });
    }

    fn finish(mut self) -> Self {
        self.points.sort_by_key(|p| p.timestamp);
        self
    }
}

fn decode<T: DeserializeOwned>(value: &Value) -> Result<T, String> {
    serde_path_to_error::deserialize(value).map_err(|e| format!("{} at `{}`", e.inner(), e.path()))
}

/// One `power` point per sample that carries a value, measurement = meter type.
pub fn power_details_points(details: &[PowerDetails], tz: Tz) -> Normalized {
    let mut out = Normalized::default();

    for chunk in details {
        for (idx, raw) in chunk.meters.iter().enumerate() {
            let series: MeterSeries = match decode(raw) {
                Ok(s) => s,
                Err(e) => {
                    out.reject(RejectionKind::Malformed, format!("meter entry #{} is malformed: {}", idx, e));
                    continue;
                }
            };
            let Some(meter_type) = series.meter_type else {
                out.reject(
                    RejectionKind::MissingField("type"),
                    format!("meter entry #{} doesn't contain `type`", idx),
                );
                continue;
            };
            let Some(values) = series.values else {
                out.reject(
                    RejectionKind::MissingField("values"),
                    format!("{} meter entry doesn't contain `values`", meter_type),
                );
                continue;
            };

            for raw_sample in &values {
                let sample: MeterSample = match decode(raw_sample) {
                    Ok(s) => s,
                    Err(e) => {
                        out.reject(
                            RejectionKind::Malformed,
                            format!("{} sample is malformed: {}", meter_type, e),
                        );
                        continue;
                    }
                };
                // Placeholder for an interval without a reading yet.
                let Some(value) = sample.value else { continue };
                let Some(date) = sample.date else {
                    out.reject(
                        RejectionKind::MissingField("date"),
                        format!("{} sample {} doesn't contain `date`", meter_type, value),
                    );
                    continue;
                };
                let ts = match parse_provider_time(&date, tz) {
                    Ok(ts) => ts,
                    Err(e) => {
                        out.reject(RejectionKind::InvalidTimestamp, format!("{} sample: {}", meter_type, e));
                        continue;
                    }
                };

                out.points.push(
                    Point::new(meter_type.as_str(), ts)
                        .tag(names::TAG_UNIT, chunk.unit.as_str())
                        .field(names::FIELD_POWER, value),
                );
            }
        }
    }

    out.finish()
}

/// One `battery` point per complete telemetry entry, tagged "model (serial)".
pub fn battery_points(batteries: &[Value], tz: Tz) -> Normalized {
    let mut out = Normalized::default();

    for (idx, raw) in batteries.iter().enumerate() {
        let battery: Battery = match decode(raw) {
            Ok(b) => b,
            Err(e) => {
                out.reject(RejectionKind::Malformed, format!("battery entry #{} is malformed: {}", idx, e));
                continue;
            }
        };
        let Some(model) = battery.model_number else {
            out.reject(
                RejectionKind::MissingField("modelNumber"),
                format!("battery entry #{} doesn't contain `modelNumber`", idx),
            );
            continue;
        };
        let Some(serial) = battery.serial_number else {
            out.reject(
                RejectionKind::MissingField("serialNumber"),
                format!("battery entry #{} ({}) doesn't contain `serialNumber`", idx, model),
            );
            continue;
        };
        let identity = format!("{} ({})", model, serial);

        for raw_telemetry in battery.telemetries.as_deref().unwrap_or_default() {
            let telemetry: BatteryTelemetry = match decode(raw_telemetry) {
                Ok(t) => t,
                Err(e) => {
                    out.reject(
                        RejectionKind::Malformed,
                        format!("{} telemetry is malformed: {}", identity, e),
                    );
                    continue;
                }
            };
            let Some(stamp) = telemetry.time_stamp else {
                out.reject(
                    RejectionKind::MissingField("timeStamp"),
                    format!("{} telemetry doesn't contain `timeStamp`", identity),
                );
                continue;
            };
            let Some(pct) = telemetry.battery_percentage_state else {
                out.reject(
                    RejectionKind::MissingField("batteryPercentageState"),
                    format!("{} telemetry at {} doesn't contain `batteryPercentageState`", identity, stamp),
                );
                continue;
            };
            let Some(watts) = telemetry.power else {
                out.reject(
                    RejectionKind::MissingField("power"),
                    format!("{} telemetry at {} doesn't contain `power`", identity, stamp),
                );
                continue;
            };
            let ts = match parse_provider_time(&stamp, tz) {
                Ok(ts) => ts,
                Err(e) => {
                    out.reject(RejectionKind::InvalidTimestamp, format!("{} telemetry: {}", identity, e));
                    continue;
                }
            };

            out.points.push(
                Point::new(names::BATTERY, ts)
                    .tag(names::TAG_BATTERY, identity.as_str())
                    .field(names::FIELD_PCT, pct)
                    .field(names::FIELD_WATTS, watts),
            );
        }
    }

    out.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn details(meters: Vec<Value>) -> Vec<PowerDetails> {
        vec![PowerDetails {
            unit: "W".to_string(),
            meters,
        }]
    }

    fn load_fixture(path: &str, envelope: &[&str]) -> Value {
        let json = std::fs::read_to_string(path).expect("fixture present");
        let mut value: Value = serde_json::from_str(&json).expect("parse fixture");
        for key in envelope {
            value = value[*key].take();
        }
        value
    }

    #[test]
    fn single_production_sample_yields_one_point() {
        let out = power_details_points(
            &details(vec![json!({
                "type": "Production",
                "values": [{ "date": "2024-01-01 00:00:00", "value": 1500 }]
            })]),
            chrono_tz::UTC,
        );
        assert!(out.rejections.is_empty());
        assert_eq!(out.points.len(), 1);
        let p = &out.points[0];
        assert_eq!(p.measurement, "Production");
        assert_eq!(p.tags.get("unit").map(String::as_str), Some("W"));
        assert_eq!(p.fields.get("power"), Some(&1500.0));
        assert_eq!(p.timestamp, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn sample_without_value_is_skipped_silently() {
        let out = power_details_points(
            &details(vec![json!({
                "type": "Production",
                "values": [{ "date": "2024-01-01 00:00:00" }]
            })]),
            chrono_tz::UTC,
        );
        assert!(out.points.is_empty());
        assert!(out.rejections.is_empty());

        let null_value = power_details_points(
            &details(vec![json!({
                "type": "Production",
                "values": [{ "date": "2024-01-01 00:00:00", "value": null }]
            })]),
            chrono_tz::UTC,
        );
        assert!(null_value.points.is_empty());
        assert!(null_value.rejections.is_empty());
    }

    #[test]
    fn series_missing_type_or_values_is_dropped_but_siblings_survive() {
        let out = power_details_points(
            &details(vec![
                json!({ "values": [{ "date": "2024-01-01 00:00:00", "value": 1 }] }),
                json!({ "type": "Consumption" }),
                json!({ "type": "Purchased", "values": [{ "date": "2024-01-01 00:15:00", "value": 12.5 }] }),
            ]),
            chrono_tz::UTC,
        );
        assert_eq!(out.points.len(), 1);
        assert_eq!(out.points[0].measurement, "Purchased");
        let kinds: Vec<_> = out.rejections.iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![RejectionKind::MissingField("type"), RejectionKind::MissingField("values")]
        );
    }

    #[test]
    fn malformed_entries_are_rejected_with_path() {
        let out = power_details_points(
            &details(vec![
                json!("not an object"),
                json!({ "type": "Production", "values": [
                    { "date": "2024-01-01 00:00:00", "value": "lots" },
                    { "date": "yesterday", "value": 3 },
                    { "value": 4 },
                    { "date": "2024-01-01 00:15:00", "value": 5 }
                ] }),
            ]),
            chrono_tz::UTC,
        );
        assert_eq!(out.points.len(), 1);
        assert_eq!(out.points[0].fields.get("power"), Some(&5.0));
        let kinds: Vec<_> = out.rejections.iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![
                RejectionKind::Malformed,
                RejectionKind::Malformed,
                RejectionKind::InvalidTimestamp,
                RejectionKind::MissingField("date"),
            ]
        );
        assert!(out.rejections[1].detail.contains("value"));
    }

    #[test]
    fn power_fixture_points_are_sorted() {
        let raw = load_fixture("tests/data/power-details.json", &["powerDetails"]);
        let chunk = PowerDetails {
            unit: raw["unit"].as_str().unwrap().to_string(),
            meters: raw["meters"].as_array().unwrap().clone(),
        };
        let out = power_details_points(&[chunk], chrono_tz::UTC);
        assert_eq!(out.points.len(), 4);
        assert_eq!(out.rejections.len(), 1);
        assert!(out.points.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        // Equal timestamps keep the provider's series order.
        assert_eq!(out.points[0].measurement, "Production");
        assert_eq!(out.points[1].measurement, "Consumption");
    }

    #[test]
    fn battery_missing_serial_yields_nothing_and_one_diagnostic() {
        let out = battery_points(
            &[json!({
                "modelNumber": "BAT-10K1P",
                "telemetries": [
                    { "timeStamp": "2023-08-10 00:05:00", "power": 1.0, "batteryPercentageState": 50.0 },
                    { "timeStamp": "2023-08-10 00:10:00", "power": 2.0, "batteryPercentageState": 51.0 }
                ]
            })],
            chrono_tz::UTC,
        );
        assert!(out.points.is_empty());
        assert_eq!(out.rejections.len(), 1);
        assert_eq!(out.rejections[0].kind, RejectionKind::MissingField("serialNumber"));
    }

    #[test]
    fn incomplete_telemetry_is_skipped_individually() {
        let out = battery_points(
            &[json!({
                "modelNumber": "BAT-10K1P",
                "serialNumber": "7F1",
                "telemetries": [
                    { "power": 1.0, "batteryPercentageState": 50.0 },
                    { "timeStamp": "2023-08-10 00:10:00", "power": 2.0 },
                    { "timeStamp": "2023-08-10 00:15:00", "batteryPercentageState": 51.0 },
                    { "timeStamp": "2023-08-10 00:20:00", "power": -3.5, "batteryPercentageState": 52.0 }
                ]
            })],
            chrono_tz::UTC,
        );
        assert_eq!(out.points.len(), 1);
        let p = &out.points[0];
        assert_eq!(p.measurement, "battery");
        assert_eq!(p.tags.get("battery").map(String::as_str), Some("BAT-10K1P (7F1)"));
        assert_eq!(p.fields.get("pct"), Some(&52.0));
        assert_eq!(p.fields.get("watts"), Some(&-3.5));
        let kinds: Vec<_> = out.rejections.iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![
                RejectionKind::MissingField("timeStamp"),
                RejectionKind::MissingField("batteryPercentageState"),
                RejectionKind::MissingField("power"),
            ]
        );
    }

    #[test]
    fn odd_typed_extra_battery_keys_still_yield_points() {
        let out = battery_points(
            &[json!({
                "modelNumber": "BAT-10K1P",
                "serialNumber": "7F1",
                "nameplate": "9.7 kWh",
                "telemetryCount": -1,
                "telemetries": [{
                    "timeStamp": "2023-08-10 00:05:00",
                    "power": 120.0,
                    "batteryPercentageState": 64.0,
                    "batteryState": "Charging",
                    "fullPackEnergyAvailable": null,
                    "internalTemp": "31C"
                }]
            })],
            chrono_tz::UTC,
        );
        assert!(out.rejections.is_empty(), "{:?}", out.rejections);
        assert_eq!(out.points.len(), 1);
        assert_eq!(out.points[0].fields.get("watts"), Some(&120.0));
    }

    #[test]
    fn battery_fixture_uses_site_timezone() {
        let raw = load_fixture("tests/data/storage-data.json", &["storageData", "batteries"]);
        let out = battery_points(raw.as_array().unwrap(), chrono_tz::Europe::Berlin);
        assert_eq!(out.points.len(), 2);
        assert_eq!(out.rejections.len(), 2);
        assert_eq!(
            out.points[0].timestamp,
            Utc.with_ymd_and_hms(2023, 8, 9, 22, 5, 0).unwrap()
        );
    }

    #[test]
    fn battery_without_telemetries_is_fine() {
        let out = battery_points(
            &[json!({ "modelNumber": "BAT", "serialNumber": "1", "telemetries": null })],
            chrono_tz::UTC,
        );
        assert!(out.points.is_empty());
        assert!(out.rejections.is_empty());
    }
}
