//! InfluxDB v2 sink spoken over plain HTTP with the same blocking `ureq` agent
//! as the provider client.
//!
//! - Writes: line protocol, seconds precision, batched.
//! - Queries: Flux, CSV response; only the `_time` column is consumed.
//! - Admin: destructive bucket reset for the one-time history import.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::json;
use std::cell::RefCell;
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::db::models::Point;

/// Lines per write request; InfluxDB recommends batches of about 5000.
pub const WRITE_BATCH_SIZE: usize = 5000;

const MAX_ERROR_BODY: usize = 300;

#[derive(Debug)]
pub enum SinkError {
    Transport(String),
    Http { status: u16, message: String },
    InvalidPoint(String),
    Query(String),
}

impl core::fmt::Display for SinkError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SinkError::Transport(s) => write!(f, "transport error: {}", s),
            SinkError::Http { status, message } => write!(f, "http {}: {}", status, message),
            SinkError::InvalidPoint(s) => write!(f, "invalid point: {}", s),
            SinkError::Query(s) => write!(f, "query error: {}", s),
        }
    }
}

impl std::error::Error for SinkError {}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WriteMode {
    /// Queue batches for a background writer and return immediately.
    FireAndForget,
    /// Send every batch before returning; the report is exact.
    WaitForAck,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct WriteReport {
    /// Points accepted (WaitForAck) or queued (FireAndForget).
    pub written: usize,
    pub failed: usize,
}

pub trait PointSink {
    /// Write `points` into `bucket`. Per-point and per-batch failures are
    /// logged and counted, never returned.
    fn write(&self, bucket: &str, points: &[Point], mode: WriteMode) -> WriteReport;

    /// Block until queued fire-and-forget batches are sent; returns their outcome.
    fn flush(&self) -> WriteReport;

    /// Run a Flux query and return every `_time` value of the result.
    fn query_times(&self, flux: &str) -> Result<Vec<DateTime<Utc>>, SinkError>;

    /// Delete `bucket` if it exists and create it again, empty.
    fn reset_bucket(&self, bucket: &str) -> Result<(), SinkError>;
}

/// Connection settings shared with the background writer thread.
#[derive(Clone)]
struct Connection {
    agent: ureq::Agent,
    base_url: String,
    org: String,
    auth: String,
}

impl Connection {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn post_lines(&self, bucket: &str, body: &str) -> Result<(), SinkError> {
        let res = self
            .agent
            .post(self.url("/api/v2/write"))
            .query("org", &self.org)
            .query("bucket", bucket)
            .query("precision", "s")
            .header("Authorization", &self.auth)
            .header("Content-Type", "text/plain; charset=utf-8")
            .send(body);
        expect_success(res).map(|_| ())
    }
}

struct WriteJob {
    bucket: String,
    body: String,
    lines: usize,
}

struct BackgroundWriter {
    tx: Sender<WriteJob>,
    handle: JoinHandle<WriteReport>,
}

impl BackgroundWriter {
    fn spawn(conn: Connection) -> Self {
        let (tx, rx) = mpsc::channel::<WriteJob>();
        let handle = thread::spawn(move || {
            let mut report = WriteReport::default();
            for job in rx {
                match conn.post_lines(&job.bucket, &job.body) {
                    Ok(()) => report.written += job.lines,
                    Err(e) => {
                        warn!("Influx: background write of {} point(s) failed: {}", job.lines, e);
                        report.failed += job.lines;
                    }
                }
            }
            report
        });
        BackgroundWriter { tx, handle }
    }

    fn finish(self) -> WriteReport {
        drop(self.tx);
        match self.handle.join() {
            Ok(report) => report,
            Err(_) => {
                warn!("Influx: background writer panicked");
                WriteReport::default()
            }
        }
    }
}

pub struct InfluxClient {
    conn: Connection,
    background: RefCell<Option<BackgroundWriter>>,
}

impl InfluxClient {
    pub fn new(url: impl Into<String>, token: &str, org: impl Into<String>, timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(timeout))
            .build();
        let url: String = url.into();

        InfluxClient {
            conn: Connection {
                agent: config.into(),
                base_url: url.trim_end_matches('/').to_string(),
                org: org.into(),
                auth: format!("Token {}", token),
            },
            background: RefCell::new(None),
        }
    }

    fn find_bucket_ids(&self, bucket: &str) -> Result<Vec<String>, SinkError> {
        #[derive(Deserialize)]
        struct Buckets {
            #[serde(default)]
            buckets: Vec<IdOnly>,
        }

        let res = self
            .conn
            .agent
            .get(self.conn.url("/api/v2/buckets"))
            .query("name", bucket)
            .query("org", &self.conn.org)
            .header("Authorization", &self.conn.auth)
            .call();
        let body = expect_success(res)?;
        let parsed: Buckets =
            serde_json::from_str(&body).map_err(|e| SinkError::Query(format!("bucket list: {}", e)))?;
        Ok(parsed.buckets.into_iter().map(|b| b.id).collect())
    }

    fn find_org_id(&self) -> Result<String, SinkError> {
        #[derive(Deserialize)]
        struct Orgs {
            #[serde(default)]
            orgs: Vec<IdOnly>,
        }

        let res = self
            .conn
            .agent
            .get(self.conn.url("/api/v2/orgs"))
            .query("org", &self.conn.org)
            .header("Authorization", &self.conn.auth)
            .call();
        let body = expect_success(res)?;
        let parsed: Orgs = serde_json::from_str(&body).map_err(|e| SinkError::Query(format!("org list: {}", e)))?;
        parsed
            .orgs
            .into_iter()
            .next()
            .map(|o| o.id)
            .ok_or_else(|| SinkError::Query(format!("organization \"{}\" not found", self.conn.org)))
    }
}

#[derive(Deserialize)]
struct IdOnly {
    id: String,
}

impl PointSink for InfluxClient {
    fn write(&self, bucket: &str, points: &[Point], mode: WriteMode) -> WriteReport {
        let mut report = WriteReport::default();
        if points.is_empty() {
            return report;
        }

        let mut lines = Vec::with_capacity(points.len());
        for p in points {
            match p.to_line_protocol() {
                Ok(line) => lines.push(line),
                Err(e) => {
                    warn!("Influx: skipping point: {}", e);
                    report.failed += 1;
                }
            }
        }

        for batch in lines.chunks(WRITE_BATCH_SIZE) {
            let body = batch.join("\n");
            match mode {
                WriteMode::WaitForAck => match self.conn.post_lines(bucket, &body) {
                    Ok(()) => report.written += batch.len(),
                    Err(e) => {
                        warn!("Influx: write of {} point(s) to {} failed: {}", batch.len(), bucket, e);
                        report.failed += batch.len();
                    }
                },
                WriteMode::FireAndForget => {
                    let mut slot = self.background.borrow_mut();
                    let writer = slot.get_or_insert_with(|| BackgroundWriter::spawn(self.conn.clone()));
                    let job = WriteJob {
                        bucket: bucket.to_string(),
                        body,
                        lines: batch.len(),
                    };
                    match writer.tx.send(job) {
                        Ok(()) => report.written += batch.len(),
                        Err(_) => {
                            warn!("Influx: background writer is gone; dropping {} point(s)", batch.len());
                            report.failed += batch.len();
                        }
                    }
                }
            }
        }

        debug!(
            "Influx: {} point(s) {} for {}, {} failed",
            report.written,
            if mode == WriteMode::WaitForAck { "written" } else { "queued" },
            bucket,
            report.failed
        );
        report
    }

    fn flush(&self) -> WriteReport {
        match self.background.borrow_mut().take() {
            Some(writer) => writer.finish(),
            None => WriteReport::default(),
        }
    }

    fn query_times(&self, flux: &str) -> Result<Vec<DateTime<Utc>>, SinkError> {
        debug!("Influx query: {}", flux);
        let body = json!({
            "query": flux,
            "type": "flux",
            "dialect": { "header": true, "annotations": [], "delimiter": "," }
        });
        let res = self
            .conn
            .agent
            .post(self.conn.url("/api/v2/query"))
            .query("org", &self.conn.org)
            .header("Authorization", &self.conn.auth)
            .header("Accept", "application/csv")
            .send_json(&body);
        let csv = expect_success(res)?;
        parse_csv_times(&csv)
    }

    fn reset_bucket(&self, bucket: &str) -> Result<(), SinkError> {
        for id in self.find_bucket_ids(bucket)? {
            warn!("Influx: deleting bucket {} ({})", bucket, id);
            let res = self
                .conn
                .agent
                .delete(self.conn.url(&format!("/api/v2/buckets/{}", id)))
                .header("Authorization", &self.conn.auth)
                .call();
            expect_success(res)?;
        }

        let org_id = self.find_org_id()?;
        let res = self
            .conn
            .agent
            .post(self.conn.url("/api/v2/buckets"))
            .header("Authorization", &self.conn.auth)
            .send_json(&json!({ "orgID": org_id, "name": bucket, "retentionRules": [] }));
        expect_success(res)?;
        info!("Influx: bucket {} recreated", bucket);
        Ok(())
    }
}

impl Drop for InfluxClient {
    fn drop(&mut self) {
        let report = self.flush();
        if report.written + report.failed > 0 {
            debug!("Influx: drained background writer on drop ({:?})", report);
        }
    }
}

/// Read the response body and turn non-2xx statuses into [`SinkError::Http`].
fn expect_success(res: Result<http::Response<ureq::Body>, ureq::Error>) -> Result<String, SinkError> {
    let mut res = res.map_err(|e| SinkError::Transport(e.to_string()))?;
    let status = res.status();
    let body = res
        .body_mut()
        .read_to_string()
        .map_err(|e| SinkError::Transport(e.to_string()))?;
    if status.is_success() {
        Ok(body)
    } else {
        let trimmed = body.trim();
        let message = if trimmed.is_empty() {
            status.canonical_reason().unwrap_or("<no body>").to_string()
        } else {
            trimmed.chars().take(MAX_ERROR_BODY).collect()
        };
        Err(SinkError::Http {
            status: status.as_u16(),
            message,
        })
    }
}

/// Extract the `_time` column from an un-annotated Flux CSV response.
///
/// Tables are separated by blank lines and each starts with its own header row.
/// A table with an `error` column is a failed query, even under HTTP 200.
fn parse_csv_times(body: &str) -> Result<Vec<DateTime<Utc>>, SinkError> {
    let body = body.replace("\r\n", "\n");
    let mut times = Vec::new();

    for table in body.split("\n\n").filter(|t| !t.trim().is_empty()) {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(table.trim_start_matches('\n').as_bytes());
        let headers = reader
            .headers()
            .map_err(|e| SinkError::Query(format!("bad CSV header: {}", e)))?
            .clone();

        if let Some(idx) = headers.iter().position(|h| h == "error") {
            let message = reader
                .records()
                .next()
                .and_then(Result::ok)
                .and_then(|row| row.get(idx).map(str::to_string))
                .unwrap_or_default();
            return Err(SinkError::Query(format!("query failed: {}", message)));
        }
        let Some(idx) = headers.iter().position(|h| h == "_time") else {
            continue;
        };

        for row in reader.records() {
            let row = row.map_err(|e| SinkError::Query(format!("bad CSV row: {}", e)))?;
            let cell = row
                .get(idx)
                .ok_or_else(|| SinkError::Query(format!("row without _time column: {:?}", row)))?;
            let ts = DateTime::parse_from_rfc3339(cell)
                .map_err(|e| SinkError::Query(format!("bad _time \"{}\": {}", cell, e)))?;
            times.push(ts.with_timezone(&Utc));
        }
    }

    Ok(times)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::names;
    use chrono::TimeZone;
    use mockito::{Matcher, Server};

    fn client_for(server: &Server) -> InfluxClient {
        InfluxClient::new(server.url(), "tok", "home", Duration::from_secs(5))
    }

    fn sample_points() -> Vec<Point> {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        vec![
            Point::new(names::PRODUCTION, ts)
                .tag(names::TAG_UNIT, "W")
                .field(names::FIELD_POWER, 1500.0),
            Point::new(names::CONSUMPTION, ts)
                .tag(names::TAG_UNIT, "W")
                .field(names::FIELD_POWER, 400.0),
        ]
    }

    #[test]
    fn parses_multi_table_csv() {
        let csv = ",result,table,_start,_stop,_time,_value,_field,_measurement,unit\r\n\
                   ,_result,0,2024-01-01T00:00:00Z,2024-01-15T00:00:00Z,2024-01-14T23:45:00Z,1500,power,Production,W\r\n\
                   \r\n\
                   ,result,table,_start,_stop,_time,_value,_field,_measurement,battery\r\n\
                   ,_result,1,2024-01-01T00:00:00Z,2024-01-15T00:00:00Z,2024-01-14T23:30:00Z,80,pct,battery,BAT (1)\r\n";
        let times = parse_csv_times(csv).unwrap();
        assert_eq!(
            times,
            vec![
                Utc.with_ymd_and_hms(2024, 1, 14, 23, 45, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 1, 14, 23, 30, 0).unwrap(),
            ]
        );
    }

    #[test]
    fn empty_csv_has_no_times() {
        assert!(parse_csv_times("").unwrap().is_empty());
        assert!(parse_csv_times("\r\n").unwrap().is_empty());
    }

    #[test]
    fn error_table_is_query_error() {
        let csv = ",error,reference\r\n,\"panic: runtime error, index out of range\",\r\n";
        match parse_csv_times(csv) {
            Err(SinkError::Query(msg)) => assert!(msg.contains("index out of range"), "{}", msg),
            other => panic!("expected query error, got {:?}", other),
        }
    }

    #[test]
    fn quoted_cells_keep_their_commas() {
        let csv = ",result,table,_time,battery\n,_result,0,2024-01-14T23:30:00Z,\"LG, RESU (1)\"\n";
        assert_eq!(
            parse_csv_times(csv).unwrap(),
            vec![Utc.with_ymd_and_hms(2024, 1, 14, 23, 30, 0).unwrap()]
        );
    }

    #[test]
    fn bad_time_cell_is_query_error() {
        let csv = ",result,table,_time\n,_result,0,yesterday\n";
        assert!(matches!(parse_csv_times(csv), Err(SinkError::Query(_))));
    }

    #[test]
    fn wait_for_ack_posts_line_protocol() {
        let mut server = Server::new();
        let mock = server
            .mock("POST", "/api/v2/write")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("org".into(), "home".into()),
                Matcher::UrlEncoded("bucket".into(), "solar".into()),
                Matcher::UrlEncoded("precision".into(), "s".into()),
            ]))
            .match_header("authorization", "Token tok")
            .match_body("Production,unit=W power=1500 1704067200\nConsumption,unit=W power=400 1704067200")
            .with_status(204)
            .create();

        let report = client_for(&server).write("solar", &sample_points(), WriteMode::WaitForAck);
        assert_eq!(report, WriteReport { written: 2, failed: 0 });
        mock.assert();
    }

    #[test]
    fn failed_batch_is_counted_not_raised() {
        let mut server = Server::new();
        let _mock = server
            .mock("POST", "/api/v2/write")
            .match_query(Matcher::Any)
            .with_status(401)
            .with_body(r#"{"code":"unauthorized","message":"unauthorized access"}"#)
            .create();

        let mut points = sample_points();
        points.push(Point::new("empty", Utc::now()));
        let report = client_for(&server).write("solar", &points, WriteMode::WaitForAck);
        assert_eq!(report, WriteReport { written: 0, failed: 3 });
    }

    #[test]
    fn fire_and_forget_is_drained_by_flush() {
        let mut server = Server::new();
        let mock = server
            .mock("POST", "/api/v2/write")
            .match_query(Matcher::Any)
            .with_status(204)
            .expect(1)
            .create();

        let client = client_for(&server);
        let queued = client.write("solar", &sample_points(), WriteMode::FireAndForget);
        assert_eq!(queued.written, 2);
        let sent = client.flush();
        assert_eq!(sent, WriteReport { written: 2, failed: 0 });
        assert_eq!(client.flush(), WriteReport::default());
        mock.assert();
    }

    #[test]
    fn query_times_posts_flux() {
        let mut server = Server::new();
        let mock = server
            .mock("POST", "/api/v2/query")
            .match_query(Matcher::UrlEncoded("org".into(), "home".into()))
            .match_header("authorization", "Token tok")
            .match_body(Matcher::PartialJson(json!({ "type": "flux", "query": "from(bucket: \"solar\")" })))
            .with_status(200)
            .with_body(",result,table,_time\n,_result,0,2024-01-02T03:04:05Z\n")
            .create();

        let times = client_for(&server).query_times("from(bucket: \"solar\")").unwrap();
        assert_eq!(times, vec![Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap()]);
        mock.assert();
    }

    #[test]
    fn reset_bucket_deletes_then_creates() {
        let mut server = Server::new();
        let find = server
            .mock("GET", "/api/v2/buckets")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("name".into(), "solar".into()),
                Matcher::UrlEncoded("org".into(), "home".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"buckets":[{"id":"b1","name":"solar","orgID":"o1"}]}"#)
            .create();
        let delete = server.mock("DELETE", "/api/v2/buckets/b1").with_status(204).create();
        let org = server
            .mock("GET", "/api/v2/orgs")
            .match_query(Matcher::UrlEncoded("org".into(), "home".into()))
            .with_status(200)
            .with_body(r#"{"orgs":[{"id":"o1","name":"home"}]}"#)
            .create();
        let create = server
            .mock("POST", "/api/v2/buckets")
            .match_body(Matcher::Json(json!({ "orgID": "o1", "name": "solar", "retentionRules": [] })))
            .with_status(201)
            .with_body(r#"{"id":"b2"}"#)
            .create();

        client_for(&server).reset_bucket("solar").unwrap();
        find.assert();
        delete.assert();
        org.assert();
        create.assert();
    }

    #[test]
    fn reset_bucket_without_existing_bucket_only_creates() {
        let mut server = Server::new();
        let _find = server
            .mock("GET", "/api/v2/buckets")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"buckets":[]}"#)
            .create();
        let delete = server
            .mock("DELETE", Matcher::Regex("^/api/v2/buckets/.*".to_string()))
            .expect(0)
            .create();
        let _org = server
            .mock("GET", "/api/v2/orgs")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"orgs":[{"id":"o1"}]}"#)
            .create();
        let create = server.mock("POST", "/api/v2/buckets").with_status(201).create();

        client_for(&server).reset_bucket("solar").unwrap();
        delete.assert();
        create.assert();
    }
}
