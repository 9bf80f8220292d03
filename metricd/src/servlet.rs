//! The HTTP query api, served under `/metrics`.
//!
//! - `GET /metrics` lists every known metric key
//! - `GET /metrics?key=<key>&from=..&until=..` returns the samples of one key
//! - `GET /metrics/<key>?from=..&until=..` is the same query with the key in the path
//!
//! Time bounds are unix seconds or RFC 3339 timestamps; a missing bound is open.

use chrono::prelude::*;
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize, Serializer};
use tide::{Body, Request, Response, StatusCode};

use metricd_core::{Label, Sample, TimeRange};
use metricd_storage::MetricService;

pub fn app(service: MetricService) -> tide::Server<MetricService> {
    let mut app = tide::with_state(service);
    app.at("/metrics").get(list_or_query);
    app.at("/metrics/:key").get(query_path);
    app
}

#[derive(Debug, Deserialize)]
struct QueryParams {
    key: Option<String>,
    from: Option<String>,
    until: Option<String>,
}

#[derive(Serialize)]
struct MetricList {
    metrics: Vec<String>,
}

#[derive(Serialize)]
struct SeriesBody<'a> {
    key: &'a str,
    samples: Vec<SampleBody<'a>>,
}

#[derive(Serialize)]
struct SampleBody<'a> {
    time: String,
    timestamp: i64,
    value: f64,
    #[serde(serialize_with = "serialize_labels")]
    labels: &'a [Label],
}

impl<'a> From<&'a Sample> for SampleBody<'a> {
    fn from(sample: &'a Sample) -> Self {
        SampleBody {
            time: sample
                .timestamp()
                .to_rfc3339_opts(SecondsFormat::Micros, true),
            timestamp: sample.timestamp_micros(),
            value: sample.value(),
            labels: sample.labels(),
        }
    }
}

/// Labels are written as a json object, keeping the order they were received in
fn serialize_labels<S: Serializer>(labels: &&[Label], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_map(labels.iter().map(|(name, value)| (name, value)))
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

async fn list_or_query(req: Request<MetricService>) -> tide::Result {
    let params = match req.query::<QueryParams>() {
        Ok(params) => params,
        Err(err) => return error_response(StatusCode::BadRequest, err.to_string()),
    };
    match &params.key {
        Some(key) => query_series(req.state(), key, &params).await,
        None => {
            let metrics = req.state().list_metrics().into_iter().collect();
            json_response(StatusCode::Ok, &MetricList { metrics })
        }
    }
}

async fn query_path(req: Request<MetricService>) -> tide::Result {
    let params = match req.query::<QueryParams>() {
        Ok(params) => params,
        Err(err) => return error_response(StatusCode::BadRequest, err.to_string()),
    };
    let key = req.param("key")?;
    query_series(req.state(), key, &params).await
}

async fn query_series(service: &MetricService, key: &str, params: &QueryParams) -> tide::Result {
    let range = match parse_range(params) {
        Ok(range) => range,
        Err(err) => return error_response(StatusCode::BadRequest, err),
    };
    match service.query(key, range).await {
        Ok(samples) => {
            let body = SeriesBody {
                key,
                samples: samples.iter().map(SampleBody::from).collect(),
            };
            json_response(StatusCode::Ok, &body)
        }
        Err(err) => {
            tracing::error!(key, "query failed: {}", err);
            error_response(StatusCode::InternalServerError, err.to_string())
        }
    }
}

fn parse_range(params: &QueryParams) -> Result<TimeRange, String> {
    let all = TimeRange::all();
    let from = match &params.from {
        Some(from) => parse_bound("from", from)?,
        None => all.start(),
    };
    let until = match &params.until {
        Some(until) => parse_bound("until", until)?,
        None => all.end(),
    };
    TimeRange::new(from, until).map_err(|err| err.to_string())
}

/// Parses a bound given as unix seconds or an RFC 3339 timestamp
fn parse_bound(name: &str, value: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(secs) = value.parse::<i64>() {
        return Utc
            .timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| format!("'{}' is out of range: {}", name, value));
    }
    DateTime::parse_from_rfc3339(value)
        .map(|time| time.with_timezone(&Utc))
        .map_err(|err| format!("invalid '{}' time '{}': {}", name, value, err))
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> tide::Result {
    Ok(Response::builder(status).body(Body::from_json(body)?).build())
}

fn error_response(status: StatusCode, error: String) -> tide::Result {
    json_response(status, &ErrorBody { error })
}
