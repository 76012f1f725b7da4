//! OTLP/HTTP JSON metrics receiver.
//!
//! Accepts OTLP export batches on `/v1/metrics`, keeps only the agent cost
//! metrics (`claude_code.cost.usage`, `claude_code.token.*`), folds them
//! into the [`CostAggregator`], and emits `cost_update` envelopes.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use termdeck_core::types::CostMetric;

use crate::cost::CostAggregator;
use crate::hub::HubHandle;

pub const DEFAULT_OTLP_PORT: u16 = 4318;

const COST_METRIC: &str = "claude_code.cost.usage";
const TOKEN_METRIC_PREFIX: &str = "claude_code.token.";

// ---------------------------------------------------------------------------
// OTLP JSON model (the subset this receiver reads)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportMetricsRequest {
    #[serde(default)]
    resource_metrics: Vec<ResourceMetrics>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceMetrics {
    #[serde(default)]
    resource: Resource,
    #[serde(default)]
    scope_metrics: Vec<ScopeMetrics>,
}

#[derive(Debug, Default, Deserialize)]
struct Resource {
    #[serde(default)]
    attributes: Vec<KeyValue>,
}

#[derive(Debug, Default, Deserialize)]
struct ScopeMetrics {
    #[serde(default)]
    metrics: Vec<Metric>,
}

#[derive(Debug, Default, Deserialize)]
struct Metric {
    #[serde(default)]
    name: String,
    sum: Option<DataPoints>,
    gauge: Option<DataPoints>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DataPoints {
    #[serde(default)]
    data_points: Vec<DataPoint>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DataPoint {
    as_double: Option<f64>,
    /// OTLP JSON renders int64 as a string; tolerate both.
    as_int: Option<Value>,
    time_unix_nano: Option<Value>,
    #[serde(default)]
    attributes: Vec<KeyValue>,
}

#[derive(Debug, Default, Deserialize)]
struct KeyValue {
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: AnyValue,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnyValue {
    string_value: Option<String>,
    bool_value: Option<bool>,
    int_value: Option<Value>,
    double_value: Option<f64>,
}

impl AnyValue {
    fn as_string(&self) -> Option<String> {
        if let Some(s) = &self.string_value {
            return Some(s.clone());
        }
        if let Some(b) = self.bool_value {
            return Some(b.to_string());
        }
        if let Some(i) = &self.int_value {
            return Some(value_to_i64(i)?.to_string());
        }
        self.double_value.map(|d| d.to_string())
    }
}

fn value_to_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn point_value(point: &DataPoint) -> f64 {
    if let Some(d) = point.as_double {
        return d;
    }
    point
        .as_int
        .as_ref()
        .and_then(value_to_i64)
        .map(|i| i as f64)
        .unwrap_or(0.0)
}

fn point_timestamp(point: &DataPoint) -> Option<DateTime<Utc>> {
    let nanos = point
        .time_unix_nano
        .as_ref()
        .and_then(value_to_i64)
        .filter(|n| *n > 0)?;
    Utc.timestamp_millis_opt(nanos / 1_000_000).single()
}

fn attribute<'a>(attrs: &'a [KeyValue], key: &str) -> Option<&'a AnyValue> {
    attrs.iter().find(|kv| kv.key == key).map(|kv| &kv.value)
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Pull one [`CostMetric`] per pane out of an export batch, summing the
/// batch's data points. Non-agent metrics are ignored; points without any
/// pane attribution are dropped.
fn extract_cost_metrics(request: &ExportMetricsRequest, now: DateTime<Utc>) -> Vec<CostMetric> {
    let mut per_pane: HashMap<String, CostMetric> = HashMap::new();

    for resource_metrics in &request.resource_metrics {
        let resource_attrs = &resource_metrics.resource.attributes;
        for scope in &resource_metrics.scope_metrics {
            for metric in &scope.metrics {
                if metric.name != COST_METRIC && !metric.name.starts_with(TOKEN_METRIC_PREFIX) {
                    continue;
                }
                let points = metric
                    .sum
                    .as_ref()
                    .or(metric.gauge.as_ref())
                    .map(|dp| dp.data_points.as_slice())
                    .unwrap_or_default();

                for point in points {
                    let pane_id = attribute(&point.attributes, "pane.id")
                        .or_else(|| attribute(resource_attrs, "pane.id"))
                        .and_then(AnyValue::as_string);
                    let Some(pane_id) = pane_id else {
                        tracing::debug!(metric = %metric.name, "otlp: point without pane.id, dropped");
                        continue;
                    };

                    let session_id = attribute(&point.attributes, "session.id")
                        .or_else(|| attribute(resource_attrs, "session.id"))
                        .and_then(AnyValue::as_string);

                    let entry = per_pane.entry(pane_id.clone()).or_insert_with(|| CostMetric {
                        pane_id,
                        session_id: None,
                        cost_usd: 0.0,
                        input_tokens: 0,
                        output_tokens: 0,
                        cache_read_tokens: 0,
                        cache_write_tokens: 0,
                        timestamp: now,
                    });
                    if entry.session_id.is_none() {
                        entry.session_id = session_id;
                    }

                    let value = point_value(point);
                    match metric.name.as_str() {
                        COST_METRIC => entry.cost_usd += value.max(0.0),
                        "claude_code.token.input" => entry.input_tokens += value.max(0.0) as u64,
                        "claude_code.token.output" => entry.output_tokens += value.max(0.0) as u64,
                        "claude_code.token.cache_read" => {
                            entry.cache_read_tokens += value.max(0.0) as u64;
                        }
                        "claude_code.token.cache_write" => {
                            entry.cache_write_tokens += value.max(0.0) as u64;
                        }
                        _ => {}
                    }

                    if let Some(ts) = point_timestamp(point) {
                        if ts > entry.timestamp || entry.timestamp == now {
                            entry.timestamp = ts;
                        }
                    }
                }
            }
        }
    }

    per_pane.into_values().collect()
}

// ---------------------------------------------------------------------------
// HTTP surface
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct OtlpState {
    pub aggregator: Arc<Mutex<CostAggregator>>,
    pub hub: HubHandle,
}

pub fn router(state: OtlpState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/v1/metrics", post(receive_metrics).options(preflight))
        .fallback(not_found)
        .with_state(state)
}

/// Serve the OTLP receiver on an already-bound listener until cancelled.
/// Binding happens at startup so an unusable port is a fatal error there.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: OtlpState,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(addr = %addr, "otlp receiver listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

async fn root() -> impl IntoResponse {
    axum::Json(json!({ "status": "ok" }))
}

async fn not_found() -> impl IntoResponse {
    StatusCode::NOT_FOUND
}

async fn preflight() -> Response {
    (
        StatusCode::NO_CONTENT,
        [
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            (header::ACCESS_CONTROL_ALLOW_METHODS, "POST, OPTIONS"),
            (header::ACCESS_CONTROL_ALLOW_HEADERS, "content-type"),
        ],
    )
        .into_response()
}

pub async fn receive_metrics(
    State(state): State<OtlpState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if content_type.contains("protobuf") {
        return (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            axum::Json(json!({ "error": "only application/json is accepted" })),
        )
            .into_response();
    }

    let request: ExportMetricsRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!(error = %e, "otlp: invalid payload");
            return (
                StatusCode::BAD_REQUEST,
                axum::Json(json!({ "error": format!("invalid json: {e}") })),
            )
                .into_response();
        }
    };

    let metrics = extract_cost_metrics(&request, Utc::now());
    if !metrics.is_empty() {
        let mut aggregator = state.aggregator.lock().await;
        for metric in &metrics {
            let totals = aggregator.ingest(metric);
            state.hub.broadcast_raw(
                "cost_update",
                json!({
                    "metric": metric,
                    "totals": totals,
                    "paneId": metric.pane_id,
                }),
            );
        }
    }

    (
        StatusCode::OK,
        [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
        axum::Json(json!({ "partialSuccess": {} })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(body: &str) -> ExportMetricsRequest {
        serde_json::from_str(body).expect("valid otlp json")
    }

    fn batch(pane: &str, cost: f64, input_tokens: i64) -> String {
        json!({
            "resourceMetrics": [{
                "resource": { "attributes": [
                    { "key": "service.name", "value": { "stringValue": "agent" } }
                ]},
                "scopeMetrics": [{
                    "metrics": [
                        {
                            "name": "claude_code.cost.usage",
                            "sum": { "dataPoints": [{
                                "asDouble": cost,
                                "timeUnixNano": "1750000000000000000",
                                "attributes": [
                                    { "key": "pane.id", "value": { "stringValue": pane } },
                                    { "key": "session.id", "value": { "stringValue": "s-1" } }
                                ]
                            }]}
                        },
                        {
                            "name": "claude_code.token.input",
                            "sum": { "dataPoints": [{
                                "asInt": input_tokens.to_string(),
                                "timeUnixNano": "1750000000000000000",
                                "attributes": [
                                    { "key": "pane.id", "value": { "stringValue": pane } }
                                ]
                            }]}
                        }
                    ]
                }]
            }]
        })
        .to_string()
    }

    #[test]
    fn extracts_cost_and_tokens_for_a_pane() {
        let request = parse(&batch("%0", 0.05, 1000));
        let metrics = extract_cost_metrics(&request, Utc::now());

        assert_eq!(metrics.len(), 1);
        let m = &metrics[0];
        assert_eq!(m.pane_id, "%0");
        assert_eq!(m.session_id.as_deref(), Some("s-1"));
        assert!((m.cost_usd - 0.05).abs() < 1e-9);
        assert_eq!(m.input_tokens, 1000);
        // timeUnixNano 1750000000000000000 ns = 1750000000000 ms.
        assert_eq!(m.timestamp.timestamp_millis(), 1_750_000_000_000);
    }

    #[test]
    fn non_claude_metrics_produce_nothing() {
        let body = json!({
            "resourceMetrics": [{
                "scopeMetrics": [{
                    "metrics": [{
                        "name": "http.server.duration",
                        "sum": { "dataPoints": [{
                            "asDouble": 12.0,
                            "attributes": [
                                { "key": "pane.id", "value": { "stringValue": "%0" } }
                            ]
                        }]}
                    }]
                }]
            }]
        })
        .to_string();
        let metrics = extract_cost_metrics(&parse(&body), Utc::now());
        assert!(metrics.is_empty());
    }

    #[test]
    fn pane_id_falls_back_to_resource_attribute() {
        let body = json!({
            "resourceMetrics": [{
                "resource": { "attributes": [
                    { "key": "pane.id", "value": { "stringValue": "%7" } }
                ]},
                "scopeMetrics": [{
                    "metrics": [{
                        "name": "claude_code.cost.usage",
                        "gauge": { "dataPoints": [{ "asDouble": 0.01 }] }
                    }]
                }]
            }]
        })
        .to_string();
        let metrics = extract_cost_metrics(&parse(&body), Utc::now());
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].pane_id, "%7");
    }

    #[test]
    fn points_without_pane_are_dropped() {
        let body = json!({
            "resourceMetrics": [{
                "scopeMetrics": [{
                    "metrics": [{
                        "name": "claude_code.cost.usage",
                        "sum": { "dataPoints": [{ "asDouble": 0.01 }] }
                    }]
                }]
            }]
        })
        .to_string();
        assert!(extract_cost_metrics(&parse(&body), Utc::now()).is_empty());
    }

    #[test]
    fn int_values_accept_number_and_string_forms() {
        assert_eq!(value_to_i64(&json!(42)), Some(42));
        assert_eq!(value_to_i64(&json!("42")), Some(42));
        assert_eq!(value_to_i64(&json!(true)), None);
    }

    #[tokio::test]
    async fn handler_status_codes() {
        let (frame_tx, _) = tokio::sync::broadcast::channel(16);
        let hub = crate::hub::test_support::handle_for_tests(frame_tx);
        let state = OtlpState {
            aggregator: Arc::new(Mutex::new(CostAggregator::new())),
            hub,
        };

        // Valid batch → 200 with partialSuccess.
        let resp = receive_metrics(
            State(state.clone()),
            HeaderMap::new(),
            Bytes::from(batch("%0", 0.05, 1000)),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        // Invalid JSON → 400.
        let resp = receive_metrics(
            State(state.clone()),
            HeaderMap::new(),
            Bytes::from_static(b"{broken"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        // Protobuf content type → 415.
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            "application/x-protobuf".parse().expect("header"),
        );
        let resp = receive_metrics(State(state.clone()), headers, Bytes::from_static(b""))
            .await;
        assert_eq!(resp.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn two_batches_accumulate_totals() {
        let (frame_tx, mut frame_rx) = tokio::sync::broadcast::channel(16);
        let hub = crate::hub::test_support::handle_for_tests(frame_tx);
        let state = OtlpState {
            aggregator: Arc::new(Mutex::new(CostAggregator::new())),
            hub,
        };

        for (cost, tokens) in [(0.05, 1000), (0.03, 500)] {
            let resp = receive_metrics(
                State(state.clone()),
                HeaderMap::new(),
                Bytes::from(batch("%0", cost, tokens)),
            )
            .await;
            assert_eq!(resp.status(), StatusCode::OK);
        }

        let aggregator = state.aggregator.lock().await;
        let totals = aggregator.totals_for("%0").expect("totals present");
        assert!((totals.total_cost_usd - 0.08).abs() < 1e-9);
        assert_eq!(totals.total_tokens.input, 1500);
        assert_eq!(totals.metric_count, 2);
        drop(aggregator);

        // Each batch produced exactly one cost_update envelope.
        let mut frames = 0;
        while let Ok(frame) = frame_rx.try_recv() {
            let v: Value = serde_json::from_str(&frame).expect("json");
            assert_eq!(v["type"], "cost_update");
            assert_eq!(v["payload"]["paneId"], "%0");
            frames += 1;
        }
        assert_eq!(frames, 2);
    }
}
