//! HTTP status and history endpoints.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use termdeck_core::types::{EventKind, TerminalEvent, format_ts};

use crate::hub::{HubHandle, SharedRing};
use crate::recovery::RecoveryReport;
use crate::store::{QueryOptions, SortOrder, StoreHandle};

/// History responses never exceed this many rows.
pub const MAX_HISTORY_LIMIT: usize = 1000;

#[derive(Clone)]
pub struct ApiState {
    pub ring: SharedRing,
    pub store: Option<StoreHandle>,
    pub recovery: Arc<RwLock<Option<RecoveryReport>>>,
    pub hub: HubHandle,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/events/history", get(history))
        .with_state(state)
}

/// Serve the API on an already-bound listener until cancelled. Binding
/// happens at startup so an unusable port is a fatal error there.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: ApiState,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(addr = %addr, "http api listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

/// `GET /status`
pub async fn status(State(state): State<ApiState>) -> impl IntoResponse {
    let recovery = state.recovery.read().await.clone();
    let (buffer_size, buffer_capacity) = {
        let ring = state.ring.read().await;
        (ring.len(), ring.capacity())
    };

    axum::Json(json!({
        "status": "ok",
        "timestamp": format_ts(Utc::now()),
        "recovery": {
            "complete": recovery.is_some(),
            "memoryOnlyMode": recovery.as_ref().map(|r| r.memory_only_mode).unwrap_or(false),
            "result": recovery,
        },
        "persistence": { "enabled": state.store.is_some() },
        "buffer": { "size": buffer_size, "capacity": buffer_capacity },
        "clients": state.hub.client_count().await,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryParams {
    pub project_id: Option<String>,
    pub pane_id: Option<String>,
    /// Event kind filter; invalid values are ignored.
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub since: Option<String>,
    pub after_id: Option<String>,
    pub order: Option<String>,
    pub limit: Option<usize>,
}

/// `GET /events/history`
pub async fn history(
    State(state): State<ApiState>,
    Query(params): Query<HistoryParams>,
) -> Response {
    let kind = params.kind.as_deref().and_then(EventKind::parse);
    let since = params
        .since
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));
    let limit = params.limit.unwrap_or(MAX_HISTORY_LIMIT).min(MAX_HISTORY_LIMIT);
    let order = match params.order.as_deref() {
        Some("desc") => SortOrder::Desc,
        _ => SortOrder::Asc,
    };

    let Some(store) = &state.store else {
        // Memory-only mode serves the ring buffer.
        let events = filter_ring(
            &state.ring.read().await.get_all(),
            &params,
            kind,
            since,
            limit,
            order,
        );
        let total = events.len();
        return axum::Json(json!({
            "events": events,
            "total": total,
            "hasMore": false,
            "source": "buffer",
        }))
        .into_response();
    };

    let options = QueryOptions {
        project_id: params.project_id.clone(),
        pane_id: params.pane_id.clone(),
        kind,
        since,
        after_id: params.after_id.clone(),
        limit,
        order,
    };

    match store.query(options).await {
        Some(Ok(result)) => axum::Json(json!({
            "events": result.events,
            "total": result.total,
            "hasMore": result.has_more,
            "source": "sqlite",
        }))
        .into_response(),
        Some(Err(e)) => {
            tracing::error!(error = %e, "history query failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                axum::Json(json!({ "error": "query failed" })),
            )
                .into_response()
        }
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(json!({ "error": "store unavailable" })),
        )
            .into_response(),
    }
}

fn filter_ring(
    events: &[TerminalEvent],
    params: &HistoryParams,
    kind: Option<EventKind>,
    since: Option<DateTime<Utc>>,
    limit: usize,
    order: SortOrder,
) -> Vec<TerminalEvent> {
    let after_idx = params
        .after_id
        .as_deref()
        .and_then(|id| events.iter().position(|e| e.id == id));

    let mut filtered: Vec<TerminalEvent> = events
        .iter()
        .enumerate()
        .filter(|(i, _)| after_idx.is_none_or(|a| *i > a))
        .map(|(_, e)| e)
        .filter(|e| {
            params
                .project_id
                .as_deref()
                .is_none_or(|p| e.project_id == p)
        })
        .filter(|e| params.pane_id.as_deref().is_none_or(|p| e.pane_id == p))
        .filter(|e| kind.is_none_or(|k| e.kind == k))
        .filter(|e| since.is_none_or(|s| e.timestamp > s))
        .cloned()
        .collect();

    if order == SortOrder::Desc {
        filtered.reverse();
    }
    filtered.truncate(limit);
    filtered
}
