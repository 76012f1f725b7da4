//! Normalization of structured JSONL stream records into [`StreamEvent`]s,
//! plus per-pane session aggregation.
//!
//! Records are agent stream-json lines discriminated by `type` (and for
//! system records, `subtype`). Unrecognized record types are dropped.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::types::{
    CostInfo, SessionMetadata, StreamCategory, StreamEvent, TokenTotals, ToolInfo,
};

/// Extract the pane id from a stream file name of the form
/// `events-<paneId>.jsonl`.
pub fn pane_id_from_file_name(file_name: &str) -> Option<&str> {
    file_name
        .strip_prefix("events-")
        .and_then(|rest| rest.strip_suffix(".jsonl"))
        .filter(|pane| !pane.is_empty())
}

/// Translate one parsed record into a [`StreamEvent`].
///
/// Returns `None` for record types that carry no client-visible content
/// (hook internals other than start/response, replayed deltas of unknown
/// shape, queue bookkeeping).
pub fn normalize_record(
    record: &Value,
    pane_id: &str,
    session_id: &str,
    id: String,
    fallback_ts: DateTime<Utc>,
) -> Option<StreamEvent> {
    let record_type = record.get("type")?.as_str()?;
    let timestamp = record
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(fallback_ts);

    let mut event = StreamEvent {
        id,
        session_id: session_id.to_string(),
        pane_id: pane_id.to_string(),
        timestamp,
        original_type: record_type.to_string(),
        category: StreamCategory::System,
        content: String::new(),
        tool: None,
        cost: None,
        model: None,
    };

    match record_type {
        "system" => {
            let subtype = record.get("subtype").and_then(Value::as_str).unwrap_or("");
            match subtype {
                "init" => {
                    let model = record
                        .get("model")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown");
                    event.category = StreamCategory::System;
                    event.content = format!("Session initialized with model {model}");
                    event.model = Some(model.to_string());
                }
                "hook_started" | "hook_response" => {
                    event.category = StreamCategory::Hook;
                    event.content = record
                        .get("hook_name")
                        .and_then(Value::as_str)
                        .unwrap_or(subtype)
                        .to_string();
                }
                _ => return None,
            }
        }
        "stream_event" => {
            let inner = record.get("event")?;
            match inner.get("type").and_then(Value::as_str) {
                Some("content_block_start") => {
                    let block = inner.get("content_block")?;
                    if block.get("type").and_then(Value::as_str) != Some("tool_use") {
                        return None;
                    }
                    let name = block
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string();
                    event.category = StreamCategory::Tool;
                    event.content = format!("Using tool: {name}");
                    event.tool = Some(ToolInfo {
                        name,
                        status: "started".to_string(),
                        input: block.get("input").cloned(),
                    });
                }
                Some("content_block_delta") => {
                    let delta = inner.get("delta")?;
                    if delta.get("type").and_then(Value::as_str) != Some("text_delta") {
                        return None;
                    }
                    event.category = StreamCategory::Text;
                    event.content = delta
                        .get("text")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                }
                _ => return None,
            }
        }
        "result" => {
            event.category = StreamCategory::Result;
            event.content = record
                .get("result")
                .and_then(Value::as_str)
                .unwrap_or("Task completed")
                .to_string();
            let usage = record.get("usage");
            event.cost = Some(CostInfo {
                total_usd: record
                    .get("total_cost_usd")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0),
                input_tokens: usage
                    .and_then(|u| u.get("input_tokens"))
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
                output_tokens: usage
                    .and_then(|u| u.get("output_tokens"))
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
                duration_ms: record
                    .get("duration_ms")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
            });
        }
        "assistant" => {
            let text = assistant_text(record)?;
            event.category = StreamCategory::Text;
            event.content = text;
        }
        _ => return None,
    }

    if event.content.is_empty() && event.category != StreamCategory::Tool {
        return None;
    }
    Some(event)
}

/// Concatenated text blocks of an `assistant` record, if any.
fn assistant_text(record: &Value) -> Option<String> {
    let content = record.get("message")?.get("content")?.as_array()?;
    let parts: Vec<&str> = content
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|block| block.get("text").and_then(Value::as_str))
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(parts.join(""))
}

// ---------------------------------------------------------------------------
// Session aggregation
// ---------------------------------------------------------------------------

/// Per-pane session state built up from the stream path.
///
/// `init` records establish identity (session id, model, tools, cwd);
/// `result` records accumulate totals, which never decrease.
#[derive(Debug, Clone)]
pub struct SessionTracker {
    meta: SessionMetadata,
}

impl SessionTracker {
    pub fn new(pane_id: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            meta: SessionMetadata {
                session_id: String::new(),
                pane_id: pane_id.to_string(),
                model: String::new(),
                tools: Vec::new(),
                cwd: String::new(),
                started_at,
                total_cost: 0.0,
                total_tokens: TokenTotals::default(),
            },
        }
    }

    pub fn metadata(&self) -> &SessionMetadata {
        &self.meta
    }

    pub fn session_id(&self) -> &str {
        &self.meta.session_id
    }

    /// Apply one record. Returns true when the metadata changed.
    pub fn apply(&mut self, record: &Value) -> bool {
        let record_type = record.get("type").and_then(Value::as_str).unwrap_or("");
        match record_type {
            "system" if record.get("subtype").and_then(Value::as_str) == Some("init") => {
                if let Some(sid) = record.get("session_id").and_then(Value::as_str) {
                    self.meta.session_id = sid.to_string();
                }
                if let Some(model) = record.get("model").and_then(Value::as_str) {
                    self.meta.model = model.to_string();
                }
                if let Some(tools) = record.get("tools").and_then(Value::as_array) {
                    self.meta.tools = tools
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect();
                }
                if let Some(cwd) = record.get("cwd").and_then(Value::as_str) {
                    self.meta.cwd = cwd.to_string();
                }
                true
            }
            "result" => {
                let usage = record.get("usage");
                self.meta.total_cost += record
                    .get("total_cost_usd")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0)
                    .max(0.0);
                self.meta.total_tokens.input += usage
                    .and_then(|u| u.get("input_tokens"))
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                self.meta.total_tokens.output += usage
                    .and_then(|u| u.get("output_tokens"))
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                true
            }
            _ => false,
        }
    }
}
