//! Wire types shared across the backbone and its clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Serde helper: ISO-8601 timestamps with millisecond resolution.
///
/// Every timestamp that crosses the wire goes through this module so the
/// rendered form is stable regardless of the internal nanosecond precision.
pub mod ts_ms {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(de::Error::custom)
    }
}

/// Render a timestamp the way the wire expects it.
pub fn format_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

// ---------------------------------------------------------------------------
// Terminal events
// ---------------------------------------------------------------------------

/// Classification of a terminal event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Output,
    Question,
    Error,
    Status,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Output => "output",
            EventKind::Question => "question",
            EventKind::Error => "error",
            EventKind::Status => "status",
        }
    }

    /// Parse a wire string. Unknown values yield `None` (callers ignore
    /// invalid filter values rather than failing the request).
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "output" => Some(EventKind::Output),
            "question" => Some(EventKind::Question),
            "error" => Some(EventKind::Error),
            "status" => Some(EventKind::Status),
            _ => None,
        }
    }
}

/// A single selectable option inside an AskUserQuestion block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionOption {
    pub number: u32,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Structured metadata recovered from an AskUserQuestion prompt.
///
/// Validity implies a non-empty `header` and at least one option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionMetadata {
    pub header: String,
    pub question: String,
    pub options: Vec<QuestionOption>,
}

/// A normalized, ANSI-stripped event emitted by the delta detector.
///
/// `id` is unique within a process lifetime and stable once issued;
/// `timestamp` is the millisecond the underlying snapshot was captured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalEvent {
    pub id: String,
    pub project_id: String,
    pub pane_id: String,
    pub kind: EventKind,
    pub content: String,
    #[serde(with = "ts_ms")]
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question_metadata: Option<QuestionMetadata>,
}

// ---------------------------------------------------------------------------
// Structured stream events (JSONL path)
// ---------------------------------------------------------------------------

/// Category of a structured stream event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamCategory {
    Text,
    Tool,
    Hook,
    Result,
    System,
    Error,
}

/// Tool invocation details attached to `category = tool` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
}

/// Cost details attached to `category = result` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostInfo {
    pub total_usd: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub duration_ms: u64,
}

/// A normalized record from the structured JSONL ingestion path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    pub id: String,
    pub session_id: String,
    pub pane_id: String,
    #[serde(with = "ts_ms")]
    pub timestamp: DateTime<Utc>,
    /// Opaque passthrough of the source record's `type` field.
    pub original_type: String,
    pub category: StreamCategory,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<CostInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Input/output token totals for a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTotals {
    pub input: u64,
    pub output: u64,
}

/// Per-pane session metadata aggregated from the stream path.
///
/// Totals are monotonically non-decreasing for the life of the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: String,
    pub pane_id: String,
    pub model: String,
    pub tools: Vec<String>,
    pub cwd: String,
    #[serde(with = "ts_ms")]
    pub started_at: DateTime<Utc>,
    pub total_cost: f64,
    pub total_tokens: TokenTotals,
}

// ---------------------------------------------------------------------------
// Cost metrics (OTLP path)
// ---------------------------------------------------------------------------

/// One aggregated cost sample for a pane, summed over a single OTLP batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostMetric {
    pub pane_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub cost_usd: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    #[serde(with = "ts_ms")]
    pub timestamp: DateTime<Utc>,
}

/// Token counters inside [`CostTotals`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBreakdown {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_write: u64,
}

/// Running per-pane totals over all cost metrics seen so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostTotals {
    pub total_cost_usd: f64,
    pub total_tokens: TokenBreakdown,
    pub metric_count: u64,
    #[serde(with = "ts_ms")]
    pub first_at: DateTime<Utc>,
    #[serde(with = "ts_ms")]
    pub last_at: DateTime<Utc>,
}
