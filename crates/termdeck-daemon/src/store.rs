//! SQLite persistence for the event backbone.
//!
//! [`Store`] owns the connection and the schema; [`StoreWriter`] is the
//! single-writer task draining an mpsc command channel so inserts never
//! block the emission path. Readers go through the same channel; WAL mode
//! keeps the database readable while the writer works.

use std::collections::VecDeque;
use std::path::Path;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{Connection, OptionalExtension, Result, params};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use termdeck_core::types::{
    EventKind, QuestionMetadata, SessionMetadata, StreamEvent, TerminalEvent, TokenTotals,
    format_ts,
};

/// Default retention: events older than this many days are pruned.
pub const DEFAULT_MAX_AGE_DAYS: i64 = 30;
/// Default retention: row-count cap after the age rule has run.
pub const DEFAULT_MAX_EVENTS: u64 = 10_000;

// ---------------------------------------------------------------------------
// Query options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    fn sql(self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub project_id: Option<String>,
    pub pane_id: Option<String>,
    pub kind: Option<EventKind>,
    /// Exclusive lower bound on timestamp.
    pub since: Option<DateTime<Utc>>,
    /// Resume point: rows strictly after `(timestamp, id)` of this event.
    pub after_id: Option<String>,
    pub limit: usize,
    pub order: SortOrder,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            project_id: None,
            pane_id: None,
            kind: None,
            since: None,
            after_id: None,
            limit: 1000,
            order: SortOrder::Asc,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryResult {
    pub events: Vec<TerminalEvent>,
    /// Count of all rows matching the filter, ignoring the limit.
    pub total: u64,
    /// Whether more rows than `limit` were available.
    pub has_more: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PruneStats {
    pub removed_by_age: usize,
    pub removed_by_cap: usize,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// SQLite-backed store for terminal events, stream events, and sessions.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) a database file and run migrations. The parent
    /// directory must already exist; failure here puts the process into
    /// memory-only mode.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.configure()?;
        store.migrate()?;
        Ok(store)
    }

    /// In-memory database. Useful for testing.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.configure()?;
        store.migrate()?;
        Ok(store)
    }

    /// WAL keeps readers concurrent with the single writer.
    fn configure(&self) -> Result<()> {
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.pragma_update(None, "synchronous", "NORMAL")?;
        self.conn.pragma_update(None, "cache_size", 10_000)?;
        self.conn.pragma_update(None, "temp_store", "MEMORY")?;
        Ok(())
    }

    fn migrate(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS events (
                id                 TEXT PRIMARY KEY,
                project_id         TEXT NOT NULL,
                pane_id            TEXT NOT NULL,
                kind               TEXT NOT NULL,
                content            TEXT NOT NULL,
                timestamp          TEXT NOT NULL,
                synced             INTEGER NOT NULL DEFAULT 0,
                question_metadata  TEXT,
                created_at         TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_ts ON events(timestamp, id);
            CREATE INDEX IF NOT EXISTS idx_events_pane ON events(pane_id);

            CREATE TABLE IF NOT EXISTS stream_events (
                id             TEXT PRIMARY KEY,
                session_id     TEXT NOT NULL,
                pane_id        TEXT NOT NULL,
                timestamp      TEXT NOT NULL,
                original_type  TEXT NOT NULL,
                category       TEXT NOT NULL,
                content        TEXT NOT NULL,
                tool_json      TEXT,
                cost_json      TEXT,
                model          TEXT,
                created_at     TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_stream_events_ts ON stream_events(timestamp, id);

            CREATE TABLE IF NOT EXISTS sessions (
                pane_id        TEXT PRIMARY KEY,
                session_id     TEXT NOT NULL,
                model          TEXT NOT NULL,
                tools_json     TEXT NOT NULL,
                cwd            TEXT NOT NULL,
                started_at     TEXT NOT NULL,
                total_cost     REAL NOT NULL,
                input_tokens   INTEGER NOT NULL,
                output_tokens  INTEGER NOT NULL,
                updated_at     TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    /// Upsert one event row. Same id overwrites, never duplicates.
    pub fn insert_event(&self, event: &TerminalEvent) -> Result<()> {
        let question_json = event
            .question_metadata
            .as_ref()
            .and_then(|qm| serde_json::to_string(qm).ok());
        self.conn.execute(
            "INSERT OR REPLACE INTO events
                (id, project_id, pane_id, kind, content, timestamp,
                 synced, question_metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8)",
            params![
                event.id,
                event.project_id,
                event.pane_id,
                event.kind.as_str(),
                event.content,
                format_ts(event.timestamp),
                question_json,
                format_ts(Utc::now()),
            ],
        )?;
        Ok(())
    }

    /// Insert a batch of events inside a single transaction.
    pub fn insert_events(&mut self, events: &[TerminalEvent]) -> Result<()> {
        let tx = self.conn.transaction()?;
        for event in events {
            let question_json = event
                .question_metadata
                .as_ref()
                .and_then(|qm| serde_json::to_string(qm).ok());
            tx.execute(
                "INSERT OR REPLACE INTO events
                    (id, project_id, pane_id, kind, content, timestamp,
                     synced, question_metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8)",
                params![
                    event.id,
                    event.project_id,
                    event.pane_id,
                    event.kind.as_str(),
                    event.content,
                    format_ts(event.timestamp),
                    question_json,
                    format_ts(Utc::now()),
                ],
            )?;
        }
        tx.commit()
    }

    pub fn insert_stream_event(&self, event: &StreamEvent) -> Result<()> {
        let tool_json = event.tool.as_ref().and_then(|t| serde_json::to_string(t).ok());
        let cost_json = event.cost.as_ref().and_then(|c| serde_json::to_string(c).ok());
        self.conn.execute(
            "INSERT OR REPLACE INTO stream_events
                (id, session_id, pane_id, timestamp, original_type,
                 category, content, tool_json, cost_json, model, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                event.id,
                event.session_id,
                event.pane_id,
                format_ts(event.timestamp),
                event.original_type,
                serde_variant(&event.category),
                event.content,
                tool_json,
                cost_json,
                event.model,
                format_ts(Utc::now()),
            ],
        )?;
        Ok(())
    }

    pub fn upsert_session(&self, meta: &SessionMetadata) -> Result<()> {
        let tools_json = serde_json::to_string(&meta.tools).unwrap_or_else(|_| "[]".into());
        self.conn.execute(
            "INSERT OR REPLACE INTO sessions
                (pane_id, session_id, model, tools_json, cwd, started_at,
                 total_cost, input_tokens, output_tokens, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                meta.pane_id,
                meta.session_id,
                meta.model,
                tools_json,
                meta.cwd,
                format_ts(meta.started_at),
                meta.total_cost,
                meta.total_tokens.input as i64,
                meta.total_tokens.output as i64,
                format_ts(Utc::now()),
            ],
        )?;
        Ok(())
    }

    pub fn load_session(&self, pane_id: &str) -> Result<Option<SessionMetadata>> {
        self.conn
            .query_row(
                "SELECT pane_id, session_id, model, tools_json, cwd, started_at,
                        total_cost, input_tokens, output_tokens
                 FROM sessions WHERE pane_id = ?1",
                params![pane_id],
                |row| {
                    let tools_json: String = row.get(3)?;
                    let started_at: String = row.get(5)?;
                    Ok(SessionMetadata {
                        pane_id: row.get(0)?,
                        session_id: row.get(1)?,
                        model: row.get(2)?,
                        tools: serde_json::from_str(&tools_json).unwrap_or_default(),
                        cwd: row.get(4)?,
                        started_at: parse_ts(&started_at),
                        total_cost: row.get(6)?,
                        total_tokens: TokenTotals {
                            input: row.get::<_, i64>(7)?.max(0) as u64,
                            output: row.get::<_, i64>(8)?.max(0) as u64,
                        },
                    })
                },
            )
            .optional()
    }

    /// Filtered query over the events table. `after_id` resumes strictly
    /// after the `(timestamp, id)` of the referenced event; an unknown
    /// reference id means no lower bound.
    pub fn query_events(&self, opts: &QueryOptions) -> Result<QueryResult> {
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(project_id) = &opts.project_id {
            clauses.push(format!("project_id = ?{}", args.len() + 1));
            args.push(Box::new(project_id.clone()));
        }
        if let Some(pane_id) = &opts.pane_id {
            clauses.push(format!("pane_id = ?{}", args.len() + 1));
            args.push(Box::new(pane_id.clone()));
        }
        if let Some(kind) = opts.kind {
            clauses.push(format!("kind = ?{}", args.len() + 1));
            args.push(Box::new(kind.as_str().to_string()));
        }
        if let Some(since) = opts.since {
            clauses.push(format!("timestamp > ?{}", args.len() + 1));
            args.push(Box::new(format_ts(since)));
        }
        if let Some(after_id) = &opts.after_id {
            let reference: Option<String> = self
                .conn
                .query_row(
                    "SELECT timestamp FROM events WHERE id = ?1",
                    params![after_id],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(ref_ts) = reference {
                clauses.push(format!(
                    "(timestamp > ?{n} OR (timestamp = ?{n} AND id > ?{m}))",
                    n = args.len() + 1,
                    m = args.len() + 2,
                ));
                args.push(Box::new(ref_ts));
                args.push(Box::new(after_id.clone()));
            }
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };

        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            args.iter().map(|a| a.as_ref()).collect();

        let total: u64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM events{where_sql}"),
            params_ref.as_slice(),
            |row| row.get::<_, i64>(0),
        )? as u64;

        let sql = format!(
            "SELECT id, project_id, pane_id, kind, content, timestamp, question_metadata
             FROM events{where_sql}
             ORDER BY timestamp {order}, id {order}
             LIMIT {limit}",
            order = opts.order.sql(),
            limit = opts.limit + 1,
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_ref.as_slice(), row_to_event)?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        let has_more = events.len() > opts.limit;
        events.truncate(opts.limit);

        Ok(QueryResult {
            events,
            total,
            has_more,
        })
    }

    /// The `limit` most recent events, returned in chronological order.
    /// Used by recovery to rebuild the ring log.
    pub fn recent_events(&self, limit: usize) -> Result<Vec<TerminalEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, project_id, pane_id, kind, content, timestamp, question_metadata
             FROM events ORDER BY timestamp DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], row_to_event)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        events.reverse();
        Ok(events)
    }

    /// Recent stream-event ids, newest first. Seeds the seen-id set so
    /// structured files re-read from offset zero after a restart do not
    /// re-broadcast.
    pub fn recent_stream_event_ids(&self, limit: usize) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT id FROM stream_events ORDER BY timestamp DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    pub fn event_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Apply retention: first the age rule, then the row-count cap (oldest
    /// rows by `(timestamp, id)` go first). Both tables are pruned.
    pub fn prune(&self, max_age_days: i64, max_events: u64) -> Result<PruneStats> {
        let cutoff = format_ts(Utc::now() - ChronoDuration::days(max_age_days));
        let mut stats = PruneStats::default();

        for table in ["events", "stream_events"] {
            stats.removed_by_age += self.conn.execute(
                &format!("DELETE FROM {table} WHERE timestamp < ?1"),
                params![cutoff],
            )?;

            let count: i64 = self
                .conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
            let excess = (count as u64).saturating_sub(max_events);
            if excess > 0 {
                stats.removed_by_cap += self.conn.execute(
                    &format!(
                        "DELETE FROM {table} WHERE id IN
                         (SELECT id FROM {table} ORDER BY timestamp ASC, id ASC LIMIT ?1)"
                    ),
                    params![excess as i64],
                )?;
            }
        }

        Ok(stats)
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<TerminalEvent> {
    let kind_str: String = row.get(3)?;
    let ts_str: String = row.get(5)?;
    let question_json: Option<String> = row.get(6)?;
    let question_metadata: Option<QuestionMetadata> = question_json
        .as_deref()
        .and_then(|s| serde_json::from_str(s).ok());
    Ok(TerminalEvent {
        id: row.get(0)?,
        project_id: row.get(1)?,
        pane_id: row.get(2)?,
        kind: EventKind::parse(&kind_str).unwrap_or(EventKind::Output),
        content: row.get(4)?,
        timestamp: parse_ts(&ts_str),
        question_metadata,
    })
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn serde_variant<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Writer task
// ---------------------------------------------------------------------------

pub enum StoreCommand {
    InsertEvent(TerminalEvent),
    InsertStreamEvent(StreamEvent),
    UpsertSession(SessionMetadata),
    Query {
        options: QueryOptions,
        reply: oneshot::Sender<Result<QueryResult>>,
    },
    EventCount {
        reply: oneshot::Sender<Result<u64>>,
    },
}

/// Cheap, cloneable handle for scheduling store work. Sends never block;
/// inserts are deferred to the writer task.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::UnboundedSender<StoreCommand>,
}

impl StoreHandle {
    pub fn insert_event(&self, event: TerminalEvent) {
        let _ = self.tx.send(StoreCommand::InsertEvent(event));
    }

    pub fn insert_stream_event(&self, event: StreamEvent) {
        let _ = self.tx.send(StoreCommand::InsertStreamEvent(event));
    }

    pub fn upsert_session(&self, meta: SessionMetadata) {
        let _ = self.tx.send(StoreCommand::UpsertSession(meta));
    }

    pub async fn query(&self, options: QueryOptions) -> Option<Result<QueryResult>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::Query { options, reply }).ok()?;
        rx.await.ok()
    }

    pub async fn event_count(&self) -> Option<Result<u64>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::EventCount { reply }).ok()?;
        rx.await.ok()
    }
}

/// Retention settings for the writer's background pruning.
#[derive(Debug, Clone, Copy)]
pub struct Retention {
    pub max_age_days: i64,
    pub max_events: u64,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            max_age_days: DEFAULT_MAX_AGE_DAYS,
            max_events: DEFAULT_MAX_EVENTS,
        }
    }
}

/// Single-writer task owning the [`Store`]. Drains the command channel,
/// batching consecutive event inserts into one transaction. A prune is
/// scheduled by every insert; the single-task discipline means at most one
/// prune ever runs at a time.
pub struct StoreWriter {
    store: Store,
    rx: mpsc::UnboundedReceiver<StoreCommand>,
    retention: Retention,
    cancel: CancellationToken,
}

impl StoreWriter {
    pub fn new(store: Store, retention: Retention, cancel: CancellationToken) -> (Self, StoreHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                store,
                rx,
                retention,
                cancel,
            },
            StoreHandle { tx },
        )
    }

    pub async fn run(mut self) {
        tracing::info!("store writer started");
        loop {
            tokio::select! {
                cmd = self.rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            let mut batch = VecDeque::new();
                            batch.push_back(cmd);
                            // Drain whatever queued while we were away.
                            while let Ok(next) = self.rx.try_recv() {
                                batch.push_back(next);
                            }
                            self.process(batch);
                        }
                        None => {
                            tracing::info!("store writer: channel closed, stopping");
                            break;
                        }
                    }
                }
                _ = self.cancel.cancelled() => {
                    // Drain remaining commands before exit so shutdown does
                    // not drop acknowledged inserts.
                    let mut batch = VecDeque::new();
                    while let Ok(next) = self.rx.try_recv() {
                        batch.push_back(next);
                    }
                    if !batch.is_empty() {
                        self.process(batch);
                    }
                    tracing::info!("store writer: cancellation requested, stopping");
                    break;
                }
            }
        }
    }

    fn process(&mut self, mut batch: VecDeque<StoreCommand>) {
        let mut events: Vec<TerminalEvent> = Vec::new();
        let mut prune_scheduled = false;

        while let Some(cmd) = batch.pop_front() {
            match cmd {
                StoreCommand::InsertEvent(event) => {
                    events.push(event);
                    prune_scheduled = true;
                }
                StoreCommand::InsertStreamEvent(event) => {
                    if let Err(e) = self.store.insert_stream_event(&event) {
                        tracing::error!(id = %event.id, error = %e, "stream event insert failed");
                    }
                    prune_scheduled = true;
                }
                StoreCommand::UpsertSession(meta) => {
                    if let Err(e) = self.store.upsert_session(&meta) {
                        tracing::error!(pane_id = %meta.pane_id, error = %e, "session upsert failed");
                    }
                }
                StoreCommand::Query { options, reply } => {
                    // Reads must observe inserts queued ahead of them.
                    self.flush_events(&mut events);
                    let _ = reply.send(self.store.query_events(&options));
                }
                StoreCommand::EventCount { reply } => {
                    self.flush_events(&mut events);
                    let _ = reply.send(self.store.event_count());
                }
            }
        }

        self.flush_events(&mut events);

        if prune_scheduled {
            match self
                .store
                .prune(self.retention.max_age_days, self.retention.max_events)
            {
                Ok(stats) if stats.removed_by_age + stats.removed_by_cap > 0 => {
                    tracing::debug!(
                        by_age = stats.removed_by_age,
                        by_cap = stats.removed_by_cap,
                        "pruned old events"
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "prune failed"),
            }
        }
    }

    fn flush_events(&mut self, events: &mut Vec<TerminalEvent>) {
        if events.is_empty() {
            return;
        }
        if let Err(e) = self.store.insert_events(events) {
            tracing::error!(count = events.len(), error = %e, "event batch insert failed");
        }
        events.clear();
    }
}
