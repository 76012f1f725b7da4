//! Daemon configuration: a TOML file with CLI flag overrides.

use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Project tag stamped onto every terminal event.
    pub project_id: String,
    /// Bind address for all listeners.
    pub bind_addr: String,
    /// WebSocket hub port.
    pub ws_port: u16,
    /// Status/history HTTP port.
    pub http_port: u16,
    /// OTLP metrics receiver port.
    pub otlp_port: u16,
    /// External state document announcing pane membership.
    pub state_file: PathBuf,
    /// Directory of `events-*.jsonl` stream files.
    pub stream_dir: PathBuf,
    /// SQLite database path.
    pub db_path: PathBuf,
    /// Terminal poll tick in milliseconds.
    pub poll_interval_ms: u64,
    /// Ring log capacity.
    pub ring_capacity: usize,
    /// Retention: maximum stored events.
    pub max_events: u64,
    /// Retention: maximum event age in days.
    pub max_age_days: i64,
    /// How many events recovery loads back into the ring.
    pub max_events_to_load: usize,
    /// Send the buffered ring as a `sync` frame right after `connected`.
    pub sync_on_connect: bool,
    /// Skip persistence entirely.
    pub memory_only: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project_id: "default".into(),
            bind_addr: "127.0.0.1".into(),
            ws_port: 9800,
            http_port: 9801,
            otlp_port: crate::otlp::DEFAULT_OTLP_PORT,
            state_file: PathBuf::from(".termdeck/state.json"),
            stream_dir: PathBuf::from(".termdeck/streams"),
            db_path: PathBuf::from(".termdeck/events.db"),
            poll_interval_ms: 150,
            ring_capacity: crate::ring::DEFAULT_CAPACITY,
            max_events: crate::store::DEFAULT_MAX_EVENTS,
            max_age_days: crate::store::DEFAULT_MAX_AGE_DAYS,
            max_events_to_load: crate::recovery::DEFAULT_MAX_EVENTS_TO_LOAD,
            sync_on_connect: true,
            memory_only: false,
        }
    }
}

impl Config {
    /// Load from a TOML file; a missing `path` yields the defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                Ok(toml::from_str(&text)?)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn ws_addr(&self) -> anyhow::Result<std::net::SocketAddr> {
        Ok(format!("{}:{}", self.bind_addr, self.ws_port).parse()?)
    }

    pub fn http_addr(&self) -> anyhow::Result<std::net::SocketAddr> {
        Ok(format!("{}:{}", self.bind_addr, self.http_port).parse()?)
    }

    pub fn otlp_addr(&self) -> anyhow::Result<std::net::SocketAddr> {
        Ok(format!("{}:{}", self.bind_addr, self.otlp_port).parse()?)
    }
}
