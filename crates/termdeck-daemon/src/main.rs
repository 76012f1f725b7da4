use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_util::sync::CancellationToken;

use termdeck_term::TermExecutor;

use termdeck_daemon::config::Config;
use termdeck_daemon::cost::CostAggregator;
use termdeck_daemon::http_api::{self, ApiState};
use termdeck_daemon::hub::Hub;
use termdeck_daemon::otlp::{self, OtlpState};
use termdeck_daemon::pipeline::Pipeline;
use termdeck_daemon::recovery::RecoveryManager;
use termdeck_daemon::ring::RingLog;
use termdeck_daemon::sources::poller::Poller;
use termdeck_daemon::sources::state_watcher::StateWatcher;
use termdeck_daemon::sources::tailer::StreamTailer;
use termdeck_daemon::store::{Retention, Store, StoreWriter};

#[derive(Parser)]
#[command(name = "termdeck", about = "Event backbone for agent terminal dashboards")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the backbone daemon (default when no subcommand given)
    Serve {
        /// Path to a TOML config file
        #[arg(long)]
        config: Option<PathBuf>,

        /// External state document announcing pane membership
        #[arg(long)]
        state_file: Option<PathBuf>,

        /// Directory of events-*.jsonl stream files
        #[arg(long)]
        stream_dir: Option<PathBuf>,

        /// SQLite database path
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// WebSocket hub port
        #[arg(long)]
        ws_port: Option<u16>,

        /// Status/history HTTP port
        #[arg(long)]
        http_port: Option<u16>,

        /// OTLP metrics receiver port
        #[arg(long)]
        otlp_port: Option<u16>,

        /// Terminal poll tick in milliseconds
        #[arg(long)]
        poll_interval_ms: Option<u64>,

        /// Project tag stamped onto every terminal event
        #[arg(long)]
        project_id: Option<String>,

        /// Skip persistence entirely
        #[arg(long)]
        memory_only: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Respects RUST_LOG, defaults to info.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match cli.command {
        None => Config::load(None)?,
        Some(Commands::Serve {
            config,
            state_file,
            stream_dir,
            db_path,
            ws_port,
            http_port,
            otlp_port,
            poll_interval_ms,
            project_id,
            memory_only,
        }) => {
            let mut cfg = Config::load(config.as_deref())?;
            if let Some(v) = state_file {
                cfg.state_file = v;
            }
            if let Some(v) = stream_dir {
                cfg.stream_dir = v;
            }
            if let Some(v) = db_path {
                cfg.db_path = v;
            }
            if let Some(v) = ws_port {
                cfg.ws_port = v;
            }
            if let Some(v) = http_port {
                cfg.http_port = v;
            }
            if let Some(v) = otlp_port {
                cfg.otlp_port = v;
            }
            if let Some(v) = poll_interval_ms {
                cfg.poll_interval_ms = v;
            }
            if let Some(v) = project_id {
                cfg.project_id = v;
            }
            if memory_only {
                cfg.memory_only = true;
            }
            cfg
        }
    };

    run_serve(config).await
}

async fn run_serve(config: Config) -> anyhow::Result<()> {
    tracing::info!(
        project_id = %config.project_id,
        ws_port = config.ws_port,
        http_port = config.http_port,
        otlp_port = config.otlp_port,
        state_file = %config.state_file.display(),
        stream_dir = %config.stream_dir.display(),
        db_path = %config.db_path.display(),
        "starting termdeck daemon"
    );

    // Unusable ports are fatal startup errors; bind everything up front.
    let ws_listener = TcpListener::bind(config.ws_addr()?).await?;
    let http_listener = TcpListener::bind(config.http_addr()?).await?;
    let otlp_listener = TcpListener::bind(config.otlp_addr()?).await?;

    // Independent tokens so teardown can run in order:
    // hub -> sources -> pipeline (detector) -> store.
    let hub_cancel = CancellationToken::new();
    let sources_cancel = CancellationToken::new();
    let pipeline_cancel = CancellationToken::new();
    let store_cancel = CancellationToken::new();

    // -----------------------------------------------------------------
    // 1. Durable store (or memory-only fallback) and recovery
    // -----------------------------------------------------------------
    let ring = Arc::new(RwLock::new(RingLog::new(config.ring_capacity)));
    let manager = RecoveryManager::new(config.max_events_to_load);
    let seen = manager.seen();

    let (store, open_error) = if config.memory_only {
        (None, None)
    } else {
        if let Some(parent) = config.db_path.parent() {
            // May fail on an unwritable tree; Store::open reports it next.
            let _ = std::fs::create_dir_all(parent);
        }
        match Store::open(&config.db_path) {
            Ok(store) => (Some(store), None),
            Err(e) => (None, Some(e.to_string())),
        }
    };

    let report = {
        let mut ring_guard = ring.write().await;
        manager.recover(store.as_ref(), &mut ring_guard, open_error).await
    };
    let memory_only = report.memory_only_mode;

    let (store_handle, store_task) = match store {
        Some(store) => {
            let retention = Retention {
                max_age_days: config.max_age_days,
                max_events: config.max_events,
            };
            let (writer, handle) = StoreWriter::new(store, retention, store_cancel.clone());
            (Some(handle), Some(tokio::spawn(writer.run())))
        }
        None => (None, None),
    };

    // -----------------------------------------------------------------
    // 2. Broadcast hub
    // -----------------------------------------------------------------
    let hub = Hub::new(
        config.ws_addr()?,
        Arc::clone(&ring),
        config.sync_on_connect,
        hub_cancel.clone(),
    );
    let hub_handle = hub.handle();
    let hub_task = tokio::spawn(async move {
        if let Err(e) = hub.accept_loop(ws_listener).await {
            tracing::error!("hub failed: {e}");
        }
    });

    // A degraded start is announced once, after initial clients have had a
    // moment to connect.
    if memory_only {
        let warn_handle = hub_handle.clone();
        let warn_report = report.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            warn_handle.broadcast_raw(
                "recovery_warning",
                serde_json::json!({
                    "mode": "memory_only",
                    "message": "persistence unavailable; events are not being stored",
                    "details": warn_report,
                }),
            );
        });
    }

    // -----------------------------------------------------------------
    // 3. Pipeline and sources
    // -----------------------------------------------------------------
    let (source_tx, source_rx) = mpsc::channel(256);

    let executor = Arc::new(TermExecutor::new());
    let (poller, poller_handle) = Poller::new(
        executor,
        source_tx.clone(),
        Duration::from_millis(config.poll_interval_ms),
        sources_cancel.clone(),
    );

    let mut pipeline = Pipeline::new(
        source_rx,
        &config.project_id,
        Arc::clone(&ring),
        store_handle.clone(),
        seen,
        hub_handle.clone(),
        poller_handle,
        pipeline_cancel.clone(),
    );
    let pipeline_task = tokio::spawn(async move { pipeline.run().await });

    let poller_task = tokio::spawn(async move { poller.run().await });

    let watcher = StateWatcher::new(
        config.state_file.clone(),
        source_tx.clone(),
        sources_cancel.clone(),
    );
    let watcher_task = tokio::spawn(async move {
        if let Err(e) = watcher.run().await {
            tracing::error!("state watcher failed: {e}");
        }
    });

    let _ = std::fs::create_dir_all(&config.stream_dir);
    let tailer = StreamTailer::new(
        config.stream_dir.clone(),
        source_tx.clone(),
        sources_cancel.clone(),
    )?;
    let tailer_task = tokio::spawn(async move {
        if let Err(e) = tailer.run().await {
            tracing::error!("stream tailer failed: {e}");
        }
    });

    // -----------------------------------------------------------------
    // 4. HTTP surfaces
    // -----------------------------------------------------------------
    let recovery_shared = Arc::new(RwLock::new(Some(report)));
    let api_state = ApiState {
        ring: Arc::clone(&ring),
        store: store_handle.clone(),
        recovery: Arc::clone(&recovery_shared),
        hub: hub_handle.clone(),
    };
    let http_cancel = hub_cancel.clone();
    let http_task = tokio::spawn(async move {
        if let Err(e) = http_api::serve(http_listener, api_state, http_cancel).await {
            tracing::error!("http api failed: {e}");
        }
    });

    let otlp_state = OtlpState {
        aggregator: Arc::new(Mutex::new(CostAggregator::new())),
        hub: hub_handle.clone(),
    };
    let otlp_cancel = hub_cancel.clone();
    let otlp_task = tokio::spawn(async move {
        if let Err(e) = otlp::serve(otlp_listener, otlp_state, otlp_cancel).await {
            tracing::error!("otlp receiver failed: {e}");
        }
    });

    tracing::info!("all components started");

    tokio::signal::ctrl_c().await?;
    tracing::info!("received ctrl-c, shutting down");

    // Ordered teardown with a short drain window per stage.
    hub_cancel.cancel();
    for task in [hub_task, http_task, otlp_task] {
        let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
    }

    sources_cancel.cancel();
    for task in [poller_task, watcher_task, tailer_task] {
        let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
    }

    pipeline_cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(2), pipeline_task).await;

    store_cancel.cancel();
    if let Some(task) = store_task {
        let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
    }

    tracing::info!("termdeck daemon stopped");
    Ok(())
}
