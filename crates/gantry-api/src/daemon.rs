//! Daemon loop: HTTP server lifecycle, signal handling and graceful
//! shutdown.

use crate::state::{AppState, PipelineExecutor};
use crate::{ServerConfig, build_app};
use futures::FutureExt;
use gantry_core::error::{Error, Result};
use gantry_core::events::{Event, EventType};
use gantry_events::EventBroadcaster;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Grace window for draining the HTTP server and in-flight pipelines.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Clone, Default)]
pub struct DaemonConfig {
    pub server: ServerConfig,
}

/// Run the daemon until a termination signal arrives.
///
/// Starts the HTTP listener, emits `daemon_start`, optionally schedules
/// an initial pipeline file, and on SIGINT/SIGTERM emits `daemon_stop`,
/// drains the server and any in-flight pipeline within the grace
/// window, and closes the broadcaster.
pub async fn run_daemon(config: DaemonConfig, initial_file: Option<PathBuf>) -> Result<()> {
    let broadcaster = EventBroadcaster::new();
    let (shutdown_tx, shutdown_rx) = gantry_runner::shutdown_channel();

    tokio::spawn(gantry_runner::shutdown_on_signal(shutdown_tx));

    let executor = pipeline_executor(broadcaster.clone(), shutdown_rx.clone());
    let state = Arc::new(AppState::new(broadcaster.clone(), Some(executor)));

    let addr = config.server.addr();
    let listener = TcpListener::bind(&addr).await.map_err(Error::Io)?;
    info!(addr = %addr, "Daemon listening");

    // The server gets its own stop signal so daemon_stop goes out
    // before connections begin to drain.
    let (server_stop_tx, mut server_stop_rx) = watch::channel(false);
    let app = build_app(Arc::clone(&state));
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_stop_rx.changed().await;
            })
            .await
    });

    let mut data = Map::new();
    data.insert(
        "message".to_string(),
        Value::String("Gantry daemon started successfully".to_string()),
    );
    data.insert(
        "sse_endpoint".to_string(),
        Value::String(format!("http://localhost:{}/events", config.server.port)),
    );
    data.insert(
        "health_endpoint".to_string(),
        Value::String(format!("http://localhost:{}/health", config.server.port)),
    );
    broadcaster.broadcast(Event::new(EventType::DaemonStart, data));

    if let Some(path) = initial_file {
        info!(file = %path.display(), "Scheduling initial pipeline");
        match std::fs::read(&path) {
            Ok(yaml) => {
                if let Err(e) = state.spawn_pipeline(yaml) {
                    error!(error = %e, "Failed to schedule initial pipeline");
                }
            }
            Err(e) => {
                error!(file = %path.display(), error = %e, "Failed to read initial pipeline file");
            }
        }
    }

    gantry_runner::shutdown_signaled(shutdown_rx).await;
    info!("Received shutdown signal, gracefully shutting down");

    broadcaster.broadcast(Event::message(
        EventType::DaemonStop,
        "Gantry daemon shutting down",
    ));

    let deadline = Instant::now() + SHUTDOWN_GRACE;
    let _ = server_stop_tx.send(true);
    if tokio::time::timeout(SHUTDOWN_GRACE, server).await.is_err() {
        warn!("HTTP server did not drain within the grace window");
    }

    broadcaster.close();

    let remaining = deadline.saturating_duration_since(Instant::now());
    if tokio::time::timeout(remaining, state.drain()).await.is_err() {
        warn!("A pipeline was still in flight when the grace window elapsed");
    }

    info!("Daemon stopped");
    Ok(())
}

/// The trigger endpoint's executor callback: parse the YAML and run the
/// pipeline with the daemon's broadcaster and shutdown signal.
fn pipeline_executor(
    broadcaster: EventBroadcaster,
    shutdown: watch::Receiver<bool>,
) -> PipelineExecutor {
    Arc::new(move |yaml: Vec<u8>| {
        let broadcaster = broadcaster.clone();
        let shutdown = shutdown.clone();
        async move {
            let pipeline = gantry_core::config::parse_pipeline(&yaml)?;
            gantry_runner::run_pipeline(pipeline, broadcaster, shutdown).await
        }
        .boxed()
    })
}
