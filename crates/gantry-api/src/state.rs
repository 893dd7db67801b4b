//! Application state shared across handlers.

use futures::future::BoxFuture;
use gantry_core::error::{Error, Result};
use gantry_core::events::{Event, EventType};
use gantry_events::EventBroadcaster;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::error;

/// Callback that runs a pipeline from raw YAML bytes.
pub type PipelineExecutor =
    Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Application state shared across all handlers.
pub struct AppState {
    pub broadcaster: EventBroadcaster,
    executor: Option<PipelineExecutor>,
    // Triggers are single-flight: one pipeline at a time per process.
    run_lock: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(broadcaster: EventBroadcaster, executor: Option<PipelineExecutor>) -> Self {
        Self {
            broadcaster,
            executor,
            run_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Run a pipeline in the background and emit its terminal event
    /// (`pipeline_complete` or `pipeline_error`). Fails immediately if
    /// no executor callback is configured.
    pub fn spawn_pipeline(&self, yaml: Vec<u8>) -> Result<()> {
        let executor = self
            .executor
            .clone()
            .ok_or_else(|| Error::Internal("pipeline executor not configured".to_string()))?;

        let broadcaster = self.broadcaster.clone();
        let run_lock = Arc::clone(&self.run_lock);

        tokio::spawn(async move {
            let _guard = run_lock.lock().await;

            match executor(yaml).await {
                Ok(()) => {
                    broadcaster.broadcast(Event::message(
                        EventType::PipelineComplete,
                        "Pipeline execution completed successfully",
                    ));
                }
                Err(e) => {
                    error!(error = %e, "Pipeline execution failed");
                    let mut data = Map::new();
                    data.insert(
                        "message".to_string(),
                        Value::String("Pipeline execution failed".to_string()),
                    );
                    data.insert("error".to_string(), Value::String(e.to_string()));
                    broadcaster.broadcast(Event::new(EventType::PipelineError, data));
                }
            }
        });

        Ok(())
    }

    /// Resolve once no pipeline is in flight.
    pub async fn drain(&self) {
        let _guard = self.run_lock.lock().await;
    }
}
