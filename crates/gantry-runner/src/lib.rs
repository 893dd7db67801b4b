//! Gantry execution engine.
//!
//! Turns a parsed [`Pipeline`] into running containers: one executor
//! task per job, coupled through single-use completion channels, with
//! events fanned out through the injected broadcaster.

pub mod container;
pub mod image;
pub mod job;
pub mod scheduler;
pub mod shell;

use container::ContainerRegistry;
use gantry_core::error::Result;
use gantry_core::pipeline::Pipeline;
use gantry_core::ports::ContainerApi;
use gantry_docker::DockerRuntime;
use gantry_events::EventBroadcaster;
use job::JobExecutor;
use scheduler::PipelineScheduler;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::warn;

/// Deadline for force-removing a container during shutdown.
const FORCE_REMOVE_TIMEOUT: Duration = Duration::from_secs(3);

/// Run a pipeline against the Docker runtime resolved from the
/// pipeline's `dockerHost` (or the environment when unset).
pub async fn run_pipeline(
    pipeline: Pipeline,
    broadcaster: EventBroadcaster,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let api: Arc<dyn ContainerApi> =
        Arc::new(DockerRuntime::connect(pipeline.docker_host.as_deref())?);
    run_pipeline_with(api, pipeline, broadcaster, shutdown).await
}

/// Run a pipeline against an injected runtime implementation.
pub async fn run_pipeline_with(
    api: Arc<dyn ContainerApi>,
    pipeline: Pipeline,
    broadcaster: EventBroadcaster,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let registry = ContainerRegistry::new();

    // While the pipeline runs, a watcher tears down any live containers
    // as soon as shutdown is signaled.
    let cleanup = tokio::spawn(remove_containers_on_shutdown(
        Arc::clone(&api),
        registry.clone(),
        shutdown.clone(),
    ));

    let cancelled = shutdown.clone();
    let executor = Arc::new(JobExecutor::new(
        api,
        broadcaster,
        registry,
        shutdown,
        pipeline.logs_with_time,
    ));

    let result = PipelineScheduler::new(executor).run(pipeline).await;

    // On a cancelled run, let the watcher finish tearing containers
    // down before returning; otherwise it has nothing left to do.
    if *cancelled.borrow() {
        let _ = cleanup.await;
    } else {
        cleanup.abort();
    }
    result
}

async fn remove_containers_on_shutdown(
    api: Arc<dyn ContainerApi>,
    registry: ContainerRegistry,
    mut shutdown: watch::Receiver<bool>,
) {
    wait_for_shutdown(&mut shutdown).await;

    for container_id in registry.drain() {
        match tokio::time::timeout(FORCE_REMOVE_TIMEOUT, api.container_remove(&container_id, true))
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(container = %container_id, error = %e, "Failed to force-remove container"),
            Err(_) => warn!(container = %container_id, "Timed out force-removing container"),
        }
    }
}

/// Resolve once the shutdown flag is raised. Never resolves if the
/// sender is dropped without signaling.
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    if *shutdown.borrow() {
        return;
    }
    loop {
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
        if *shutdown.borrow() {
            return;
        }
    }
}

/// Create the shutdown signal pair shared by the daemon, the HTTP
/// server and every executor.
pub fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Raise the shutdown flag when the process receives SIGINT or SIGTERM.
pub async fn shutdown_on_signal(shutdown: watch::Sender<bool>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    warn!("Shutdown signal received");
    let _ = shutdown.send(true);
}

/// Resolve once the shutdown flag is raised; public counterpart of the
/// engine-internal wait used by the daemon loop.
pub async fn shutdown_signaled(mut shutdown: watch::Receiver<bool>) {
    wait_for_shutdown(&mut shutdown).await;
}
