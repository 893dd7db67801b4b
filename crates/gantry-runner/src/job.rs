//! Per-job execution state machine.
//!
//! One executor task per job. Each attempt walks
//! gate → provision → create → copy-in → start → exec → copy-out →
//! stop → remove, and the whole attempt is wrapped by the job's retry
//! policy with exponential back-off. The job signals its terminal
//! outcome exactly once, on the completion channel handed out by the
//! scheduler.

use crate::container::{ContainerLifecycle, ContainerRegistry};
use crate::image::ImageProvisioner;
use crate::shell;
use crate::wait_for_shutdown;
use futures::StreamExt;
use gantry_core::condition::ConditionEvaluator;
use gantry_core::error::{Error, Result};
use gantry_core::events::EventType;
use gantry_core::pipeline::Job;
use gantry_core::ports::ContainerApi;
use gantry_events::{EventBroadcaster, JobLogger};
use serde_json::{Map, Value};
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::debug;

/// Terminal outcome of a job, signaled exactly once.
#[derive(Debug)]
pub enum JobOutcome {
    /// Scripts ran and the container lifecycle completed.
    Ok,
    /// Condition gate or upstream failure skipped the job; not an error.
    Skipped,
    Failed(Error),
}

impl JobOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, JobOutcome::Failed(_))
    }
}

/// Executes jobs against the runtime capability port.
pub struct JobExecutor {
    api: Arc<dyn ContainerApi>,
    broadcaster: EventBroadcaster,
    registry: ContainerRegistry,
    shutdown: watch::Receiver<bool>,
    logs_with_time: bool,
}

impl JobExecutor {
    pub fn new(
        api: Arc<dyn ContainerApi>,
        broadcaster: EventBroadcaster,
        registry: ContainerRegistry,
        shutdown: watch::Receiver<bool>,
        logs_with_time: bool,
    ) -> Self {
        Self {
            api,
            broadcaster,
            registry,
            shutdown,
            logs_with_time,
        }
    }

    /// Run one job to its terminal outcome.
    ///
    /// Blocks on the predecessor's completion first (when the scheduler
    /// coupled them); a failed predecessor skips this job rather than
    /// cascading a second error.
    pub async fn run(
        &self,
        job: Job,
        predecessor: Option<oneshot::Receiver<JobOutcome>>,
        done: oneshot::Sender<JobOutcome>,
    ) {
        let logger =
            JobLogger::with_deferred_stream(&job.name, self.logs_with_time, self.broadcaster.clone());

        if let Some(upstream) = predecessor {
            let upstream_outcome = upstream.await.unwrap_or_else(|_| {
                JobOutcome::Failed(Error::Internal(
                    "predecessor terminated without signaling".to_string(),
                ))
            });

            if upstream_outcome.is_failed() {
                logger.warning("Job skipped because the previous job failed");
                let mut data = Map::new();
                data.insert(
                    "reason".to_string(),
                    Value::String("predecessor_failed".to_string()),
                );
                logger.job_event(EventType::JobSkipped, data);
                let _ = done.send(JobOutcome::Skipped);
                return;
            }
        }

        if let Some(condition) = &job.condition {
            let evaluator = ConditionEvaluator::new();
            if !evaluator.evaluate(condition) {
                logger.warning(format!("Job skipped due to condition: {}", condition));
                let mut data = Map::new();
                data.insert("reason".to_string(), Value::String("condition".to_string()));
                data.insert("condition".to_string(), Value::String(condition.clone()));
                logger.job_event(EventType::JobSkipped, data);
                let _ = done.send(JobOutcome::Skipped);
                return;
            }
        }

        logger.job_event(EventType::JobStarted, Map::new());
        let outcome = self.run_with_retry(&job, &logger).await;
        let _ = done.send(outcome);
    }

    async fn run_with_retry(&self, job: &Job, logger: &JobLogger) -> JobOutcome {
        let retry = job.retry;

        for attempt in 1..=retry.max_attempts {
            match self.attempt(job, logger).await {
                Ok(()) => {
                    let mut data = Map::new();
                    data.insert("attempt".to_string(), Value::from(attempt));
                    logger.job_event(EventType::JobCompleted, data);
                    return JobOutcome::Ok;
                }
                Err(err) => {
                    let mut data = Map::new();
                    data.insert("attempt".to_string(), Value::from(attempt));
                    data.insert("error".to_string(), Value::String(err.to_string()));

                    let terminal =
                        matches!(err, Error::Cancelled) || attempt == retry.max_attempts;
                    if terminal {
                        if retry.max_attempts > 1 && !matches!(err, Error::Cancelled) {
                            logger.error(format!(
                                "Job failed after {} attempts",
                                retry.max_attempts
                            ));
                        }
                        // The terminal job_failed is the job's last event.
                        logger.job_event(EventType::JobFailed, data);
                        return JobOutcome::Failed(err);
                    }

                    logger.job_event(EventType::JobFailed, data);
                    let delay = retry.backoff_delay(attempt);
                    logger.warning(format!(
                        "Job failed (attempt {}/{}), retrying in {}s: {}",
                        attempt, retry.max_attempts, delay, err
                    ));
                    tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                }
            }
        }

        // The loop always returns: max_attempts is validated >= 1.
        JobOutcome::Failed(Error::Internal("retry loop exhausted".to_string()))
    }

    /// One traversal of the state machine, cut short by shutdown.
    async fn attempt(&self, job: &Job, logger: &JobLogger) -> Result<()> {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => Err(Error::Cancelled),
            result = self.attempt_inner(job, logger) => result,
        }
    }

    async fn attempt_inner(&self, job: &Job, logger: &JobLogger) -> Result<()> {
        let provisioner = ImageProvisioner::new(self.api.clone(), logger.clone());
        let lifecycle = ContainerLifecycle::new(self.api.clone(), logger.clone());

        let image = if let Some(recipe) = &job.dockerfile {
            let tag = job.custom_image_tag();
            provisioner.build_from_recipe(recipe, &tag).await?;
            tag
        } else if let Some(image) = &job.image {
            provisioner.ensure_available(image).await?;
            image.clone()
        } else {
            return Err(Error::Config(format!(
                "job '{}': either 'image' or 'dockerfile' must be specified",
                job.name
            )));
        };

        let container_id = lifecycle
            .create(&job.name, &image, &job.ports, &job.env)
            .await?;
        self.registry.register(&job.name, &container_id);
        debug!(job = %job.name, container = %container_id, "Container created");

        if job.copy_files {
            lifecycle
                .copy_in(&container_id, &job.work_dir, &job.copy_ignore)
                .await?;
        }

        logger.success("Starting the container");
        self.api.container_start(&container_id).await?;

        let mut data = Map::new();
        data.insert("container".to_string(), Value::String(container_id.clone()));
        data.insert("image".to_string(), Value::String(image));
        logger.job_event(EventType::ContainerStart, data);
        logger.open_stream();

        self.execute_scripts(job, &container_id, &lifecycle, logger)
            .await?;

        if let Some(artifact) = &job.artifact_path {
            let dst = std::env::current_dir()?;
            lifecycle.copy_out(&container_id, artifact, &dst).await?;
        }

        lifecycle.stop(&container_id).await?;
        lifecycle.remove(&container_id, false).await?;
        self.registry.deregister(&job.name);

        logger.success("Job ended");
        Ok(())
    }

    async fn execute_scripts(
        &self,
        job: &Job,
        container_id: &str,
        lifecycle: &ContainerLifecycle,
        logger: &JobLogger,
    ) -> Result<()> {
        let commands = shell::prepare_shell_commands(job.solo_execution, &job.script);

        for wrapped in &commands {
            let archive = shell::shell_to_tar(wrapped)?;
            self.api
                .copy_to_container(container_id, "/home/", archive)
                .await?;

            self.internal_exec(container_id, &job.work_dir, "chmod +x /home/shell_command.sh")
                .await?;

            self.command_runner(job, container_id, lifecycle, logger, wrapped)
                .await?;

            self.internal_exec(container_id, &job.work_dir, "rm /home/shell_command.sh")
                .await?;
        }

        Ok(())
    }

    /// Run one staged script via exec, streaming output and checking
    /// its exit code. A non-zero exit tears the container down and
    /// fails the attempt with the captured output.
    async fn command_runner(
        &self,
        job: &Job,
        container_id: &str,
        lifecycle: &ContainerLifecycle,
        logger: &JobLogger,
        wrapped: &str,
    ) -> Result<()> {
        if job.solo_execution {
            logger.info(format!("Execute command: {}", shell::unwrap_command(wrapped)));
        } else {
            logger.info("soloExecution disabled, shell command started!");
        }

        let cmd = split_command("sh /home/shell_command.sh");
        let exec_id = self
            .api
            .exec_create(container_id, cmd, &job.work_dir)
            .await?;

        let mut output = self.api.exec_attach(&exec_id).await?;
        while let Some(chunk) = output.next().await {
            let chunk = chunk?;
            logger.output(&String::from_utf8_lossy(&chunk));
        }

        let exit_code = self.api.exec_inspect(&exec_id).await?;

        if exit_code != 0 {
            logger.error("Command execution failed");

            let captured = self
                .fetch_command_log(container_id)
                .await
                .unwrap_or_default();
            if !captured.is_empty() {
                logger.error("Command Log:");
                logger.output(&captured);
            }

            let _ = self.api.container_kill(container_id, "KILL").await;
            lifecycle.stop(container_id).await?;
            lifecycle.remove(container_id, false).await?;
            self.registry.deregister(&job.name);

            return Err(Error::Script {
                exit_code,
                output: captured,
            });
        }

        logger.success("Command execution successful");

        if let Ok(captured) = self.fetch_command_log(container_id).await {
            if !captured.is_empty() {
                logger.success("Command Log:");
                logger.output(&captured);
            }
        }

        Ok(())
    }

    /// Housekeeping exec (chmod/rm); output is drained and the exit
    /// code ignored.
    async fn internal_exec(&self, container_id: &str, work_dir: &str, command: &str) -> Result<()> {
        let exec_id = self
            .api
            .exec_create(container_id, split_command(command), work_dir)
            .await?;

        let mut output = self.api.exec_attach(&exec_id).await?;
        while let Some(chunk) = output.next().await {
            chunk?;
        }

        self.api.exec_inspect(&exec_id).await?;
        Ok(())
    }

    /// Fetch the in-container capture file written by the wrapped script.
    async fn fetch_command_log(&self, container_id: &str) -> Result<String> {
        let archive = self
            .api
            .copy_from_container(container_id, shell::OUTPUT_LOG_PATH)
            .await?;

        let mut reader = tar::Archive::new(archive.as_slice());
        let mut entries = reader
            .entries()
            .map_err(|e| Error::Container(format!("Failed to read command log archive: {}", e)))?;

        let Some(entry) = entries.next() else {
            return Ok(String::new());
        };
        let mut entry =
            entry.map_err(|e| Error::Container(format!("Failed to read command log entry: {}", e)))?;

        let mut contents = String::new();
        entry
            .read_to_string(&mut contents)
            .map_err(|e| Error::Container(format!("Failed to read command log: {}", e)))?;
        Ok(contents)
    }
}

fn split_command(command: &str) -> Vec<String> {
    command.split(' ').map(str::to_string).collect()
}
