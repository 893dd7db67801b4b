//! Pipeline scheduling: predecessor coupling and task fan-out.

use crate::job::{JobExecutor, JobOutcome};
use gantry_core::error::{Error, Result};
use gantry_core::pipeline::{Job, Pipeline};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

/// Compute each job's predecessor index.
///
/// Job `i` gates on job `i - 1` unless both are parallel; contiguous
/// parallel jobs run concurrently, and the first non-parallel job after
/// a parallel group synchronizes with the group's last member only.
pub fn previous_links(jobs: &[Job]) -> Vec<Option<usize>> {
    jobs.iter()
        .enumerate()
        .map(|(i, job)| {
            if i > 0 && (!job.parallel || !jobs[i - 1].parallel) {
                Some(i - 1)
            } else {
                None
            }
        })
        .collect()
}

/// Spawns one executor task per job and waits for the final job's
/// terminal outcome, which becomes the pipeline result.
pub struct PipelineScheduler {
    executor: Arc<JobExecutor>,
}

impl PipelineScheduler {
    pub fn new(executor: Arc<JobExecutor>) -> Self {
        Self { executor }
    }

    pub async fn run(&self, pipeline: Pipeline) -> Result<()> {
        if pipeline.jobs.is_empty() {
            return Ok(());
        }

        let links = previous_links(&pipeline.jobs);

        let mut senders = Vec::with_capacity(pipeline.jobs.len());
        let mut receivers: Vec<Option<oneshot::Receiver<JobOutcome>>> =
            Vec::with_capacity(pipeline.jobs.len());
        for _ in &pipeline.jobs {
            let (tx, rx) = oneshot::channel();
            senders.push(tx);
            receivers.push(Some(rx));
        }

        // The scheduler keeps the final job's completion; each coupled
        // job takes its predecessor's. Uncoupled completions are simply
        // dropped (their send is ignored).
        let last = receivers.len() - 1;
        let final_rx = receivers[last]
            .take()
            .ok_or_else(|| Error::Internal("final completion channel missing".to_string()))?;

        let predecessor_rxs: Vec<Option<oneshot::Receiver<JobOutcome>>> = links
            .iter()
            .map(|link| link.and_then(|p| receivers[p].take()))
            .collect();

        for ((job, done), predecessor) in pipeline
            .jobs
            .into_iter()
            .zip(senders)
            .zip(predecessor_rxs)
        {
            let executor = Arc::clone(&self.executor);

            debug!(job = %job.name, gated = predecessor.is_some(), "Spawning job executor");
            tokio::spawn(async move {
                executor.run(job, predecessor, done).await;
            });
        }

        match final_rx.await {
            Ok(JobOutcome::Failed(err)) => Err(err),
            Ok(_) => Ok(()),
            Err(_) => Err(Error::Internal(
                "final job terminated without signaling".to_string(),
            )),
        }
    }
}
