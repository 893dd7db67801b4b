//! Engine tests against a fake container runtime.
//!
//! The fake records every runtime call and scripts exec exit codes, so
//! scheduling, retry and cancellation behavior is fully deterministic.

use async_trait::async_trait;
use futures::stream;
use gantry_core::error::{Error, Result};
use gantry_core::events::{Event, EventType};
use gantry_core::pipeline::{Job, Pipeline, RetryPolicy};
use gantry_core::ports::{
    BuildProgress, ContainerApi, ContainerSpec, ImageSummary, ProgressStream, PullProgress,
};
use gantry_events::{EventBroadcaster, SUBSCRIBER_BUFFER};
use gantry_runner::{run_pipeline_with, shutdown_channel};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Default)]
struct FakeRuntime {
    /// Images that are already present locally.
    local_images: Vec<String>,
    /// Exit codes handed out to script execs, in order. Empty means
    /// every script succeeds.
    script_exits: Mutex<VecDeque<i64>>,
    /// Bytes streamed from a script exec attach.
    exec_output: Vec<u8>,
    /// Delay before the script exec output is produced.
    exec_delay: Duration,

    /// Fail image pulls with a runtime error.
    fail_pull: bool,
    /// Emit an error line from image builds.
    fail_build: bool,

    exec_cmds: Mutex<HashMap<String, String>>,
    exec_seq: AtomicUsize,
    create_count: AtomicUsize,
    script_inspects: AtomicUsize,
    pull_count: AtomicUsize,
    force_removes: AtomicUsize,
    last_spec: Mutex<Option<ContainerSpec>>,
}

impl FakeRuntime {
    fn with_image(image: &str) -> Self {
        Self {
            local_images: vec![image.to_string()],
            exec_output: b"hi\n".to_vec(),
            ..Default::default()
        }
    }

    fn script_exits(self, exits: &[i64]) -> Self {
        *self.script_exits.lock().unwrap() = exits.iter().copied().collect();
        self
    }

    fn creates(&self) -> usize {
        self.create_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContainerApi for FakeRuntime {
    async fn image_list(&self) -> Result<Vec<ImageSummary>> {
        Ok(vec![ImageSummary {
            repo_tags: self.local_images.clone(),
        }])
    }

    async fn image_pull(&self, reference: &str) -> Result<ProgressStream<PullProgress>> {
        self.pull_count.fetch_add(1, Ordering::SeqCst);
        let lines: Vec<Result<PullProgress>> = if self.fail_pull {
            vec![Err(Error::ImagePull {
                reference: reference.to_string(),
                message: "manifest unknown".to_string(),
            })]
        } else {
            vec![Ok(PullProgress {
                status: "Downloaded".to_string(),
                progress: String::new(),
            })]
        };
        Ok(Box::pin(stream::iter(lines)))
    }

    async fn image_build(
        &self,
        _context: Vec<u8>,
        _tag: &str,
    ) -> Result<ProgressStream<BuildProgress>> {
        let lines: Vec<Result<BuildProgress>> = if self.fail_build {
            vec![Ok(BuildProgress {
                stream: None,
                error: Some("RUN ./missing.sh failed".to_string()),
            })]
        } else {
            vec![Ok(BuildProgress {
                stream: Some("Step 1/1 : FROM alpine".to_string()),
                error: None,
            })]
        };
        Ok(Box::pin(stream::iter(lines)))
    }

    async fn container_create(&self, spec: &ContainerSpec) -> Result<String> {
        let n = self.create_count.fetch_add(1, Ordering::SeqCst);
        *self.last_spec.lock().unwrap() = Some(spec.clone());
        Ok(format!("ctr-{}", n))
    }

    async fn container_start(&self, _id: &str) -> Result<()> {
        Ok(())
    }

    async fn container_stop(&self, _id: &str) -> Result<()> {
        Ok(())
    }

    async fn container_remove(&self, _id: &str, force: bool) -> Result<()> {
        if force {
            self.force_removes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn container_kill(&self, _id: &str, _signal: &str) -> Result<()> {
        Ok(())
    }

    async fn exec_create(&self, _id: &str, cmd: Vec<String>, _work_dir: &str) -> Result<String> {
        let exec_id = format!("exec-{}", self.exec_seq.fetch_add(1, Ordering::SeqCst));
        self.exec_cmds
            .lock()
            .unwrap()
            .insert(exec_id.clone(), cmd.join(" "));
        Ok(exec_id)
    }

    async fn exec_attach(&self, exec_id: &str) -> Result<ProgressStream<Vec<u8>>> {
        let cmd = self
            .exec_cmds
            .lock()
            .unwrap()
            .get(exec_id)
            .cloned()
            .unwrap_or_default();

        let chunks: Vec<Result<Vec<u8>>> = if cmd.starts_with("sh ") {
            if !self.exec_delay.is_zero() {
                tokio::time::sleep(self.exec_delay).await;
            }
            vec![Ok(self.exec_output.clone())]
        } else {
            Vec::new()
        };
        Ok(Box::pin(stream::iter(chunks)))
    }

    async fn exec_inspect(&self, exec_id: &str) -> Result<i64> {
        let cmd = self
            .exec_cmds
            .lock()
            .unwrap()
            .get(exec_id)
            .cloned()
            .unwrap_or_default();

        if cmd.starts_with("sh ") {
            self.script_inspects.fetch_add(1, Ordering::SeqCst);
            Ok(self.script_exits.lock().unwrap().pop_front().unwrap_or(0))
        } else {
            Ok(0)
        }
    }

    async fn copy_to_container(&self, _id: &str, _dst: &str, _tar: Vec<u8>) -> Result<()> {
        Ok(())
    }

    async fn copy_from_container(&self, _id: &str, _src: &str) -> Result<Vec<u8>> {
        // A one-entry tar standing in for /shell_command_output.log.
        let mut header = tar::Header::new_gnu();
        header.set_path("shell_command_output.log").unwrap();
        header.set_mode(0o644);
        header.set_size(self.exec_output.len() as u64);
        header.set_cksum();

        let mut builder = tar::Builder::new(Vec::new());
        builder.append(&header, self.exec_output.as_slice()).unwrap();
        Ok(builder.into_inner().unwrap())
    }
}

fn job(name: &str, script: &[&str]) -> Job {
    Job {
        name: name.to_string(),
        image: Some("alpine:latest".to_string()),
        dockerfile: None,
        script: script.iter().map(|s| s.to_string()).collect(),
        solo_execution: false,
        work_dir: "/root".to_string(),
        copy_files: false,
        copy_ignore: vec![],
        env: vec![],
        ports: vec![],
        parallel: false,
        condition: None,
        artifact_path: None,
        retry: RetryPolicy::default(),
    }
}

fn pipeline(jobs: Vec<Job>) -> Pipeline {
    Pipeline {
        jobs,
        logs_with_time: false,
        docker_host: None,
    }
}

fn no_delay_retry(attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts: attempts,
        delay_seconds: 0,
        backoff_multiplier: 1.0,
    }
}

/// Collect every event currently buffered for the subscriber.
fn drain_events(rx: &mut mpsc::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn subscribe(broadcaster: &EventBroadcaster) -> mpsc::Receiver<Event> {
    let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
    broadcaster.add_subscriber(tx).unwrap();
    rx
}

fn positions_of(events: &[Event], job: &str, event_type: EventType) -> Vec<usize> {
    events
        .iter()
        .enumerate()
        .filter(|(_, e)| {
            e.event_type == event_type && e.data.get("job").and_then(|j| j.as_str()) == Some(job)
        })
        .map(|(i, _)| i)
        .collect()
}

#[tokio::test]
async fn test_hello_pipeline_runs_to_completion() {
    let api = Arc::new(FakeRuntime::with_image("alpine:latest"));
    let broadcaster = EventBroadcaster::new();
    let mut rx = subscribe(&broadcaster);
    let (_tx, shutdown) = shutdown_channel();

    let result = run_pipeline_with(
        api.clone(),
        pipeline(vec![job("hello", &["echo hi"])]),
        broadcaster,
        shutdown,
    )
    .await;

    assert!(result.is_ok());
    assert_eq!(api.creates(), 1);
    assert_eq!(api.pull_count.load(Ordering::SeqCst), 0);

    let events = drain_events(&mut rx);
    let starts = positions_of(&events, "hello", EventType::ContainerStart);
    let completions = positions_of(&events, "hello", EventType::JobCompleted);
    assert_eq!(starts.len(), 1);
    assert_eq!(completions.len(), 1);

    let log_with_hi = events
        .iter()
        .position(|e| {
            e.event_type == EventType::Log
                && e.data["message"].as_str().is_some_and(|m| m.contains("hi"))
        })
        .expect("a log event containing the script output");

    // container_start < log output < job_completed
    assert!(starts[0] < log_with_hi);
    assert!(log_with_hi < completions[0]);

    // job_completed is the job's final event.
    let last_for_job = events
        .iter()
        .rposition(|e| e.data.get("job").and_then(|j| j.as_str()) == Some("hello"))
        .unwrap();
    assert_eq!(last_for_job, completions[0]);
}

#[tokio::test]
async fn test_absent_image_is_pulled() {
    let api = Arc::new(FakeRuntime {
        exec_output: b"ok\n".to_vec(),
        ..Default::default()
    });
    let broadcaster = EventBroadcaster::new();
    let (_tx, shutdown) = shutdown_channel();

    let result = run_pipeline_with(
        api.clone(),
        pipeline(vec![job("pull-me", &["true"])]),
        broadcaster,
        shutdown,
    )
    .await;

    assert!(result.is_ok());
    assert_eq!(api.pull_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_always_failing_job_retries_exactly_n_times() {
    let api =
        Arc::new(FakeRuntime::with_image("alpine:latest").script_exits(&[1, 1, 1]));
    let broadcaster = EventBroadcaster::new();
    let mut rx = subscribe(&broadcaster);
    let (_tx, shutdown) = shutdown_channel();

    let mut failing = job("flaky", &["exit 1"]);
    failing.retry = no_delay_retry(3);

    let result = run_pipeline_with(api.clone(), pipeline(vec![failing]), broadcaster, shutdown).await;

    assert!(matches!(result, Err(Error::Script { exit_code: 1, .. })));
    assert_eq!(api.creates(), 3);

    let events = drain_events(&mut rx);
    assert_eq!(positions_of(&events, "flaky", EventType::JobFailed).len(), 3);
    assert!(positions_of(&events, "flaky", EventType::JobCompleted).is_empty());
}

#[tokio::test]
async fn test_retry_succeeds_on_second_attempt() {
    let api = Arc::new(FakeRuntime::with_image("alpine:latest").script_exits(&[1, 0]));
    let broadcaster = EventBroadcaster::new();
    let mut rx = subscribe(&broadcaster);
    let (_tx, shutdown) = shutdown_channel();

    let mut flaky = job("flaky", &["./sometimes-works.sh"]);
    flaky.retry = no_delay_retry(3);

    let result = run_pipeline_with(api.clone(), pipeline(vec![flaky]), broadcaster, shutdown).await;

    assert!(result.is_ok());
    assert_eq!(api.script_inspects.load(Ordering::SeqCst), 2);
    assert_eq!(api.creates(), 2);

    let events = drain_events(&mut rx);
    assert_eq!(positions_of(&events, "flaky", EventType::JobFailed).len(), 1);
    assert_eq!(positions_of(&events, "flaky", EventType::JobCompleted).len(), 1);
}

#[tokio::test]
async fn test_false_condition_skips_without_container() {
    let api = Arc::new(FakeRuntime::with_image("alpine:latest"));
    let broadcaster = EventBroadcaster::new();
    let mut rx = subscribe(&broadcaster);
    let (_tx, shutdown) = shutdown_channel();

    let mut deploy = job("deploy", &["./deploy.sh"]);
    // Standalone reference to a variable this test never sets.
    deploy.condition = Some("$GANTRY_TEST_UNSET_BRANCH_FLAG".to_string());

    let result = run_pipeline_with(api.clone(), pipeline(vec![deploy]), broadcaster, shutdown).await;

    assert!(result.is_ok());
    assert_eq!(api.creates(), 0);

    let events = drain_events(&mut rx);
    let skips = positions_of(&events, "deploy", EventType::JobSkipped);
    assert_eq!(skips.len(), 1);
    assert_eq!(events[skips[0]].data["reason"], "condition");
}

#[tokio::test]
async fn test_failed_predecessor_skips_dependent() {
    let api = Arc::new(FakeRuntime::with_image("alpine:latest").script_exits(&[1]));
    let broadcaster = EventBroadcaster::new();
    let mut rx = subscribe(&broadcaster);
    let (_tx, shutdown) = shutdown_channel();

    let first = job("first", &["exit 1"]);
    let second = job("second", &["echo never"]);

    let result =
        run_pipeline_with(api.clone(), pipeline(vec![first, second]), broadcaster, shutdown).await;

    // The failure is visible on the event stream, not as the pipeline
    // result: the final job skipped, which is not an error.
    assert!(result.is_ok());
    assert_eq!(api.creates(), 1);

    let events = drain_events(&mut rx);
    assert_eq!(positions_of(&events, "first", EventType::JobFailed).len(), 1);
    let skips = positions_of(&events, "second", EventType::JobSkipped);
    assert_eq!(skips.len(), 1);
    assert_eq!(events[skips[0]].data["reason"], "predecessor_failed");
}

#[tokio::test]
async fn test_parallel_jobs_overlap() {
    let api = Arc::new(FakeRuntime {
        local_images: vec!["alpine:latest".to_string()],
        exec_output: b"done\n".to_vec(),
        exec_delay: Duration::from_millis(150),
        ..Default::default()
    });
    let broadcaster = EventBroadcaster::new();
    let mut rx = subscribe(&broadcaster);
    let (_tx, shutdown) = shutdown_channel();

    let mut a = job("a", &["sleep 1"]);
    a.parallel = true;
    let mut b = job("b", &["sleep 1"]);
    b.parallel = true;

    let result = run_pipeline_with(api.clone(), pipeline(vec![a, b]), broadcaster, shutdown).await;
    assert!(result.is_ok());

    let events = drain_events(&mut rx);
    let start_a = positions_of(&events, "a", EventType::ContainerStart)[0];
    let start_b = positions_of(&events, "b", EventType::ContainerStart)[0];
    let done_a = positions_of(&events, "a", EventType::JobCompleted)[0];
    let done_b = positions_of(&events, "b", EventType::JobCompleted)[0];

    // Both containers started before either job finished.
    assert!(start_a < done_a && start_a < done_b);
    assert!(start_b < done_a && start_b < done_b);
}

#[tokio::test]
async fn test_pull_failure_fails_the_job() {
    let api = Arc::new(FakeRuntime {
        fail_pull: true,
        ..Default::default()
    });
    let broadcaster = EventBroadcaster::new();
    let (_tx, shutdown) = shutdown_channel();

    let result = run_pipeline_with(
        api.clone(),
        pipeline(vec![job("broken", &["true"])]),
        broadcaster,
        shutdown,
    )
    .await;

    assert!(matches!(result, Err(Error::ImagePull { .. })));
    assert_eq!(api.creates(), 0);
}

#[tokio::test]
async fn test_build_error_line_fails_the_job() {
    let dir = tempfile::tempdir().unwrap();
    let recipe = dir.path().join("broken.dockerfile");
    std::fs::write(&recipe, "FROM alpine\nRUN ./missing.sh\n").unwrap();

    let api = Arc::new(FakeRuntime {
        fail_build: true,
        ..Default::default()
    });
    let broadcaster = EventBroadcaster::new();
    let (_tx, shutdown) = shutdown_channel();

    let mut build = job("build", &["true"]);
    build.image = None;
    build.dockerfile = Some(recipe.to_string_lossy().into_owned());

    let result = run_pipeline_with(api.clone(), pipeline(vec![build]), broadcaster, shutdown).await;

    assert!(matches!(result, Err(Error::ImageBuild(message)) if message.contains("missing.sh")));
    assert_eq!(api.creates(), 0);
}

#[tokio::test]
async fn test_solo_execution_runs_each_line_separately() {
    let api = Arc::new(FakeRuntime::with_image("alpine:latest"));
    let broadcaster = EventBroadcaster::new();
    let (_tx, shutdown) = shutdown_channel();

    let mut solo = job("solo", &["echo one", "echo two", "echo three"]);
    solo.solo_execution = true;

    let result = run_pipeline_with(api.clone(), pipeline(vec![solo]), broadcaster, shutdown).await;

    assert!(result.is_ok());
    // One script exec per line, in one container.
    assert_eq!(api.script_inspects.load(Ordering::SeqCst), 3);
    assert_eq!(api.creates(), 1);
}

#[tokio::test]
async fn test_env_and_ports_reach_container_create() {
    let api = Arc::new(FakeRuntime::with_image("alpine:latest"));
    let broadcaster = EventBroadcaster::new();
    let (_tx, shutdown) = shutdown_channel();

    let mut web = job("web", &["./serve.sh"]);
    web.env = vec!["MODE=ci".to_string()];
    web.ports = vec![gantry_core::pipeline::Port {
        host_ip: "127.0.0.1".to_string(),
        host_port: "8080".to_string(),
        container_port: "80".to_string(),
    }];

    let result = run_pipeline_with(api.clone(), pipeline(vec![web]), broadcaster, shutdown).await;
    assert!(result.is_ok());

    let spec = api.last_spec.lock().unwrap().clone().unwrap();
    assert!(spec.name.starts_with("web_"));
    assert_eq!(spec.image, "alpine:latest");
    assert_eq!(spec.env, vec!["MODE=ci"]);
    assert_eq!(spec.ports.len(), 1);
    assert_eq!(spec.ports[0].host_ip, "127.0.0.1");
    assert!(spec.tty);
}

#[tokio::test]
async fn test_shutdown_cancels_and_force_removes() {
    let api = Arc::new(FakeRuntime {
        local_images: vec!["alpine:latest".to_string()],
        exec_output: b"never\n".to_vec(),
        exec_delay: Duration::from_secs(30),
        ..Default::default()
    });
    let broadcaster = EventBroadcaster::new();
    let (shutdown_tx, shutdown) = shutdown_channel();

    let long = job("long", &["sleep 600"]);

    let api_for_run = api.clone();
    let run = tokio::spawn(async move {
        run_pipeline_with(api_for_run, pipeline(vec![long]), broadcaster, shutdown).await
    });

    // Let the job reach its exec, then pull the plug.
    tokio::time::sleep(Duration::from_millis(200)).await;
    shutdown_tx.send(true).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("cancellation should not hang")
        .unwrap();

    assert!(matches!(result, Err(Error::Cancelled)));
    assert_eq!(api.force_removes.load(Ordering::SeqCst), 1);
}
