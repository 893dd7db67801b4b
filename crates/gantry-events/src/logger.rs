//! Per-job console logging mirrored into the event stream.

use crate::EventBroadcaster;
use chrono::{Local, Utc};
use console::style;
use gantry_core::events::{Event, EventType, LogLevel};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Writes colored console lines prefixed with the job name and mirrors
/// them into the broadcaster as `log` events.
///
/// Stream subscribers are guaranteed to see `container_start` before
/// any `log` event for a job, so the executor creates its logger with
/// the stream deferred and opens it once the container is up. Console
/// output is never deferred, and job lifecycle events bypass the gate.
#[derive(Clone)]
pub struct JobLogger {
    job: String,
    with_time: bool,
    broadcaster: EventBroadcaster,
    stream_open: Arc<AtomicBool>,
}

impl JobLogger {
    pub fn new(job: impl Into<String>, with_time: bool, broadcaster: EventBroadcaster) -> Self {
        Self {
            job: job.into(),
            with_time,
            broadcaster,
            stream_open: Arc::new(AtomicBool::new(true)),
        }
    }

    /// A logger whose `log` events are withheld until
    /// [`JobLogger::open_stream`] is called.
    pub fn with_deferred_stream(
        job: impl Into<String>,
        with_time: bool,
        broadcaster: EventBroadcaster,
    ) -> Self {
        Self {
            job: job.into(),
            with_time,
            broadcaster,
            stream_open: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start mirroring log lines into the event stream.
    pub fn open_stream(&self) {
        self.stream_open.store(true, Ordering::Release);
    }

    pub fn job_name(&self) -> &str {
        &self.job
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.emit(LogLevel::Info, message.as_ref());
    }

    pub fn success(&self, message: impl AsRef<str>) {
        self.emit(LogLevel::Success, message.as_ref());
    }

    pub fn warning(&self, message: impl AsRef<str>) {
        self.emit(LogLevel::Warning, message.as_ref());
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.emit(LogLevel::Error, message.as_ref());
    }

    /// Print raw script output without the job prefix; still mirrored
    /// as a `log` event.
    pub fn output(&self, chunk: &str) {
        print!("{}", chunk);
        self.broadcast_log(LogLevel::Info, chunk.trim_end());
    }

    /// Broadcast a job-scoped lifecycle event, tagged with the job name.
    pub fn job_event(&self, event_type: EventType, mut data: Map<String, Value>) {
        data.insert("job".to_string(), Value::String(self.job.clone()));
        data.insert(
            "timestamp".to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );
        self.broadcaster.broadcast(Event::new(event_type, data));
    }

    fn emit(&self, level: LogLevel, message: &str) {
        let prefix = if self.with_time {
            format!(
                "{} ⚉ {} ",
                Local::now().format("%Y/%m/%d %H:%M:%S"),
                self.job
            )
        } else {
            format!("⚉ {} ", self.job)
        };

        match level {
            LogLevel::Info => println!("{}{}", prefix, message),
            LogLevel::Success => println!("{}", style(format!("{}{}", prefix, message)).green()),
            LogLevel::Warning => println!("{}", style(format!("{}{}", prefix, message)).yellow()),
            LogLevel::Error => eprintln!("{}", style(format!("{}{}", prefix, message)).red()),
        }

        self.broadcast_log(level, message);
    }

    fn broadcast_log(&self, level: LogLevel, message: &str) {
        if !self.stream_open.load(Ordering::Acquire) {
            return;
        }

        let mut data = Map::new();
        data.insert("level".to_string(), Value::String(level.to_string()));
        data.insert("message".to_string(), Value::String(message.to_string()));
        data.insert("job".to_string(), Value::String(self.job.clone()));
        data.insert(
            "timestamp".to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );
        self.broadcaster.broadcast(Event::new(EventType::Log, data));
    }
}
