//! Event types broadcast over the daemon's SSE stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// All event kinds Gantry broadcasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Connection,
    DaemonStart,
    DaemonStop,
    PipelineTrigger,
    PipelineComplete,
    PipelineError,
    JobStarted,
    JobSkipped,
    ContainerStart,
    Log,
    JobCompleted,
    JobFailed,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventType::Connection => "connection",
            EventType::DaemonStart => "daemon_start",
            EventType::DaemonStop => "daemon_stop",
            EventType::PipelineTrigger => "pipeline_trigger",
            EventType::PipelineComplete => "pipeline_complete",
            EventType::PipelineError => "pipeline_error",
            EventType::JobStarted => "job_started",
            EventType::JobSkipped => "job_skipped",
            EventType::ContainerStart => "container_start",
            EventType::Log => "log",
            EventType::JobCompleted => "job_completed",
            EventType::JobFailed => "job_failed",
        };
        write!(f, "{}", name)
    }
}

/// Severity of a `log` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Info => "info",
            LogLevel::Success => "success",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        };
        write!(f, "{}", name)
    }
}

/// A structured event delivered to stream subscribers.
///
/// `id` and `timestamp` may be left unset by producers; the broadcaster
/// assigns them before delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub data: Map<String, Value>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Event {
    /// Create an event with unassigned id and timestamp.
    pub fn new(event_type: EventType, data: Map<String, Value>) -> Self {
        Self {
            id: String::new(),
            event_type,
            data,
            timestamp: None,
        }
    }

    /// Create an event whose data is a single `message` field.
    pub fn message(event_type: EventType, message: impl Into<String>) -> Self {
        let mut data = Map::new();
        data.insert("message".to_string(), Value::String(message.into()));
        Self::new(event_type, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_display_matches_serde() {
        for ty in [
            EventType::Connection,
            EventType::PipelineTrigger,
            EventType::JobCompleted,
            EventType::Log,
        ] {
            let json = serde_json::to_string(&ty).unwrap();
            assert_eq!(json, format!("\"{}\"", ty));
        }
    }

    #[test]
    fn test_event_roundtrip() {
        let mut data = Map::new();
        data.insert("job".to_string(), Value::String("build".to_string()));
        let event = Event::new(EventType::JobStarted, data);

        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_type, EventType::JobStarted);
        assert_eq!(back.data["job"], "build");
        assert!(back.id.is_empty());
        assert!(back.timestamp.is_none());
    }
}
