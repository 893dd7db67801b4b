//! Pipeline model types.
//!
//! These types are the in-memory representation of a user-authored
//! pipeline. They are produced by [`crate::config::parse_pipeline`] and
//! consumed by the execution engine; the engine assumes they have
//! already been validated.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// A fully parsed pipeline: the ordered workflow plus global options.
#[derive(Debug, Clone)]
pub struct Pipeline {
    /// Jobs in workflow order.
    pub jobs: Vec<Job>,
    /// Whether console log lines carry timestamps.
    pub logs_with_time: bool,
    /// Optional container runtime endpoint (e.g. `tcp://localhost:2375`).
    /// When absent the runtime is discovered from the environment.
    pub docker_host: Option<String>,
}

/// A single unit of work executed inside one container lifecycle.
#[derive(Debug, Clone)]
pub struct Job {
    /// Unique name within the pipeline.
    pub name: String,
    /// Image tag reference. Exactly one of `image`/`dockerfile` is set.
    pub image: Option<String>,
    /// Path to a build recipe. The built image is tagged
    /// `<name>-custom:latest`.
    pub dockerfile: Option<String>,
    /// Ordered shell command lines.
    pub script: Vec<String>,
    /// When true each script line runs in its own shell invocation.
    pub solo_execution: bool,
    /// Container-side working directory.
    pub work_dir: String,
    /// Upload the host working directory into the container at `work_dir`.
    pub copy_files: bool,
    /// Patterns excluded from the upload (regex against tar entry names;
    /// directories whose basename equals an entry are skipped entirely).
    pub copy_ignore: Vec<String>,
    /// `KEY=VALUE` strings injected as container environment.
    pub env: Vec<String>,
    /// Port bindings.
    pub ports: Vec<Port>,
    /// May run concurrently with adjacent parallel jobs.
    pub parallel: bool,
    /// Optional boolean expression over the process environment.
    pub condition: Option<String>,
    /// Container-side path copied out to the host after the scripts
    /// succeed.
    pub artifact_path: Option<String>,
    /// Retry policy for the whole job state machine.
    pub retry: RetryPolicy,
}

/// A single host-to-container port binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub host_ip: String,
    pub host_port: String,
    pub container_port: String,
}

impl Port {
    /// Parse a `hostPort:containerPort` or `hostIP:hostPort:containerPort`
    /// binding string.
    pub fn parse(value: &str) -> Result<Self> {
        let parts: Vec<&str> = value.split(':').collect();
        match parts.as_slice() {
            [host_port, container_port] => Ok(Self {
                host_ip: "0.0.0.0".to_string(),
                host_port: (*host_port).to_string(),
                container_port: (*container_port).to_string(),
            }),
            [host_ip, host_port, container_port] => Ok(Self {
                host_ip: (*host_ip).to_string(),
                host_port: (*host_port).to_string(),
                container_port: (*container_port).to_string(),
            }),
            _ => Err(Error::Config(format!(
                "port must be 'hostPort:containerPort' or 'hostIP:hostPort:containerPort', got: {}",
                value
            ))),
        }
    }
}

/// Retry policy for a job.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay_seconds: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            delay_seconds: 1,
            backoff_multiplier: 1.0,
        }
    }
}

impl RetryPolicy {
    /// Back-off delay in seconds before retrying after `attempt` failed
    /// attempts (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> f64 {
        self.delay_seconds as f64 * self.backoff_multiplier.powi(attempt as i32 - 1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts < 1 || self.max_attempts > 10 {
            return Err(Error::Config(format!(
                "retry.attempts must be between 1 and 10, got {}",
                self.max_attempts
            )));
        }
        if self.delay_seconds > 300 {
            return Err(Error::Config(format!(
                "retry.delay must not exceed 300 seconds, got {}",
                self.delay_seconds
            )));
        }
        if self.backoff_multiplier <= 0.0 || self.backoff_multiplier > 10.0 {
            return Err(Error::Config(format!(
                "retry.backoff must be in (0, 10], got {}",
                self.backoff_multiplier
            )));
        }
        Ok(())
    }
}

impl Job {
    /// The tag a recipe-built image is published under.
    pub fn custom_image_tag(&self) -> String {
        format!("{}-custom:latest", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_parse_two_parts() {
        let port = Port::parse("8080:80").unwrap();
        assert_eq!(port.host_ip, "0.0.0.0");
        assert_eq!(port.host_port, "8080");
        assert_eq!(port.container_port, "80");
    }

    #[test]
    fn test_port_parse_three_parts() {
        let port = Port::parse("127.0.0.1:8080:80").unwrap();
        assert_eq!(port.host_ip, "127.0.0.1");
        assert_eq!(port.host_port, "8080");
        assert_eq!(port.container_port, "80");
    }

    #[test]
    fn test_port_parse_invalid() {
        assert!(Port::parse("8080").is_err());
        assert!(Port::parse("a:b:c:d").is_err());
    }

    #[test]
    fn test_retry_defaults() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.max_attempts, 1);
        assert_eq!(retry.delay_seconds, 1);
        assert_eq!(retry.backoff_multiplier, 1.0);
        assert!(retry.validate().is_ok());
    }

    #[test]
    fn test_retry_bounds() {
        let mut retry = RetryPolicy::default();
        retry.max_attempts = 0;
        assert!(retry.validate().is_err());
        retry.max_attempts = 11;
        assert!(retry.validate().is_err());

        retry = RetryPolicy::default();
        retry.delay_seconds = 301;
        assert!(retry.validate().is_err());

        retry = RetryPolicy::default();
        retry.backoff_multiplier = 0.0;
        assert!(retry.validate().is_err());
        retry.backoff_multiplier = 10.5;
        assert!(retry.validate().is_err());
    }

    #[test]
    fn test_backoff_delay() {
        let retry = RetryPolicy {
            max_attempts: 4,
            delay_seconds: 2,
            backoff_multiplier: 3.0,
        };
        assert_eq!(retry.backoff_delay(1), 2.0);
        assert_eq!(retry.backoff_delay(2), 6.0);
        assert_eq!(retry.backoff_delay(3), 18.0);
    }
}
