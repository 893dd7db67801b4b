//! Pipeline configuration parsing and validation.
//!
//! [`parse_pipeline`] is a pure function from YAML bytes to a validated
//! [`Pipeline`]. There is no process-wide configuration store: the
//! daemon parses every trigger body independently.
//!
//! The YAML surface:
//!
//! ```yaml
//! workflow: [build, test]
//! logsWithTime: true
//! dockerHost: tcp://localhost:2375
//!
//! build:
//!   image: golang:1.22
//!   script:
//!     - go build ./...
//! test:
//!   image: golang:1.22
//!   parallel: true
//!   script: go test ./...
//! ```

use crate::condition::ConditionEvaluator;
use crate::error::{Error, Result};
use crate::pipeline::{Job, Pipeline, Port, RetryPolicy};
use serde::Deserialize;
use std::collections::HashMap;

const DEFAULT_WORK_DIR: &str = "/root";

/// Endpoint schemes the runtime adapter accepts.
const VALID_HOST_SCHEMES: [&str; 4] = ["tcp://", "unix://", "npipe://", "ssh://"];

#[derive(Debug, Deserialize)]
struct PipelineFile {
    #[serde(default)]
    workflow: Vec<String>,
    #[serde(default, rename = "logsWithTime")]
    logs_with_time: bool,
    #[serde(default, rename = "dockerHost")]
    docker_host: Option<String>,
    #[serde(flatten)]
    jobs: HashMap<String, serde_yaml::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobFile {
    image: Option<String>,
    dockerfile: Option<String>,
    #[serde(default)]
    script: Option<OneOrMany<String>>,
    #[serde(default)]
    solo_execution: bool,
    work_dir: Option<String>,
    #[serde(default)]
    copy_files: bool,
    #[serde(default)]
    copy_ignore: Option<OneOrMany<String>>,
    #[serde(default)]
    env: Option<OneOrMany<String>>,
    #[serde(default)]
    port: Option<OneOrMany<String>>,
    #[serde(default)]
    parallel: bool,
    condition: Option<String>,
    artifact_path: Option<String>,
    retry: Option<RetryFile>,
}

/// YAML fields that accept either a scalar or a sequence.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(value) => vec![value],
            OneOrMany::Many(values) => values,
        }
    }
}

fn one_or_many(field: Option<OneOrMany<String>>) -> Vec<String> {
    field.map(OneOrMany::into_vec).unwrap_or_default()
}

#[derive(Debug, Deserialize)]
struct RetryFile {
    attempts: Option<u32>,
    delay: Option<u64>,
    backoff: Option<f64>,
}

impl RetryFile {
    fn into_policy(self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy {
            max_attempts: self.attempts.unwrap_or(defaults.max_attempts),
            delay_seconds: self.delay.unwrap_or(defaults.delay_seconds),
            backoff_multiplier: self.backoff.unwrap_or(defaults.backoff_multiplier),
        }
    }
}

/// Parse and validate a pipeline from YAML bytes.
pub fn parse_pipeline(yaml: &[u8]) -> Result<Pipeline> {
    let file: PipelineFile = serde_yaml::from_slice(yaml)?;

    if file.workflow.is_empty() {
        return Err(Error::Config(
            "workflow must be defined and cannot be empty".to_string(),
        ));
    }

    if let Some(host) = &file.docker_host {
        validate_docker_host(host)?;
    }

    let mut jobs = Vec::with_capacity(file.workflow.len());
    for name in &file.workflow {
        let value = file.jobs.get(name).cloned().ok_or_else(|| {
            Error::Config(format!("job '{}' is not defined or is empty", name))
        })?;
        let job_file: JobFile = serde_yaml::from_value(value)
            .map_err(|e| Error::Config(format!("job '{}': {}", name, e)))?;
        let job = build_job(name, job_file)?;
        jobs.push(job);
    }

    Ok(Pipeline {
        jobs,
        logs_with_time: file.logs_with_time,
        docker_host: file.docker_host,
    })
}

fn build_job(name: &str, file: JobFile) -> Result<Job> {
    match (&file.image, &file.dockerfile) {
        (None, None) => {
            return Err(Error::Config(format!(
                "job '{}': either 'image' or 'dockerfile' must be specified",
                name
            )));
        }
        (Some(_), Some(_)) => {
            return Err(Error::Config(format!(
                "job '{}': cannot specify both 'image' and 'dockerfile'",
                name
            )));
        }
        (Some(image), None) if image.trim().is_empty() => {
            return Err(Error::Config(format!("job '{}': 'image' cannot be empty", name)));
        }
        (None, Some(dockerfile)) if dockerfile.trim().is_empty() => {
            return Err(Error::Config(format!(
                "job '{}': 'dockerfile' cannot be empty",
                name
            )));
        }
        _ => {}
    }

    let script = one_or_many(file.script);
    for (index, line) in script.iter().enumerate() {
        if line.trim().is_empty() {
            return Err(Error::Config(format!(
                "job '{}': script item at index {} cannot be empty",
                name, index
            )));
        }
    }

    let ports = one_or_many(file.port)
        .iter()
        .map(|value| {
            Port::parse(value).map_err(|e| Error::Config(format!("job '{}': {}", name, e)))
        })
        .collect::<Result<Vec<_>>>()?;

    if let Some(condition) = &file.condition {
        if condition.trim().is_empty() {
            return Err(Error::Config(format!(
                "job '{}': 'condition' cannot be empty",
                name
            )));
        }
        if !ConditionEvaluator::is_valid(condition) {
            return Err(Error::Config(format!(
                "job '{}': condition contains unsupported characters: {}",
                name, condition
            )));
        }
    }

    let retry = file
        .retry
        .map(RetryFile::into_policy)
        .unwrap_or_default();
    retry
        .validate()
        .map_err(|e| Error::Config(format!("job '{}': {}", name, e)))?;

    Ok(Job {
        name: name.to_string(),
        image: file.image,
        dockerfile: file.dockerfile,
        script,
        solo_execution: file.solo_execution,
        work_dir: file
            .work_dir
            .unwrap_or_else(|| DEFAULT_WORK_DIR.to_string()),
        copy_files: file.copy_files,
        copy_ignore: one_or_many(file.copy_ignore),
        env: one_or_many(file.env),
        ports,
        parallel: file.parallel,
        condition: file.condition,
        artifact_path: file.artifact_path,
        retry,
    })
}

/// Validate a runtime endpoint descriptor.
pub fn validate_docker_host(host: &str) -> Result<()> {
    let host = host.trim();
    if host.is_empty() {
        return Err(Error::Config("dockerHost cannot be empty".to_string()));
    }

    if !VALID_HOST_SCHEMES
        .iter()
        .any(|scheme| host.starts_with(scheme))
    {
        return Err(Error::Config(format!(
            "dockerHost must start with tcp://, unix://, npipe:// or ssh://, got: {}",
            host
        )));
    }

    if let Some(authority) = host.strip_prefix("tcp://") {
        if authority.is_empty() || !authority.contains(':') {
            return Err(Error::Config(format!(
                "dockerHost tcp:// form requires host and port (e.g. tcp://localhost:2375), got: {}",
                host
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_pipeline() {
        let yaml = br#"
workflow: [hello]
hello:
  image: alpine:latest
  script:
    - echo hi
"#;
        let pipeline = parse_pipeline(yaml).unwrap();
        assert_eq!(pipeline.jobs.len(), 1);
        let job = &pipeline.jobs[0];
        assert_eq!(job.name, "hello");
        assert_eq!(job.image.as_deref(), Some("alpine:latest"));
        assert_eq!(job.script, vec!["echo hi"]);
        assert_eq!(job.work_dir, "/root");
        assert!(!job.parallel);
        assert_eq!(job.retry, RetryPolicy::default());
        assert!(!pipeline.logs_with_time);
    }

    #[test]
    fn test_scalar_script_and_env() {
        let yaml = br#"
workflow: [one]
one:
  image: alpine:latest
  script: echo solo
  env: KEY=value
  port: 8080:80
"#;
        let pipeline = parse_pipeline(yaml).unwrap();
        let job = &pipeline.jobs[0];
        assert_eq!(job.script, vec!["echo solo"]);
        assert_eq!(job.env, vec!["KEY=value"]);
        assert_eq!(job.ports.len(), 1);
        assert_eq!(job.ports[0].host_ip, "0.0.0.0");
    }

    #[test]
    fn test_missing_job_definition() {
        let yaml = br#"
workflow: [ghost]
"#;
        let err = parse_pipeline(yaml).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_empty_workflow_rejected() {
        assert!(parse_pipeline(b"workflow: []").is_err());
        assert!(parse_pipeline(b"logsWithTime: true").is_err());
    }

    #[test]
    fn test_image_and_dockerfile_exclusive() {
        let neither = br#"
workflow: [a]
a:
  script: [echo hi]
"#;
        assert!(parse_pipeline(neither).is_err());

        let both = br#"
workflow: [a]
a:
  image: alpine:latest
  dockerfile: ./Dockerfile
"#;
        assert!(parse_pipeline(both).is_err());

        let dockerfile_only = br#"
workflow: [a]
a:
  dockerfile: ./build/app.dockerfile
"#;
        let pipeline = parse_pipeline(dockerfile_only).unwrap();
        assert_eq!(pipeline.jobs[0].dockerfile.as_deref(), Some("./build/app.dockerfile"));
        assert_eq!(pipeline.jobs[0].custom_image_tag(), "a-custom:latest");
    }

    #[test]
    fn test_invalid_port_rejected() {
        let yaml = br#"
workflow: [a]
a:
  image: alpine:latest
  port: "8080"
"#;
        assert!(parse_pipeline(yaml).is_err());
    }

    #[test]
    fn test_retry_parsing_and_bounds() {
        let yaml = br#"
workflow: [a]
a:
  image: alpine:latest
  retry:
    attempts: 3
    delay: 5
    backoff: 2.0
"#;
        let pipeline = parse_pipeline(yaml).unwrap();
        let retry = pipeline.jobs[0].retry;
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.delay_seconds, 5);
        assert_eq!(retry.backoff_multiplier, 2.0);

        let out_of_bounds = br#"
workflow: [a]
a:
  image: alpine:latest
  retry:
    attempts: 11
"#;
        assert!(parse_pipeline(out_of_bounds).is_err());
    }

    #[test]
    fn test_invalid_condition_rejected() {
        let yaml = br#"
workflow: [a]
a:
  image: alpine:latest
  condition: "$(whoami)"
"#;
        assert!(parse_pipeline(yaml).is_err());
    }

    #[test]
    fn test_docker_host_validation() {
        assert!(validate_docker_host("tcp://localhost:2375").is_ok());
        assert!(validate_docker_host("unix:///var/run/docker.sock").is_ok());
        assert!(validate_docker_host("ssh://user@host").is_ok());
        assert!(validate_docker_host("npipe:////./pipe/docker_engine").is_ok());
        assert!(validate_docker_host("tcp://localhost").is_err());
        assert!(validate_docker_host("http://localhost:2375").is_err());
        assert!(validate_docker_host("").is_err());
    }

    #[test]
    fn test_parallel_and_flags() {
        let yaml = br#"
workflow: [a, b]
logsWithTime: true
a:
  image: alpine:latest
  parallel: true
  soloExecution: true
  copyFiles: true
  copyIgnore: [node_modules, ".git"]
  workDir: /app
b:
  image: alpine:latest
  parallel: true
  artifactPath: /app/out.bin
"#;
        let pipeline = parse_pipeline(yaml).unwrap();
        assert!(pipeline.logs_with_time);
        let a = &pipeline.jobs[0];
        assert!(a.parallel && a.solo_execution && a.copy_files);
        assert_eq!(a.copy_ignore, vec!["node_modules", ".git"]);
        assert_eq!(a.work_dir, "/app");
        assert_eq!(pipeline.jobs[1].artifact_path.as_deref(), Some("/app/out.bin"));
    }
}
