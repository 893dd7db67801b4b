//! Container lifecycle management: create, workspace upload, artifact
//! download, stop and remove.

use gantry_core::error::{Error, Result};
use gantry_core::pipeline::Port;
use gantry_core::ports::{ContainerApi, ContainerSpec};
use gantry_events::JobLogger;
use regex::Regex;
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use tar::Builder;
use walkdir::WalkDir;

/// Tracks live containers per job so shutdown can force-remove them.
///
/// Each entry is written only by the owning job's executor; the
/// shutdown path drains the whole table.
#[derive(Clone, Default)]
pub struct ContainerRegistry {
    containers: Arc<RwLock<HashMap<String, String>>>,
}

impl ContainerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, job: &str, container_id: &str) {
        self.containers
            .write()
            .unwrap()
            .insert(job.to_string(), container_id.to_string());
    }

    pub fn deregister(&self, job: &str) {
        self.containers.write().unwrap().remove(job);
    }

    /// Remove and return every tracked container id.
    pub fn drain(&self) -> Vec<String> {
        self.containers.write().unwrap().drain().map(|(_, id)| id).collect()
    }

    pub fn len(&self) -> usize {
        self.containers.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// Monotonic epoch-millis source for container names. Never returns the
// same value twice, so two back-to-back starts of the same job cannot
// collide even within one millisecond.
static NAME_CLOCK: AtomicI64 = AtomicI64::new(0);

fn next_name_suffix() -> i64 {
    let now = chrono::Utc::now().timestamp_millis();
    let previous = NAME_CLOCK
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(if now > last { now } else { last + 1 })
        })
        .unwrap_or(now);
    if now > previous { now } else { previous + 1 }
}

/// Unique container name for a job run: `<job>_<epoch-millis>`.
pub fn unique_container_name(job: &str) -> String {
    format!("{}_{}", job, next_name_suffix())
}

/// Drives one job's container through its lifecycle.
pub struct ContainerLifecycle {
    api: Arc<dyn ContainerApi>,
    logger: JobLogger,
}

impl ContainerLifecycle {
    pub fn new(api: Arc<dyn ContainerApi>, logger: JobLogger) -> Self {
        Self { api, logger }
    }

    /// Create a container for a job, translating port bindings and
    /// environment. Returns the container id.
    pub async fn create(
        &self,
        job: &str,
        image: &str,
        ports: &[Port],
        env: &[String],
    ) -> Result<String> {
        self.logger.success("Start creating container");

        let spec = ContainerSpec {
            name: unique_container_name(job),
            image: image.to_string(),
            env: env.to_vec(),
            ports: ports.to_vec(),
            tty: true,
        };

        self.api.container_create(&spec).await
    }

    /// Upload the host working directory into the container at
    /// `work_dir`, honoring the ignore patterns.
    pub async fn copy_in(&self, container_id: &str, work_dir: &str, ignore: &[String]) -> Result<()> {
        let root = std::env::current_dir()?;
        let archive = workspace_tar(&root, ignore)?;
        self.api
            .copy_to_container(container_id, work_dir, archive)
            .await
    }

    /// Download a single file from the container into `dst_dir`,
    /// preserving its basename. Returns the host path written.
    pub async fn copy_out(
        &self,
        container_id: &str,
        src_path: &str,
        dst_dir: &Path,
    ) -> Result<PathBuf> {
        let archive = self.api.copy_from_container(container_id, src_path).await?;
        let dst = unpack_first_entry(&archive, dst_dir)
            .map_err(|e| Error::Container(format!("artifact '{}': {}", src_path, e)))?;

        self.logger
            .success(format!("Artifact copied to {}", dst.display()));
        Ok(dst)
    }

    pub async fn stop(&self, container_id: &str) -> Result<()> {
        self.logger.info("Container stopping");
        self.api.container_stop(container_id).await?;
        self.logger.info("Container stopped");
        Ok(())
    }

    pub async fn remove(&self, container_id: &str, force: bool) -> Result<()> {
        self.logger.info("Container removing");
        self.api.container_remove(container_id, force).await?;
        self.logger.info("Container removed");
        Ok(())
    }
}

/// Write the first entry of a tar archive into `dst_dir`, preserving
/// its basename. Returns the host path written.
pub fn unpack_first_entry(archive: &[u8], dst_dir: &Path) -> Result<PathBuf> {
    let mut reader = tar::Archive::new(archive);
    let mut entries = reader
        .entries()
        .map_err(|e| Error::Container(format!("failed to read archive: {}", e)))?;

    let mut entry = entries
        .next()
        .ok_or_else(|| Error::Container("archive is empty".to_string()))?
        .map_err(|e| Error::Container(format!("failed to read archive entry: {}", e)))?;

    let basename = entry
        .path()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "artifact".to_string());

    let mut contents = Vec::new();
    entry
        .read_to_end(&mut contents)
        .map_err(|e| Error::Container(format!("failed to read archive contents: {}", e)))?;

    let dst = dst_dir.join(basename);
    std::fs::write(&dst, contents)?;
    Ok(dst)
}

/// Tar up the host tree rooted at `root`.
///
/// Regular files only. An entry is skipped when its slash-separated
/// relative path matches any `ignore` regex; a directory whose basename
/// equals an ignore entry is skipped wholesale.
pub fn workspace_tar(root: &Path, ignore: &[String]) -> Result<Vec<u8>> {
    let patterns: Vec<Regex> = ignore
        .iter()
        .map(|p| Regex::new(p).map_err(|e| Error::Config(format!("invalid copyIgnore pattern '{}': {}", p, e))))
        .collect::<Result<Vec<_>>>()?;

    let mut builder = Builder::new(Vec::new());

    let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
        if !entry.file_type().is_dir() {
            return true;
        }
        let basename = entry.file_name().to_string_lossy();
        !ignore.iter().any(|i| i == basename.as_ref())
    });

    for entry in walker {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| Error::Internal(e.to_string()))?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if patterns.iter().any(|p| p.is_match(&name)) {
            continue;
        }

        builder
            .append_path_with_name(entry.path(), Path::new(&name))
            .map_err(|e| Error::Internal(format!("Failed to pack workspace file: {}", e)))?;
    }

    builder
        .into_inner()
        .map_err(|e| Error::Internal(format!("Failed to finish workspace tar: {}", e)))
}
