//! Port traits (hexagonal architecture).
//!
//! The container runtime is the only external system Gantry touches.
//! [`ContainerApi`] is the capability seam over it: the engine depends
//! on this trait alone, the bollard-backed adapter implements it, and
//! tests inject fakes that produce deterministic streams.

use crate::error::Result;
use crate::pipeline::Port;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

/// Stream of progress items produced by pull/build/exec operations.
pub type ProgressStream<T> = Pin<Box<dyn Stream<Item = Result<T>> + Send>>;

/// One line of image pull progress.
#[derive(Debug, Clone, Default)]
pub struct PullProgress {
    pub status: String,
    pub progress: String,
}

/// One line of image build output. `error` is set when the runtime
/// reports a build failure in the stream.
#[derive(Debug, Clone, Default)]
pub struct BuildProgress {
    pub stream: Option<String>,
    pub error: Option<String>,
}

/// A locally available image.
#[derive(Debug, Clone)]
pub struct ImageSummary {
    pub repo_tags: Vec<String>,
}

/// Everything needed to create a job container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Unique container name.
    pub name: String,
    pub image: String,
    /// `KEY=VALUE` environment entries.
    pub env: Vec<String>,
    pub ports: Vec<Port>,
    /// Allocate a pseudo-TTY (exec output arrives as one stream).
    pub tty: bool,
}

/// Capability interface over a container runtime.
///
/// Pure passthrough: no business logic, errors bubble unchanged.
#[async_trait]
pub trait ContainerApi: Send + Sync {
    /// List locally available images.
    async fn image_list(&self) -> Result<Vec<ImageSummary>>;

    /// Pull an image by reference, streaming progress lines.
    async fn image_pull(&self, reference: &str) -> Result<ProgressStream<PullProgress>>;

    /// Build an image from a tar'd context, streaming build output.
    async fn image_build(&self, context: Vec<u8>, tag: &str)
    -> Result<ProgressStream<BuildProgress>>;

    /// Create a container, returning its id.
    async fn container_create(&self, spec: &ContainerSpec) -> Result<String>;

    async fn container_start(&self, id: &str) -> Result<()>;

    async fn container_stop(&self, id: &str) -> Result<()>;

    async fn container_remove(&self, id: &str, force: bool) -> Result<()>;

    async fn container_kill(&self, id: &str, signal: &str) -> Result<()>;

    /// Create an exec instance in a running container.
    async fn exec_create(&self, id: &str, cmd: Vec<String>, work_dir: &str) -> Result<String>;

    /// Attach to an exec instance, streaming its combined output.
    async fn exec_attach(&self, exec_id: &str) -> Result<ProgressStream<Vec<u8>>>;

    /// Inspect a finished exec instance, returning its exit code.
    async fn exec_inspect(&self, exec_id: &str) -> Result<i64>;

    /// Upload a tar archive, unpacked at `dst_path` inside the container.
    async fn copy_to_container(&self, id: &str, dst_path: &str, tar: Vec<u8>) -> Result<()>;

    /// Download `src_path` from the container as a tar archive.
    async fn copy_from_container(&self, id: &str, src_path: &str) -> Result<Vec<u8>>;
}
