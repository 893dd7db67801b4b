//! Docker runtime adapter.
//!
//! The only seam that touches the container daemon. Implements the
//! [`ContainerApi`] capability port on top of bollard as a pure
//! passthrough: no business logic lives here and runtime errors bubble
//! unchanged (wrapped into the engine error taxonomy).

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, KillContainerOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
    UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::{BuildImageOptions, CreateImageOptions, ListImagesOptions};
use bollard::models::{HostConfig, PortBinding};
use bollard::{API_DEFAULT_VERSION, Docker};
use futures::StreamExt;
use gantry_core::error::{Error, Result};
use gantry_core::ports::{
    BuildProgress, ContainerApi, ContainerSpec, ImageSummary, ProgressStream, PullProgress,
};
use std::collections::HashMap;
use tracing::debug;

const CONNECT_TIMEOUT_SECS: u64 = 120;

/// Bollard-backed implementation of the runtime capability port.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the container runtime.
    ///
    /// With no endpoint the runtime is discovered from the environment
    /// (`DOCKER_HOST` and friends). An explicit endpoint must use one of
    /// the `tcp://`, `unix://` or `npipe://` schemes; `ssh://` passes
    /// configuration validation but is not supported by this adapter.
    pub fn connect(endpoint: Option<&str>) -> Result<Self> {
        let docker = match endpoint {
            None => Docker::connect_with_local_defaults(),
            Some(addr) if addr.starts_with("tcp://") => {
                Docker::connect_with_http(addr, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
            Some(addr) if addr.starts_with("unix://") => {
                Docker::connect_with_socket(addr, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
            #[cfg(windows)]
            Some(addr) if addr.starts_with("npipe://") => {
                Docker::connect_with_named_pipe(addr, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
            Some(addr) => {
                return Err(Error::RuntimeUnavailable(format!(
                    "unsupported runtime endpoint: {}",
                    addr
                )));
            }
        }
        .map_err(|e| Error::RuntimeUnavailable(e.to_string()))?;

        debug!(endpoint = ?endpoint, "Connected to container runtime");
        Ok(Self { docker })
    }

    /// Wrap an existing bollard client.
    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }
}

fn container_err(e: bollard::errors::Error) -> Error {
    Error::Container(e.to_string())
}

#[async_trait]
impl ContainerApi for DockerRuntime {
    async fn image_list(&self) -> Result<Vec<ImageSummary>> {
        let images = self
            .docker
            .list_images(Some(ListImagesOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await
            .map_err(|e| Error::RuntimeUnavailable(e.to_string()))?;

        Ok(images
            .into_iter()
            .map(|image| ImageSummary {
                repo_tags: image.repo_tags,
            })
            .collect())
    }

    async fn image_pull(&self, reference: &str) -> Result<ProgressStream<PullProgress>> {
        let reference = reference.to_string();
        let stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: reference.clone(),
                ..Default::default()
            }),
            None,
            None,
        );

        let mapped = stream.map(move |item| match item {
            Ok(info) => match info.error {
                Some(message) => Err(Error::ImagePull {
                    reference: reference.clone(),
                    message,
                }),
                None => Ok(PullProgress {
                    status: info.status.unwrap_or_default(),
                    progress: info.progress.unwrap_or_default(),
                }),
            },
            Err(e) => Err(Error::ImagePull {
                reference: reference.clone(),
                message: e.to_string(),
            }),
        });

        Ok(Box::pin(mapped))
    }

    async fn image_build(
        &self,
        context: Vec<u8>,
        tag: &str,
    ) -> Result<ProgressStream<BuildProgress>> {
        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: tag.to_string(),
            rm: true,
            ..Default::default()
        };

        let stream = self.docker.build_image(options, None, Some(context.into()));

        let mapped = stream.map(|item| match item {
            Ok(info) => Ok(BuildProgress {
                stream: info.stream,
                error: info
                    .error
                    .or(info.error_detail.and_then(|detail| detail.message)),
            }),
            Err(e) => Err(Error::ImageBuild(e.to_string())),
        });

        Ok(Box::pin(mapped))
    }

    async fn container_create(&self, spec: &ContainerSpec) -> Result<String> {
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();

        for port in &spec.ports {
            let key = format!("{}/tcp", port.container_port);
            let binding = PortBinding {
                host_ip: Some(port.host_ip.clone()),
                host_port: Some(port.host_port.clone()),
            };
            port_bindings
                .entry(key.clone())
                .or_insert_with(|| Some(Vec::new()))
                .get_or_insert_with(Vec::new)
                .push(binding);
            exposed_ports.insert(key, HashMap::new());
        }

        let config = Config {
            image: Some(spec.image.clone()),
            tty: Some(spec.tty),
            env: Some(spec.env.clone()),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            host_config: Some(HostConfig {
                port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
                ..Default::default()
            }),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.as_str(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(container_err)?;

        Ok(response.id)
    }

    async fn container_start(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(container_err)
    }

    async fn container_stop(&self, id: &str) -> Result<()> {
        self.docker
            .stop_container(id, None::<StopContainerOptions>)
            .await
            .map_err(container_err)
    }

    async fn container_remove(&self, id: &str, force: bool) -> Result<()> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
            .map_err(container_err)
    }

    async fn container_kill(&self, id: &str, signal: &str) -> Result<()> {
        self.docker
            .kill_container(id, Some(KillContainerOptions { signal }))
            .await
            .map_err(container_err)
    }

    async fn exec_create(&self, id: &str, cmd: Vec<String>, work_dir: &str) -> Result<String> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(true),
                    cmd: Some(cmd),
                    working_dir: Some(work_dir.to_string()),
                    ..Default::default()
                },
            )
            .await
            .map_err(container_err)?;

        Ok(exec.id)
    }

    async fn exec_attach(&self, exec_id: &str) -> Result<ProgressStream<Vec<u8>>> {
        let results = self
            .docker
            .start_exec(exec_id, None::<StartExecOptions>)
            .await
            .map_err(container_err)?;

        match results {
            StartExecResults::Attached { output, .. } => {
                let mapped = output.map(|item| {
                    item.map(|log| log.into_bytes().to_vec())
                        .map_err(container_err)
                });
                Ok(Box::pin(mapped))
            }
            StartExecResults::Detached => Err(Error::Container(
                "exec started detached, expected attached output".to_string(),
            )),
        }
    }

    async fn exec_inspect(&self, exec_id: &str) -> Result<i64> {
        let inspect = self
            .docker
            .inspect_exec(exec_id)
            .await
            .map_err(container_err)?;

        Ok(inspect.exit_code.unwrap_or(0))
    }

    async fn copy_to_container(&self, id: &str, dst_path: &str, tar: Vec<u8>) -> Result<()> {
        self.docker
            .upload_to_container(
                id,
                Some(UploadToContainerOptions {
                    path: dst_path.to_string(),
                    ..Default::default()
                }),
                tar.into(),
            )
            .await
            .map_err(container_err)
    }

    async fn copy_from_container(&self, id: &str, src_path: &str) -> Result<Vec<u8>> {
        let mut stream = Box::pin(self.docker.download_from_container(
            id,
            Some(DownloadFromContainerOptions {
                path: src_path.to_string(),
            }),
        ));

        let mut archive = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(container_err)?;
            archive.extend_from_slice(&chunk);
        }

        Ok(archive)
    }
}
