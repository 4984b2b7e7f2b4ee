// Warm container lifecycle on top of Bollard.
//
// One long-lived container per language: created if absent, started if
// stopped, reused if running. Removal only happens through `teardown`.

use crate::config::LanguageConfig;
use crate::engine::push_capped;
use async_trait::async_trait;
use autograder_common::error::SandboxError;
use autograder_common::types::ExecutionResult;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Mount point of the scratch directory inside warm containers
pub const SCRATCH_DIR: &str = "/scratch";
pub const CONTAINER_LABEL: &str = "autograder.role";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Absent,
    Stopped,
    Running,
}

/// Everything needed to create a warm container
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Host directory bind-mounted at [`SCRATCH_DIR`]
    pub scratch_host_dir: PathBuf,
    pub memory_limit_mb: u32,
    pub cpu_limit: f32,
}

impl ContainerSpec {
    pub fn container_name(language: &str) -> String {
        format!("autograder-{}-warm", language.to_lowercase())
    }

    pub fn for_language(config: &LanguageConfig, scratch_root: &Path) -> Self {
        Self {
            name: Self::container_name(&config.name),
            image: config.image.clone(),
            scratch_host_dir: scratch_root.join(config.name.to_lowercase()),
            memory_limit_mb: config.memory_limit_mb,
            cpu_limit: config.cpu_limit,
        }
    }
}

/// Container substrate operations used by the warm-container sandbox
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn state(&self, name: &str) -> Result<ContainerState, SandboxError>;

    async fn create(&self, spec: &ContainerSpec) -> Result<(), SandboxError>;

    async fn start(&self, name: &str) -> Result<(), SandboxError>;

    async fn stop(&self, name: &str) -> Result<(), SandboxError>;

    async fn remove(&self, name: &str) -> Result<(), SandboxError>;

    /// Run `argv` inside the container and collect combined output until end
    /// of stream. When `deadline` passes first, returns what was captured so
    /// far with `timed_out` set; the process may still be running.
    async fn exec(&self, name: &str, argv: Vec<String>, deadline: Duration) -> Result<ExecutionResult, SandboxError>;
}

/// Create-if-absent, start-if-stopped, reuse-if-running.
/// Returns the state the container was found in.
pub async fn ensure_running<R: ContainerRuntime + ?Sized>(
    runtime: &R,
    spec: &ContainerSpec,
) -> Result<ContainerState, SandboxError> {
    let state = runtime.state(&spec.name).await?;
    match state {
        ContainerState::Running => {
            debug!(container = %spec.name, "Reusing warm container");
        }
        ContainerState::Stopped => {
            info!(container = %spec.name, "Starting stopped warm container");
            runtime.start(&spec.name).await?;
        }
        ContainerState::Absent => {
            info!(container = %spec.name, image = %spec.image, "Creating warm container");
            runtime.create(spec).await?;
            runtime.start(&spec.name).await?;
        }
    }
    Ok(state)
}

/// Operator-initiated removal. Absent containers are not an error.
pub async fn teardown<R: ContainerRuntime + ?Sized>(runtime: &R, name: &str) -> Result<bool, SandboxError> {
    match runtime.state(name).await? {
        ContainerState::Absent => {
            debug!(container = %name, "Nothing to tear down");
            Ok(false)
        }
        ContainerState::Running => {
            runtime.stop(name).await?;
            runtime.remove(name).await?;
            info!(container = %name, "Warm container removed");
            Ok(true)
        }
        ContainerState::Stopped => {
            runtime.remove(name).await?;
            info!(container = %name, "Warm container removed");
            Ok(true)
        }
    }
}

/// Docker-backed runtime
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

fn is_not_found(error: &bollard::errors::Error) -> bool {
    matches!(
        error,
        bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }
    )
}

impl DockerRuntime {
    pub fn connect() -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::unavailable(format!("Failed to connect to Docker daemon: {}", e)))?;
        Ok(Self { docker })
    }

    /// Pull the image if it is not cached locally
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!("Image cache hit: {}", image);
            return Ok(());
        }

        warn!("Image cache miss: {} (pulling now)", image);

        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| SandboxError::unavailable(format!("Failed to pull image '{}': {}", image, e)))?;
        }

        info!("Image pulled successfully: {}", image);
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn state(&self, name: &str) -> Result<ContainerState, SandboxError> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(details) => {
                let running = details.state.and_then(|s| s.running).unwrap_or(false);
                Ok(if running {
                    ContainerState::Running
                } else {
                    ContainerState::Stopped
                })
            }
            Err(e) if is_not_found(&e) => Ok(ContainerState::Absent),
            Err(e) => Err(SandboxError::unavailable(format!("Failed to inspect container {}: {}", name, e))),
        }
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<(), SandboxError> {
        self.ensure_image(&spec.image).await?;

        let bind = format!("{}:{}", spec.scratch_host_dir.display(), SCRATCH_DIR);
        let mut labels = HashMap::new();
        labels.insert(CONTAINER_LABEL.to_string(), "warm".to_string());

        let config = Config {
            image: Some(spec.image.clone()),
            // Keep the container alive between exec calls
            cmd: Some(vec!["tail".to_string(), "-f".to_string(), "/dev/null".to_string()]),
            entrypoint: Some(vec![]),
            network_disabled: Some(true),
            working_dir: Some(SCRATCH_DIR.to_string()),
            labels: Some(labels),
            host_config: Some(bollard::models::HostConfig {
                memory: Some(i64::from(spec.memory_limit_mb) * 1024 * 1024),
                nano_cpus: Some((f64::from(spec.cpu_limit) * 1_000_000_000.0) as i64),
                binds: Some(vec![bind]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };

        self.docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| SandboxError::unavailable(format!("Failed to create container {}: {}", spec.name, e)))?;
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<(), SandboxError> {
        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::unavailable(format!("Failed to start container {}: {}", name, e)))
    }

    async fn stop(&self, name: &str) -> Result<(), SandboxError> {
        self.docker
            .stop_container(name, Some(StopContainerOptions { t: 1 }))
            .await
            .map_err(|e| SandboxError::unavailable(format!("Failed to stop container {}: {}", name, e)))
    }

    async fn remove(&self, name: &str) -> Result<(), SandboxError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(name, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(SandboxError::unavailable(format!("Failed to remove container {}: {}", name, e))),
        }
    }

    async fn exec(&self, name: &str, argv: Vec<String>, deadline: Duration) -> Result<ExecutionResult, SandboxError> {
        let exec_config = CreateExecOptions {
            cmd: Some(argv),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(name, exec_config)
            .await
            .map_err(|e| SandboxError::unavailable(format!("Failed to create exec in {}: {}", name, e)))?;

        let start_config = StartExecOptions {
            detach: false,
            ..Default::default()
        };

        let mut captured = Vec::new();
        let collect = async {
            let started = self
                .docker
                .start_exec(&exec.id, Some(start_config))
                .await
                .map_err(|e| SandboxError::unavailable(format!("Failed to start exec in {}: {}", name, e)))?;

            if let StartExecResults::Attached { mut output, .. } = started {
                while let Some(frame) = output.next().await {
                    match frame {
                        Ok(frame) => capture_frame(&mut captured, &frame),
                        Err(e) => {
                            warn!(container = %name, error = %e, "Output stream broke off");
                            break;
                        }
                    }
                }
            }
            Ok::<(), SandboxError>(())
        };

        let finished = tokio::time::timeout(deadline, collect).await;
        match finished {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Ok(ExecutionResult {
                    exit_code: None,
                    output: String::from_utf8_lossy(&captured).into_owned(),
                    timed_out: true,
                });
            }
        }

        let exit_code = match self.docker.inspect_exec(&exec.id).await {
            Ok(inspect) => inspect.exit_code,
            Err(e) => {
                warn!(container = %name, error = %e, "Failed to read exec exit code");
                None
            }
        };

        Ok(ExecutionResult {
            exit_code,
            output: String::from_utf8_lossy(&captured).into_owned(),
            timed_out: false,
        })
    }
}

/// Frames can split a multi-byte character, so bytes are decoded only once
/// the stream ends.
fn capture_frame(captured: &mut Vec<u8>, frame: &LogOutput) {
    if let LogOutput::StdOut { message } | LogOutput::StdErr { message } = frame {
        push_capped(captured, message);
    }
}
