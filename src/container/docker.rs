use anyhow::Context;
use async_trait::async_trait;
use bollard::Docker;
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::ContainerCreateBody;
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, CreateImageOptionsBuilder, InspectContainerOptions,
    RemoveContainerOptionsBuilder, StartContainerOptions, StopContainerOptionsBuilder,
};
use futures_util::StreamExt;
use tracing::{debug, info};

use super::{ContainerRuntime, ContainerSpec, ExecOutput, RuntimeStatus};
use crate::config::SandboxConfig;
use crate::errors::ContainerError;

/// Container runtime backed by the local Docker daemon.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
    stop_timeout_secs: i32,
}

impl DockerRuntime {
    /// Connect using the platform defaults (`DOCKER_HOST` or the local socket).
    pub fn connect(config: &SandboxConfig) -> anyhow::Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to Docker")?;
        Ok(Self {
            docker,
            stop_timeout_secs: i32::try_from(config.stop_timeout_secs).unwrap_or(i32::MAX),
        })
    }

    async fn pull_if_missing(&self, image: &str) -> Result<(), ContainerError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        info!(image, "Pulling image");
        let options = CreateImageOptionsBuilder::default()
            .from_image(image)
            .build();
        let mut progress = self.docker.create_image(Some(options), None, None);
        while let Some(step) = progress.next().await {
            let step = step.map_err(|e| runtime_error(e, "Failed to pull image"))?;
            if let Some(status) = step.status {
                debug!(image, status = %status, "Pull progress");
            }
        }
        Ok(())
    }

    /// Remove a leftover container with the same name from an earlier run.
    async fn remove_stale(&self, name: &str) -> Result<(), ContainerError> {
        match self.remove(name).await {
            Ok(()) => {
                info!(container = name, "Removed stale container");
                Ok(())
            }
            Err(ContainerError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, ContainerError> {
        self.pull_if_missing(&spec.image).await?;
        self.remove_stale(&spec.name).await?;

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();
        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: Some(vec![
                "tail".to_string(),
                "-f".to_string(),
                "/dev/null".to_string(),
            ]),
            env: Some(env),
            working_dir: Some("/".to_string()),
            tty: Some(false),
            ..Default::default()
        };
        let options = CreateContainerOptionsBuilder::default()
            .name(&spec.name)
            .build();

        let created = self
            .docker
            .create_container(Some(options), body)
            .await
            .map_err(|e| runtime_error(e, "Failed to create container"))?;
        self.docker
            .start_container(&created.id, None::<StartContainerOptions>)
            .await
            .map_err(|e| runtime_error(e, "Failed to start container"))?;

        debug!(container = %spec.name, local_id = %created.id, "Container started");
        Ok(created.id)
    }

    async fn stop(&self, local_id: &str) -> Result<(), ContainerError> {
        let options = StopContainerOptionsBuilder::default()
            .t(self.stop_timeout_secs)
            .build();
        match self.docker.stop_container(local_id, Some(options)).await {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(classify(e, local_id, "Failed to stop container")),
        }
    }

    async fn remove(&self, local_id: &str) -> Result<(), ContainerError> {
        let options = RemoveContainerOptionsBuilder::default().force(true).build();
        self.docker
            .remove_container(local_id, Some(options))
            .await
            .map_err(|e| classify(e, local_id, "Failed to remove container"))
    }

    async fn status(&self, local_id: &str) -> Result<RuntimeStatus, ContainerError> {
        match self
            .docker
            .inspect_container(local_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(details) => {
                let running = details
                    .state
                    .and_then(|state| state.running)
                    .unwrap_or(false);
                Ok(if running {
                    RuntimeStatus::Running
                } else {
                    RuntimeStatus::Stopped
                })
            }
            Err(e) if is_not_found(&e) => Ok(RuntimeStatus::Absent),
            Err(e) => Err(runtime_error(e, "Failed to inspect container")),
        }
    }

    async fn exec(&self, local_id: &str, cmd: &[String]) -> Result<ExecOutput, ContainerError> {
        let options = CreateExecOptions {
            cmd: Some(cmd.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = self
            .docker
            .create_exec(local_id, options)
            .await
            .map_err(|e| classify(e, local_id, "Failed to create exec"))?;

        let mut output = String::new();
        match self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| classify(e, local_id, "Failed to start exec"))?
        {
            StartExecResults::Attached { output: mut stream, .. } => {
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(|e| runtime_error(e, "Failed to read exec output"))?;
                    output.push_str(&chunk.to_string());
                }
            }
            StartExecResults::Detached => {}
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| runtime_error(e, "Failed to inspect exec"))?;

        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(-1),
            output,
        })
    }
}

fn is_not_found(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn classify(err: BollardError, local_id: &str, context: &'static str) -> ContainerError {
    if is_not_found(&err) {
        ContainerError::NotFound {
            container: local_id.to_string(),
        }
    } else {
        runtime_error(err, context)
    }
}

fn runtime_error(err: BollardError, context: &'static str) -> ContainerError {
    ContainerError::Runtime(anyhow::Error::new(err).context(context))
}
