//! Docker engine adapter built on `bollard`.

use crate::tool_server::domain::ContainerId;
use crate::tool_server::ports::{
    ContainerInspection, ContainerRuntime, ContainerRuntimeError, ContainerRuntimeResult,
    ContainerSpec, ContainerSummary, EngineHealth, ExecAttachment,
};
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::exec::StartExecResults;
use bollard::models::{
    ContainerCreateBody, ExecConfig, HealthConfig, HealthStatusEnum, HostConfig,
};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, CreateImageOptionsBuilder, InspectContainerOptions,
    ListContainersOptionsBuilder, LogsOptionsBuilder, RemoveContainerOptionsBuilder,
    StartContainerOptions, StopContainerOptionsBuilder,
};
use futures::{StreamExt, TryStreamExt};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Container runtime backed by a local Docker-compatible engine.
pub struct DockerContainerRuntime {
    docker: Docker,
    stop_grace_secs: u32,
}

impl DockerContainerRuntime {
    /// Wraps an existing engine client.
    #[must_use]
    pub const fn new(docker: Docker, stop_grace_secs: u32) -> Self {
        Self {
            docker,
            stop_grace_secs,
        }
    }

    /// Connects using the engine's local defaults (`DOCKER_HOST` or the
    /// platform socket).
    ///
    /// # Errors
    ///
    /// Returns [`ContainerRuntimeError::Engine`] when the client cannot be
    /// configured.
    pub fn connect_local(stop_grace_secs: u32) -> ContainerRuntimeResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|err| ContainerRuntimeError::engine("connect", err))?;
        Ok(Self::new(docker, stop_grace_secs))
    }

    fn not_found_or(
        container_id: &ContainerId,
        operation: &'static str,
        err: BollardError,
    ) -> ContainerRuntimeError {
        if status_code(&err) == Some(404) {
            ContainerRuntimeError::NotFound(container_id.clone())
        } else {
            ContainerRuntimeError::engine(operation, err)
        }
    }

    fn exec_error(container_id: &ContainerId, err: &BollardError) -> ContainerRuntimeError {
        if status_code(err) == Some(404) {
            return ContainerRuntimeError::NotFound(container_id.clone());
        }
        ContainerRuntimeError::Exec {
            container_id: container_id.clone(),
            reason: err.to_string(),
        }
    }

    async fn create_exec(
        &self,
        container_id: &ContainerId,
        command: &[String],
        attach_stdin: bool,
    ) -> ContainerRuntimeResult<String> {
        let config = ExecConfig {
            attach_stdin: Some(attach_stdin),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            cmd: Some(command.to_vec()),
            ..ExecConfig::default()
        };
        self.docker
            .create_exec(container_id.as_str(), config)
            .await
            .map(|created| created.id)
            .map_err(|err| Self::exec_error(container_id, &err))
    }
}

#[async_trait]
impl ContainerRuntime for DockerContainerRuntime {
    async fn ensure_image(&self, image: &str) -> ContainerRuntimeResult<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        tracing::info!(image, "pulling image");
        let (from_image, tag) = split_reference(image);
        self.docker
            .create_image(
                Some(
                    CreateImageOptionsBuilder::new()
                        .from_image(from_image)
                        .tag(tag)
                        .build(),
                ),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await
            .map(drop)
            .map_err(|err| ContainerRuntimeError::ImagePull {
                image: image.to_owned(),
                reason: err.to_string(),
            })
    }

    async fn create_container(&self, spec: &ContainerSpec) -> ContainerRuntimeResult<ContainerId> {
        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        let binds: Vec<String> = spec.volumes.iter().map(|binding| binding.to_bind_spec()).collect();
        let healthcheck = spec.health_check.as_ref().map(|check| {
            let mut test = vec!["CMD".to_owned()];
            test.extend(check.command.iter().cloned());
            HealthConfig {
                test: Some(test),
                interval: Some(nanos(check.policy.interval())),
                retries: Some(i64::from(check.policy.max_retries())),
                ..HealthConfig::default()
            }
        });

        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: (!spec.command.is_empty()).then(|| spec.command.clone()),
            env: (!env.is_empty()).then_some(env),
            labels: Some(spec.labels.clone().into_iter().collect::<HashMap<_, _>>()),
            healthcheck,
            attach_stdin: Some(false),
            tty: Some(false),
            host_config: Some(HostConfig {
                binds: (!binds.is_empty()).then_some(binds),
                ..HostConfig::default()
            }),
            ..ContainerCreateBody::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(&spec.name).build()),
                body,
            )
            .await
            .map_err(|err| ContainerRuntimeError::Create {
                name: spec.name.clone(),
                reason: err.to_string(),
            })?;
        for warning in &created.warnings {
            tracing::warn!(container = %spec.name, warning = %warning, "engine warning on create");
        }
        ContainerId::new(created.id).map_err(|err| ContainerRuntimeError::Create {
            name: spec.name.clone(),
            reason: err.to_string(),
        })
    }

    async fn start_container(&self, container_id: &ContainerId) -> ContainerRuntimeResult<()> {
        self.docker
            .start_container(container_id.as_str(), None::<StartContainerOptions>)
            .await
            .map_err(|err| ContainerRuntimeError::Create {
                name: container_id.to_string(),
                reason: err.to_string(),
            })
    }

    async fn inspect(
        &self,
        container_id: &ContainerId,
    ) -> ContainerRuntimeResult<ContainerInspection> {
        let response = self
            .docker
            .inspect_container(container_id.as_str(), None::<InspectContainerOptions>)
            .await
            .map_err(|err| Self::not_found_or(container_id, "inspect", err))?;
        let state = response.state.unwrap_or_default();
        let health = match state.health.and_then(|health| health.status) {
            Some(HealthStatusEnum::HEALTHY) => EngineHealth::Healthy,
            Some(HealthStatusEnum::UNHEALTHY) => EngineHealth::Unhealthy,
            Some(HealthStatusEnum::STARTING) => EngineHealth::Starting,
            Some(HealthStatusEnum::NONE | HealthStatusEnum::EMPTY) | None => {
                EngineHealth::NotConfigured
            }
        };
        let running = state.running.unwrap_or(false);
        Ok(ContainerInspection {
            running,
            health,
            exit_code: state.exit_code.filter(|_| !running),
        })
    }

    async fn exec_probe(
        &self,
        container_id: &ContainerId,
        command: &[String],
    ) -> ContainerRuntimeResult<i64> {
        let exec_id = self.create_exec(container_id, command, false).await?;
        let started = self
            .docker
            .start_exec(&exec_id, None)
            .await
            .map_err(|err| Self::exec_error(container_id, &err))?;
        if let StartExecResults::Attached { mut output, .. } = started {
            while let Some(chunk) = output.next().await {
                if let Err(err) = chunk {
                    return Err(Self::exec_error(container_id, &err));
                }
            }
        }
        let inspected = self
            .docker
            .inspect_exec(&exec_id)
            .await
            .map_err(|err| Self::exec_error(container_id, &err))?;
        inspected.exit_code.ok_or_else(|| ContainerRuntimeError::Exec {
            container_id: container_id.clone(),
            reason: "probe finished without an exit code".to_owned(),
        })
    }

    async fn exec_attach(
        &self,
        container_id: &ContainerId,
        command: &[String],
    ) -> ContainerRuntimeResult<ExecAttachment> {
        let exec_id = self.create_exec(container_id, command, true).await?;
        let started = self
            .docker
            .start_exec(&exec_id, None)
            .await
            .map_err(|err| Self::exec_error(container_id, &err))?;
        let StartExecResults::Attached { output, input } = started else {
            return Err(ContainerRuntimeError::Exec {
                container_id: container_id.clone(),
                reason: "exec session started detached".to_owned(),
            });
        };

        let (stdout_writer, stdout_reader) = tokio::io::duplex(PIPE_CAPACITY);
        let (stderr_writer, stderr_reader) = tokio::io::duplex(PIPE_CAPACITY);
        tokio::spawn(demultiplex(
            container_id.clone(),
            output,
            stdout_writer,
            stderr_writer,
        ));
        Ok(ExecAttachment {
            stdin: input,
            stdout: Box::pin(stdout_reader),
            stderr: Box::pin(stderr_reader),
        })
    }

    async fn logs(
        &self,
        container_id: &ContainerId,
        tail: usize,
    ) -> ContainerRuntimeResult<Vec<String>> {
        let options = LogsOptionsBuilder::new()
            .stdout(true)
            .stderr(true)
            .tail(&tail.to_string())
            .build();
        let chunks: Vec<LogOutput> = self
            .docker
            .logs(container_id.as_str(), Some(options))
            .try_collect()
            .await
            .map_err(|err| Self::not_found_or(container_id, "logs", err))?;
        let lines: Vec<String> = chunks
            .iter()
            .flat_map(|chunk| {
                String::from_utf8_lossy(chunk.as_ref())
                    .lines()
                    .map(str::to_owned)
                    .collect::<Vec<_>>()
            })
            .collect();
        let skip = lines.len().saturating_sub(tail);
        Ok(lines.into_iter().skip(skip).collect())
    }

    async fn stop(&self, container_id: &ContainerId) -> ContainerRuntimeResult<()> {
        let grace = i32::try_from(self.stop_grace_secs).unwrap_or(i32::MAX);
        match self
            .docker
            .stop_container(
                container_id.as_str(),
                Some(StopContainerOptionsBuilder::new().t(grace).build()),
            )
            .await
        {
            Ok(()) => Ok(()),
            // 304: already stopped.
            Err(err) if matches!(status_code(&err), Some(304 | 404)) => Ok(()),
            Err(err) => Err(ContainerRuntimeError::engine("stop", err)),
        }
    }

    async fn remove(&self, container_id: &ContainerId, force: bool) -> ContainerRuntimeResult<()> {
        match self
            .docker
            .remove_container(
                container_id.as_str(),
                Some(RemoveContainerOptionsBuilder::new().force(force).v(true).build()),
            )
            .await
        {
            Ok(()) => Ok(()),
            // 409: removal already in progress.
            Err(err) if matches!(status_code(&err), Some(404 | 409)) => Ok(()),
            Err(err) => Err(ContainerRuntimeError::engine("remove", err)),
        }
    }

    async fn list_by_label(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> ContainerRuntimeResult<Vec<ContainerSummary>> {
        let label_filters: Vec<String> = labels
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        let filters = HashMap::from([("label".to_owned(), label_filters)]);
        let containers = self
            .docker
            .list_containers(Some(
                ListContainersOptionsBuilder::new()
                    .all(true)
                    .filters(&filters)
                    .build(),
            ))
            .await
            .map_err(|err| ContainerRuntimeError::engine("list", err))?;

        let mut summaries = Vec::with_capacity(containers.len());
        for container in containers {
            let Some(id) = container.id.and_then(|raw| ContainerId::new(raw).ok()) else {
                continue;
            };
            summaries.push(ContainerSummary {
                id,
                labels: container.labels.unwrap_or_default().into_iter().collect(),
            });
        }
        Ok(summaries)
    }
}

async fn demultiplex<S>(
    container_id: ContainerId,
    mut output: S,
    mut stdout: DuplexStream,
    mut stderr: DuplexStream,
) where
    S: futures::Stream<Item = Result<LogOutput, BollardError>> + Send + Unpin,
{
    let mut stderr_open = true;
    while let Some(chunk) = output.next().await {
        match chunk {
            Ok(LogOutput::StdOut { message } | LogOutput::Console { message }) => {
                if stdout.write_all(message.as_ref()).await.is_err() {
                    break;
                }
            }
            Ok(LogOutput::StdErr { message }) if stderr_open => {
                if let Err(err) = stderr.write_all(message.as_ref()).await {
                    tracing::debug!(container = %container_id.short(), error = %err, "exec stderr forwarding stopped");
                    stderr_open = false;
                }
            }
            Ok(LogOutput::StdErr { .. } | LogOutput::StdIn { .. }) => {}
            Err(err) => {
                tracing::debug!(container = %container_id.short(), error = %err, "exec output stream failed");
                break;
            }
        }
    }
    drop(stdout.shutdown().await);
    drop(stderr.shutdown().await);
}

fn status_code(err: &BollardError) -> Option<u16> {
    match err {
        BollardError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

/// Splits an image reference into the `from_image` and `tag` pull arguments.
/// The engine accepts a digest in place of a tag.
fn split_reference(image: &str) -> (&str, &str) {
    if let Some((name, digest)) = image.split_once('@') {
        return (name, digest);
    }
    let name_start = image.rfind('/').map_or(0, |slash| slash.saturating_add(1));
    match image.rfind(':') {
        Some(colon) if colon > name_start => (
            image.get(..colon).unwrap_or(image),
            image.get(colon.saturating_add(1)..).unwrap_or("latest"),
        ),
        _ => (image, "latest"),
    }
}

fn nanos(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}
