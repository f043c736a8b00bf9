use rentbox_core::prelude::*;

use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::models::{
    ContainerCreateBody, ContainerMemoryStats, ContainerStatsResponse, HostConfig,
};
use bollard::query_parameters::{
    BuildImageOptionsBuilder, CreateContainerOptionsBuilder, InspectContainerOptions,
    KillContainerOptionsBuilder, ListContainersOptionsBuilder, ListImagesOptionsBuilder,
    LogsOptionsBuilder, RemoveContainerOptionsBuilder, RemoveImageOptionsBuilder,
    StartContainerOptions, StatsOptionsBuilder, WaitContainerOptionsBuilder,
};
use bollard::{Docker, body_full};
use futures::{StreamExt, stream::BoxStream};
use std::collections::HashMap;
use tracing::debug;

mod context;

#[derive(Clone)]
pub struct DockerEngine {
    client: Docker,
}

impl DockerEngine {
    /// Connects to the local Docker socket (defaults to /var/run/docker.sock on Linux)
    pub fn connect_local() -> Result<Self, EngineError> {
        let client = Docker::connect_with_local_defaults()
            .map_err(|e| EngineError::Unavailable(format!("Failed to connect to Docker: {e}")))?;
        Ok(Self { client })
    }

    pub fn from_client(client: Docker) -> Self {
        Self { client }
    }

    async fn oom_killed(&self, id: &str) -> bool {
        match self
            .client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => info
                .state
                .and_then(|state| state.oom_killed)
                .unwrap_or(false),
            Err(e) => {
                debug!(container = %id, "inspect failed: {e}");
                false
            }
        }
    }
}

impl ContainerEngine for DockerEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        self.client
            .ping()
            .await
            .map_err(|e| EngineError::Unavailable(format!("Docker unavailable: {e}")))?;
        Ok(())
    }

    async fn image_exists(&self, tag: &str) -> Result<bool, EngineError> {
        match self.client.inspect_image(tag).await {
            Ok(_) => Ok(true),
            Err(e) => match engine_error(e) {
                EngineError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn build_image(&self, ctx: BuildContext) -> Result<(), EngineError> {
        let dir = ctx.dir.clone();
        let archive = tokio::task::spawn_blocking(move || context::archive(&dir))
            .await
            .map_err(|e| EngineError::Api(format!("Build context task failed: {e}")))?
            .map_err(|e| EngineError::BuildFailed(format!("Could not pack build context: {e}")))?;

        let mut options = BuildImageOptionsBuilder::new()
            .dockerfile("Dockerfile")
            .t(&ctx.tag)
            .rm(true)
            .forcerm(true)
            .build();
        options.labels = Some(ctx.labels);

        let mut stream = self
            .client
            .build_image(options, None, Some(body_full(archive.into())));

        let mut tail: Vec<String> = Vec::new();
        while let Some(item) = stream.next().await {
            let info = item.map_err(|e| match engine_error(e) {
                EngineError::Api(msg) => EngineError::BuildFailed(msg),
                other => other,
            })?;

            if let Some(message) = info.error_detail.and_then(|d| d.message) {
                tail.push(message);
                return Err(EngineError::BuildFailed(tail.join("\n")));
            }
            if let Some(line) = info.stream {
                let line = line.trim_end();
                if !line.is_empty() {
                    debug!(image = %ctx.tag, "{line}");
                    remember(&mut tail, line);
                }
            }
        }

        Ok(())
    }

    async fn create_container(&self, spec: ContainerSpec) -> Result<String, EngineError> {
        let options = CreateContainerOptionsBuilder::new().name(&spec.name).build();
        let response = self
            .client
            .create_container(Some(options), container_body(spec))
            .await
            .map_err(engine_error)?;

        for warning in response.warnings {
            debug!(container = %response.id, "{warning}");
        }
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.client
            .start_container(id, None::<StartContainerOptions>)
            .await
            .map_err(engine_error)
    }

    fn logs(&self, id: &str) -> BoxStream<'static, Result<LogChunk, EngineError>> {
        let options = LogsOptionsBuilder::new()
            .follow(true)
            .stdout(true)
            .stderr(true)
            .build();

        self.client
            .logs(id, Some(options))
            .map(|res| match res {
                Ok(output) => {
                    let (source, bytes) = match output {
                        LogOutput::StdOut { message } => (LogSource::Stdout, message),
                        LogOutput::StdErr { message } => (LogSource::Stderr, message),
                        LogOutput::Console { message } => (LogSource::Console, message),
                        LogOutput::StdIn { message } => (LogSource::Console, message),
                    };
                    Ok(LogChunk { source, bytes })
                }
                Err(e) => Err(engine_error(e)),
            })
            .boxed()
    }

    async fn wait_container(&self, id: &str) -> Result<ExitStatus, EngineError> {
        let options = WaitContainerOptionsBuilder::new()
            .condition("not-running")
            .build();
        let mut stream = self.client.wait_container(id, Some(options));

        let code = match stream.next().await {
            Some(Ok(response)) => response.status_code,
            // Non-zero exits are reported as errors.
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => code,
            Some(Err(e)) => return Err(engine_error(e)),
            None => return Err(EngineError::Api(format!("No exit status for {id}"))),
        };

        Ok(ExitStatus {
            code,
            oom_killed: self.oom_killed(id).await,
        })
    }

    async fn kill_container(&self, id: &str) -> Result<(), EngineError> {
        let options = KillContainerOptionsBuilder::new().signal("SIGKILL").build();
        self.client
            .kill_container(id, Some(options))
            .await
            .map_err(engine_error)
    }

    async fn stats(&self, id: &str) -> Result<Option<StatsSample>, EngineError> {
        let options = StatsOptionsBuilder::new().stream(false).one_shot(true).build();
        let mut stream = self.client.stats(id, Some(options));

        match stream.next().await {
            Some(Ok(stats)) => Ok(Some(sample_from(&stats))),
            Some(Err(e)) => match engine_error(e) {
                EngineError::NotFound(_) | EngineError::Conflict(_) => Ok(None),
                other => Err(other),
            },
            None => Ok(None),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        let options = RemoveContainerOptionsBuilder::new()
            .force(true)
            .v(true)
            .build();
        self.client
            .remove_container(id, Some(options))
            .await
            .map_err(engine_error)
    }

    async fn remove_image(&self, tag: &str) -> Result<(), EngineError> {
        let options = RemoveImageOptionsBuilder::new().force(false).build();
        self.client
            .remove_image(tag, Some(options), None)
            .await
            .map_err(engine_error)?;
        Ok(())
    }

    async fn list_containers(&self, label: &str) -> Result<Vec<ManagedResource>, EngineError> {
        let filters = HashMap::from([("label", vec![label])]);
        let options = ListContainersOptionsBuilder::new()
            .all(true)
            .filters(&filters)
            .build();

        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(engine_error)?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                Some(ManagedResource {
                    name: c.id?,
                    labels: c.labels.unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn list_images(&self, label: &str) -> Result<Vec<ManagedResource>, EngineError> {
        let filters = HashMap::from([("label", vec![label])]);
        let options = ListImagesOptionsBuilder::new().filters(&filters).build();

        let images = self
            .client
            .list_images(Some(options))
            .await
            .map_err(engine_error)?;

        Ok(images
            .into_iter()
            .flat_map(|image| {
                let names = if image.repo_tags.is_empty() {
                    vec![image.id]
                } else {
                    image.repo_tags
                };
                let labels = image.labels;
                names.into_iter().map(move |name| ManagedResource {
                    name,
                    labels: labels.clone(),
                })
            })
            .collect())
    }
}

/// The create body of a sandbox container: no network, capped resources,
/// no capabilities, read-only root with a small writable `/tmp`.
fn container_body(spec: ContainerSpec) -> ContainerCreateBody {
    let limits = spec.limits;
    let memory = i64::try_from(limits.memory_bytes).unwrap_or(i64::MAX);

    ContainerCreateBody {
        image: Some(spec.image),
        user: Some(spec.user),
        labels: Some(spec.labels),
        network_disabled: Some(true),
        tty: Some(false),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        host_config: Some(HostConfig {
            network_mode: Some("none".to_string()),
            memory: Some(memory),
            // Equal to memory: no swap on top of the ceiling.
            memory_swap: Some(memory),
            nano_cpus: Some(limits.nano_cpus),
            pids_limit: Some(limits.pids_limit),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            readonly_rootfs: Some(true),
            tmpfs: Some(HashMap::from([(
                "/tmp".to_string(),
                format!("rw,noexec,nosuid,size={}", limits.tmpfs_bytes),
            )])),
            auto_remove: Some(false),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn sample_from(stats: &ContainerStatsResponse) -> StatsSample {
    let cpu = stats.cpu_stats.as_ref();
    StatsSample {
        cpu_total_usage: cpu
            .and_then(|c| c.cpu_usage.as_ref())
            .and_then(|u| u.total_usage),
        system_cpu_usage: cpu.and_then(|c| c.system_cpu_usage),
        online_cpus: cpu.and_then(|c| c.online_cpus),
        memory_usage: stats.memory_stats.as_ref().and_then(working_set),
    }
}

/// Memory usage without reclaimable page cache, the figure `docker stats` shows.
fn working_set(memory: &ContainerMemoryStats) -> Option<u64> {
    let usage = memory.usage?;
    let inactive_file = memory.stats.as_ref().and_then(|stats| {
        // cgroup v1 reports `total_inactive_file`, v2 `inactive_file`.
        [stats.get("total_inactive_file"), stats.get("inactive_file")]
            .into_iter()
            .flatten()
            .copied()
            .find(|inactive| *inactive < usage)
    });
    Some(usage.saturating_sub(inactive_file.unwrap_or(0)))
}

/// Keeps the last few build log lines for the error message.
fn remember(tail: &mut Vec<String>, line: &str) {
    const KEEP: usize = 10;
    if tail.len() == KEEP {
        tail.remove(0);
    }
    tail.push(line.to_string());
}

fn engine_error(err: BollardError) -> EngineError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => EngineError::NotFound(message),
        BollardError::DockerResponseServerError {
            status_code: 409,
            message,
        } => EngineError::Conflict(message),
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => EngineError::Api(format!("{status_code}: {message}")),
        BollardError::DockerStreamError { error } => EngineError::BuildFailed(error),
        e @ (BollardError::IOError { .. }
        | BollardError::SocketNotFoundError(_)
        | BollardError::RequestTimeoutError) => EngineError::Unavailable(e.to_string()),
        other => EngineError::Api(other.to_string()),
    }
}
