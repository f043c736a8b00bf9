use crate::builder::managed_labels;
use crate::monitor::ResourceMonitor;

use rentbox_core::output::OutputBuffer;
use rentbox_core::prelude::*;

use futures::StreamExt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Upper bound for reading log output still buffered after the container stopped.
const LOG_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Upper bound for the reading taken after the container stopped.
const FINAL_SAMPLE_TIMEOUT: Duration = Duration::from_millis(500);

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process exited on its own (or was killed by the memory ceiling).
    Exited(ExitStatus),
    /// The timeout elapsed and the container was killed.
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub termination: Termination,
    /// Combined, sanitized stdout and stderr. Partial when the run timed out.
    pub output: String,
    /// Wall clock from container start to exit or kill.
    pub elapsed: Duration,
    pub usage: ResourceUsage,
}

impl RunOutcome {
    pub fn exit_code(&self) -> Option<i64> {
        match self.termination {
            Termination::Exited(status) => Some(status.code),
            Termination::TimedOut => None,
        }
    }
}

/// Runs job images in locked-down containers.
#[derive(Clone)]
pub struct SandboxRunner<E: ContainerEngine, G: GpuProbe> {
    engine: E,
    monitor: ResourceMonitor<E, G>,
    config: SandboxConfig,
}

impl<E: ContainerEngine, G: GpuProbe> SandboxRunner<E, G> {
    pub fn new(engine: E, monitor: ResourceMonitor<E, G>, config: SandboxConfig) -> Self {
        Self {
            engine,
            monitor,
            config,
        }
    }

    /// The container the job `job_id` runs `image` in.
    pub fn container_spec(&self, job_id: &str, image: &ImageHandle) -> ContainerSpec {
        let mut container_labels = managed_labels(ImageKind::Job);
        container_labels.insert(labels::JOB.to_string(), job_id.to_string());

        ContainerSpec {
            name: job_container_name(&self.config.image_prefix, job_id),
            image: image.tag.clone(),
            labels: container_labels,
            limits: self.config.limits,
            user: SANDBOX_USER.to_string(),
        }
    }

    pub async fn create(&self, spec: ContainerSpec) -> Result<String, EngineError> {
        debug!(container = %spec.name, image = %spec.image, "creating container");
        self.engine.create_container(spec).await
    }

    /// Starts a created container and collects its output until it exits or `timeout` elapses.
    ///
    /// On timeout the container is killed and whatever it printed so far is kept.
    /// The container is not removed; that is the reaper's job.
    pub async fn run(&self, container_id: &str, timeout: Duration) -> Result<RunOutcome, EngineError> {
        let mut output = OutputBuffer::new(self.config.max_output_bytes);

        self.engine.start_container(container_id).await?;
        let started = Instant::now();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let sampler = self
            .monitor
            .spawn_sampler(container_id, self.config.sample_interval());

        let mut logs = self.engine.logs(container_id);
        let mut logs_open = true;
        let wait = self.engine.wait_container(container_id);
        tokio::pin!(wait);

        let termination = loop {
            tokio::select! {
                biased;
                status = &mut wait => break Termination::Exited(status?),
                chunk = logs.next(), if logs_open => match chunk {
                    Some(Ok(chunk)) => output.push(&chunk),
                    Some(Err(e)) => {
                        debug!(container = %container_id, "log stream ended: {e}");
                        logs_open = false;
                    }
                    None => logs_open = false,
                },
                _ = &mut deadline => break Termination::TimedOut,
            }
        };

        if termination == Termination::TimedOut {
            self.kill(container_id, &mut wait).await;
        }
        let elapsed = started.elapsed();
        let mut tracker = sampler.finish().await;

        if logs_open {
            let drain = async {
                while let Some(Ok(chunk)) = logs.next().await {
                    output.push(&chunk);
                }
            };
            if tokio::time::timeout(LOG_DRAIN_TIMEOUT, drain).await.is_err() {
                debug!(container = %container_id, "log drain timed out");
            }
        }

        let last = self.monitor.record(container_id, &mut tracker);
        if tokio::time::timeout(FINAL_SAMPLE_TIMEOUT, last).await.is_err() {
            debug!(container = %container_id, "final stats reading timed out");
        }

        Ok(RunOutcome {
            termination,
            output: output.into_string(),
            elapsed,
            usage: tracker.usage(),
        })
    }

    async fn kill<F>(&self, container_id: &str, wait: &mut std::pin::Pin<&mut F>)
    where
        F: Future<Output = Result<ExitStatus, EngineError>>,
    {
        match self.engine.kill_container(container_id).await {
            Ok(()) => {}
            // Exited between the deadline and the kill.
            Err(EngineError::NotFound(_) | EngineError::Conflict(_)) => {}
            Err(e) => warn!(container = %container_id, "failed to kill container: {e}"),
        }

        match tokio::time::timeout(self.config.kill_grace(), wait.as_mut()).await {
            Ok(Ok(status)) => {
                debug!(container = %container_id, code = status.code, "killed container stopped")
            }
            Ok(Err(e)) => debug!(container = %container_id, "wait after kill failed: {e}"),
            Err(_) => warn!(
                container = %container_id,
                "container still running after kill, leaving it to forced removal"
            ),
        }
    }
}
