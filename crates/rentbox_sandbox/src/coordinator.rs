use crate::builder::{BaseImage, ImageBuilder};
use crate::monitor::ResourceMonitor;
use crate::reaper::{CleanupLedger, JobResources, Reaper, SweepReport};
use crate::runner::{RunOutcome, SandboxRunner, Termination};

use rentbox_core::output::truncate_text;
use rentbox_core::prelude::*;

use regex::Regex;
use std::collections::HashSet;
use std::sync::{Arc, LazyLock, Mutex, PoisonError};
use std::time::Duration;
use tracing::{Instrument, debug, error, info, info_span, warn};

static JOB_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,127}$").expect("job id pattern is valid")
});

/// Runs jobs end to end: build, run, report, clean up.
///
/// Every call to [`execute`](Coordinator::execute) returns an [`ExecutionResult`],
/// and every resource the job created has been handed to the reaper by the time
/// it does. Cloning is cheap; clones share the image cache and the active job set.
pub struct Coordinator<E: ContainerEngine, G: GpuProbe = NoGpuProbe> {
    inner: Arc<Inner<E, G>>,
}

impl<E: ContainerEngine, G: GpuProbe> Clone for Coordinator<E, G> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<E: ContainerEngine, G: GpuProbe> {
    engine: E,
    config: SandboxConfig,
    builder: ImageBuilder<E>,
    runner: SandboxRunner<E, G>,
    reaper: Reaper<E>,
    active: Mutex<HashSet<String>>,
}

/// What the pipeline produced, before it becomes an [`ExecutionResult`].
struct Report {
    status: JobStatus,
    output: String,
    error: Option<JobError>,
    usage: ResourceUsage,
    elapsed: Duration,
    exit_code: Option<i64>,
}

impl Report {
    fn failed(error: JobError) -> Self {
        Self {
            status: JobStatus::Failed,
            output: String::new(),
            error: Some(error),
            usage: ResourceUsage::default(),
            elapsed: Duration::ZERO,
            exit_code: None,
        }
    }
}

impl<E: ContainerEngine> Coordinator<E, NoGpuProbe> {
    pub fn new(engine: E, config: SandboxConfig) -> Result<Self, ConfigError> {
        Self::with_gpu_probe(engine, config, NoGpuProbe)
    }
}

impl<E: ContainerEngine, G: GpuProbe> Coordinator<E, G> {
    pub fn with_gpu_probe(engine: E, config: SandboxConfig, gpu: G) -> Result<Self, ConfigError> {
        config.validate()?;

        let monitor = ResourceMonitor::new(engine.clone(), gpu);
        Ok(Self {
            inner: Arc::new(Inner {
                builder: ImageBuilder::new(
                    engine.clone(),
                    config.image_prefix.clone(),
                    config.work_dir.clone(),
                )
                .remove_unused_bases(!config.keep_base_images),
                runner: SandboxRunner::new(engine.clone(), monitor, config.clone()),
                reaper: Reaper::new(engine.clone(), config.work_dir.clone()),
                active: Mutex::new(HashSet::new()),
                engine,
                config,
            }),
        })
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.inner.config
    }

    pub fn ledger(&self) -> &CleanupLedger {
        self.inner.reaper.ledger()
    }

    pub async fn ping(&self) -> Result<(), EngineError> {
        self.inner.engine.ping().await
    }

    /// Ids of jobs currently between acceptance and cleanup.
    pub fn active_jobs(&self) -> Vec<String> {
        let active = self.inner.active.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = active.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Removes leftovers of jobs that are not running in this process.
    pub async fn sweep(&self, include_base: bool) -> Result<SweepReport, EngineError> {
        let active: HashSet<String> = self.active_jobs().into_iter().collect();
        let report = self.inner.reaper.sweep(&active, include_base).await?;
        for tag in &report.base_tags {
            self.inner.builder.forget_tag(tag);
        }
        Ok(report)
    }

    /// Executes one job and returns its result. Never panics and never returns early
    /// without releasing the job's resources.
    pub async fn execute(&self, request: JobRequest) -> ExecutionResult {
        let job_id = request
            .job_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        // Detached, so a caller dropping this future cannot skip cleanup.
        let this = self.clone();
        let id = job_id.clone();
        let span = info_span!("job", job_id = %job_id);
        let supervisor = tokio::spawn(async move { this.supervise(id, request).await }.instrument(span));

        match supervisor.await {
            Ok(result) => result,
            Err(e) => {
                error!(job_id = %job_id, "job supervisor failed: {e}");
                self.result(&job_id, Report::failed(JobError::Internal))
            }
        }
    }

    async fn supervise(self, job_id: String, request: JobRequest) -> ExecutionResult {
        if !JOB_ID.is_match(&job_id) {
            return self.result(
                &job_id,
                Report::failed(JobError::InvalidRequest(
                    "job id must be 1-128 characters of letters, digits, '.', '_' or '-'"
                        .to_string(),
                )),
            );
        }

        let language = match request.language.parse::<Language>() {
            Ok(language) => language,
            Err(e) => {
                info!(language = %request.language, "rejected job: {e}");
                return self.result(&job_id, Report::failed(e.into()));
            }
        };

        if !self.activate(&job_id) {
            warn!("rejected job: id already active");
            return self.result(
                &job_id,
                Report::failed(JobError::InvalidRequest(format!(
                    "job {job_id} is already running"
                ))),
            );
        }

        let timeout = self.inner.config.effective_timeout(request.timeout_ms);
        let job = Job::new(
            job_id.clone(),
            language,
            request.source_code,
            request.dependencies,
            timeout.as_millis() as u64,
        );
        info!(
            %language,
            dependencies = job.dependencies.len(),
            timeout_ms = job.timeout_ms,
            "job accepted"
        );

        let resources = Arc::new(Mutex::new(JobResources::new(&job_id)));
        let held_base = Arc::new(Mutex::new(None));
        let pipeline = tokio::spawn(
            self.clone()
                .pipeline(job, Arc::clone(&resources), Arc::clone(&held_base))
                .in_current_span(),
        );

        let report = match pipeline.await {
            Ok(report) => report,
            Err(e) => {
                error!("job pipeline aborted: {e}");
                Report::failed(JobError::Internal)
            }
        };

        let resources = resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        self.inner.reaper.cleanup(&resources).await;
        let base = held_base.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(base) = base {
            self.release_base(&job_id, &base).await;
        }
        self.deactivate(&job_id);

        let result = self.result(&job_id, report);
        info!(
            status = %result.status,
            exit_code = result.exit_code,
            execution_time_ms = result.execution_time_ms,
            "job finished"
        );
        result
    }

    async fn pipeline(
        self,
        mut job: Job,
        resources: Arc<Mutex<JobResources>>,
        held_base: Arc<Mutex<Option<BaseImage>>>,
    ) -> Report {
        let config = &self.inner.config;
        let context_dir = config.work_dir.join(&job.id);
        let job_image = ImageHandle {
            tag: job_image_tag(&config.image_prefix, &job.id),
            kind: ImageKind::Job,
        };
        let container_name = job_container_name(&config.image_prefix, &job.id);

        // Known names are registered up front so partial builds and creates are reaped too.
        {
            let mut resources = resources.lock().unwrap_or_else(PoisonError::into_inner);
            resources.temp_paths.push(context_dir.clone());
            resources.images.push(job_image.clone());
            resources.container = Some(container_name);
        }

        advance(&mut job, JobStatus::Building);
        let base = match self
            .inner
            .builder
            .base_image(job.language, &job.dependencies)
            .await
        {
            Ok(base) => base,
            Err(e) => return fail(&mut job, e.into()),
        };
        info!(image = %base.handle.tag, reused = base.reused, "base image ready");
        let base_handle = base.handle.clone();
        *held_base.lock().unwrap_or_else(PoisonError::into_inner) = Some(base);

        let image = match self
            .inner
            .builder
            .job_image(&job, &base_handle, &context_dir)
            .await
        {
            Ok(image) => image,
            Err(e) => return fail(&mut job, e.into()),
        };

        advance(&mut job, JobStatus::Running);
        let spec = self.inner.runner.container_spec(&job.id, &image);
        let container_id = match self.inner.runner.create(spec).await {
            Ok(id) => id,
            Err(e) => return fail(&mut job, e.into()),
        };

        let timeout = Duration::from_millis(job.timeout_ms);
        match self.inner.runner.run(&container_id, timeout).await {
            Ok(outcome) => classify(&mut job, outcome, &config.limits),
            Err(e) => fail(&mut job, e.into()),
        }
    }

    /// Runs after the job's own container and image are gone.
    async fn release_base(&self, job_id: &str, base: &BaseImage) {
        match self.inner.builder.release(base).await {
            Ok(()) => {}
            // Still used by a container outside this process.
            Err(EngineError::Conflict(msg)) => {
                debug!(image = %base.handle.tag, "base image still in use: {msg}");
            }
            Err(e) => {
                let failure = CleanupError {
                    kind: ResourceKind::Image,
                    name: base.handle.tag.clone(),
                    message: e.to_string(),
                };
                warn!("{failure}");
                self.inner.reaper.ledger().record(job_id, failure);
            }
        }
    }

    fn result(&self, job_id: &str, report: Report) -> ExecutionResult {
        ExecutionResult {
            job_id: job_id.to_string(),
            status: report.status,
            output: report.output,
            error: report
                .error
                .map(|e| truncate_text(&e.to_string(), self.inner.config.max_error_bytes))
                .unwrap_or_default(),
            resource_usage: report.usage,
            execution_time_ms: report.elapsed.as_millis() as u64,
            exit_code: report.exit_code,
        }
    }

    fn activate(&self, job_id: &str) -> bool {
        self.inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_id.to_string())
    }

    fn deactivate(&self, job_id: &str) {
        self.inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(job_id);
    }
}

fn advance(job: &mut Job, next: JobStatus) {
    if let Err(e) = job.transition(next) {
        error!(job_id = %job.id, "{e}");
    }
}

fn fail(job: &mut Job, error: JobError) -> Report {
    warn!(job_id = %job.id, stage = %job.status(), "job failed: {error}");
    advance(job, JobStatus::Failed);
    Report::failed(error)
}

fn classify(job: &mut Job, outcome: RunOutcome, resource_limits: &ResourceLimits) -> Report {
    let exit_code = outcome.exit_code();
    let (status, error) = match outcome.termination {
        Termination::TimedOut => (JobStatus::TimedOut, Some(JobError::RunTimeout(job.timeout_ms))),
        Termination::Exited(status) if status.oom_killed => (
            JobStatus::Failed,
            Some(JobError::RunFailure(format!(
                "Memory limit of {} MiB exceeded",
                resource_limits.memory_bytes / limits::MIB
            ))),
        ),
        Termination::Exited(status) if status.code != 0 => (
            JobStatus::Failed,
            Some(JobError::RunFailure(format!(
                "Process exited with code {}",
                status.code
            ))),
        ),
        Termination::Exited(_) => (JobStatus::Completed, None),
    };
    advance(job, status);

    Report {
        status,
        output: outcome.output,
        error,
        usage: outcome.usage,
        elapsed: outcome.elapsed,
        exit_code,
    }
}
