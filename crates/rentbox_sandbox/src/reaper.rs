use rentbox_core::prelude::*;

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tracing::{debug, info, warn};

/// Base build contexts younger than this may belong to a build still in flight.
const STALE_BUILD_CONTEXT: Duration = Duration::from_secs(60 * 60);

/// Everything one job created that must be released when it ends.
#[derive(Debug, Clone, Default)]
pub struct JobResources {
    pub job_id: String,
    /// Container name or id.
    pub container: Option<String>,
    pub images: Vec<ImageHandle>,
    pub temp_paths: Vec<PathBuf>,
}

impl JobResources {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.container.is_none() && self.images.is_empty() && self.temp_paths.is_empty()
    }
}

/// A cleanup failure, kept for operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupRecord {
    pub job_id: String,
    pub error: CleanupError,
    pub at: DateTime<Utc>,
}

/// Shared list of cleanup failures.
#[derive(Debug, Clone, Default)]
pub struct CleanupLedger {
    records: Arc<Mutex<Vec<CleanupRecord>>>,
}

impl CleanupLedger {
    pub fn record(&self, job_id: &str, error: CleanupError) {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.push(CleanupRecord {
            job_id: job_id.to_string(),
            error,
            at: Utc::now(),
        });
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns and clears all records.
    pub fn drain(&self) -> Vec<CleanupRecord> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *records)
    }
}

/// What a [`Reaper::sweep`] removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub containers: usize,
    pub images: usize,
    pub temp_paths: usize,
    /// Base image tags removed. Callers holding an image cache must forget them.
    pub base_tags: Vec<String>,
    pub failures: Vec<CleanupError>,
}

/// Releases containers, images and temp paths. Removing something that is already gone is a no-op.
#[derive(Clone)]
pub struct Reaper<E: ContainerEngine> {
    engine: E,
    work_dir: PathBuf,
    ledger: CleanupLedger,
}

impl<E: ContainerEngine> Reaper<E> {
    pub fn new(engine: E, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            work_dir: work_dir.into(),
            ledger: CleanupLedger::default(),
        }
    }

    pub fn ledger(&self) -> &CleanupLedger {
        &self.ledger
    }

    /// Releases everything in `resources`: container first, then images, then temp paths.
    ///
    /// Never fails; every failure is logged, recorded in the ledger and returned.
    pub async fn cleanup(&self, resources: &JobResources) -> Vec<CleanupError> {
        let mut failures = Vec::new();

        if let Some(container) = &resources.container {
            if let Err(e) = self.engine.remove_container(container).await {
                if !e.is_not_found() {
                    failures.push(cleanup_error(ResourceKind::Container, container, e));
                }
            }
        }

        for image in &resources.images {
            match self.engine.remove_image(&image.tag).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => failures.push(cleanup_error(ResourceKind::Image, &image.tag, e)),
            }
        }

        for path in &resources.temp_paths {
            if let Err(e) = remove_path(path).await {
                failures.push(CleanupError {
                    kind: ResourceKind::TempPath,
                    name: path.display().to_string(),
                    message: e.to_string(),
                });
            }
        }

        for failure in &failures {
            warn!(job_id = %resources.job_id, "{failure}");
            self.ledger.record(&resources.job_id, failure.clone());
        }
        if failures.is_empty() {
            debug!(job_id = %resources.job_id, "job resources released");
        }

        failures
    }

    /// Removes labelled resources no active job owns, plus leftover build contexts.
    ///
    /// Recovers from crashes that skipped per-job cleanup. Base images are only
    /// removed with `include_base`.
    pub async fn sweep(
        &self,
        active: &HashSet<String>,
        include_base: bool,
    ) -> Result<SweepReport, EngineError> {
        let mut report = SweepReport::default();
        let managed = format!("{}=true", labels::MANAGED);

        for container in self.engine.list_containers(&managed).await? {
            if owned_by_active_job(&container, active) {
                continue;
            }
            match self.engine.remove_container(&container.name).await {
                Ok(()) => report.containers += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => report.failures.push(cleanup_error(
                    ResourceKind::Container,
                    &container.name,
                    e,
                )),
            }
        }

        for image in self.engine.list_images(&managed).await? {
            let is_base = image.labels.get(labels::KIND).map(String::as_str)
                == Some(ImageKind::Base.as_str());
            if (is_base && !include_base) || owned_by_active_job(&image, active) {
                continue;
            }
            match self.engine.remove_image(&image.name).await {
                Ok(()) => {
                    report.images += 1;
                    if is_base {
                        report.base_tags.push(image.name);
                    }
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    report
                        .failures
                        .push(cleanup_error(ResourceKind::Image, &image.name, e))
                }
            }
        }

        self.sweep_work_dir(active, &mut report).await;

        for failure in &report.failures {
            warn!("sweep: {failure}");
        }
        info!(
            containers = report.containers,
            images = report.images,
            temp_paths = report.temp_paths,
            failures = report.failures.len(),
            "sweep finished"
        );

        Ok(report)
    }

    async fn sweep_work_dir(&self, active: &HashSet<String>, report: &mut SweepReport) {
        let mut entries = match fs::read_dir(&self.work_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return,
            Err(e) => {
                warn!(path = %self.work_dir.display(), "cannot read work dir: {e}");
                return;
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if active.contains(&name) {
                continue;
            }
            if name.starts_with("base-") && !is_stale(&entry.path()).await {
                continue;
            }

            let path = entry.path();
            match remove_path(&path).await {
                Ok(()) => report.temp_paths += 1,
                Err(e) => report.failures.push(CleanupError {
                    kind: ResourceKind::TempPath,
                    name: path.display().to_string(),
                    message: e.to_string(),
                }),
            }
        }
    }
}

fn owned_by_active_job(resource: &ManagedResource, active: &HashSet<String>) -> bool {
    resource
        .labels
        .get(labels::JOB)
        .is_some_and(|job| active.contains(job))
}

fn cleanup_error(kind: ResourceKind, name: &str, err: EngineError) -> CleanupError {
    CleanupError {
        kind,
        name: name.to_string(),
        message: err.to_string(),
    }
}

async fn is_stale(path: &Path) -> bool {
    let Ok(modified) = fs::metadata(path).await.and_then(|m| m.modified()) else {
        return false;
    };
    SystemTime::now()
        .duration_since(modified)
        .is_ok_and(|age| age > STALE_BUILD_CONTEXT)
}

/// Removes a file or directory tree. Missing paths are fine.
async fn remove_path(path: &Path) -> std::io::Result<()> {
    let result = match fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).await,
        Ok(_) => fs::remove_file(path).await,
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
