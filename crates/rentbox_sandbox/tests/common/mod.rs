#![allow(dead_code)]

use rentbox_core::prelude::*;

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// What a started container does.
#[derive(Clone, Debug)]
pub struct Program {
    pub output: Vec<LogChunk>,
    /// [`None`] runs until killed.
    pub runtime: Option<Duration>,
    pub exit: ExitStatus,
}

impl Program {
    pub fn prints(text: &str) -> Self {
        Self {
            output: vec![stdout(text)],
            runtime: Some(Duration::from_millis(20)),
            exit: ExitStatus {
                code: 0,
                oom_killed: false,
            },
        }
    }

    pub fn exits(mut self, code: i64) -> Self {
        self.exit.code = code;
        self
    }

    pub fn oom(mut self) -> Self {
        self.exit = ExitStatus {
            code: 137,
            oom_killed: true,
        };
        self
    }

    pub fn hangs(mut self) -> Self {
        self.runtime = None;
        self
    }
}

pub fn stdout(text: &str) -> LogChunk {
    LogChunk {
        source: LogSource::Stdout,
        bytes: Bytes::from(text.to_string()),
    }
}

#[derive(Clone, Debug)]
pub struct Behavior {
    pub program: Program,
    pub build_delay: Duration,
    /// Number of upcoming base builds that fail.
    pub failing_base_builds: usize,
    pub fail_job_build: bool,
    pub fail_image_removal: bool,
    pub panic_on_start: bool,
    pub stats: Vec<StatsSample>,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            program: Program::prints("hello\n"),
            build_delay: Duration::ZERO,
            failing_base_builds: 0,
            fail_job_build: false,
            fail_image_removal: false,
            panic_on_start: false,
            stats: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct FakeContainer {
    name: String,
    image: String,
    labels: HashMap<String, String>,
    killed: watch::Sender<bool>,
}

#[derive(Default)]
struct State {
    behavior: Behavior,
    images: HashMap<String, HashMap<String, String>>,
    containers: HashMap<String, FakeContainer>,
    dockerfiles: HashMap<String, String>,
    base_builds: usize,
    job_builds: usize,
    stats_calls: usize,
    next_id: usize,
    last_spec: Option<ContainerSpec>,
}

/// In-memory [`ContainerEngine`].
#[derive(Clone, Default)]
pub struct FakeEngine {
    state: Arc<Mutex<State>>,
}

impl FakeEngine {
    pub fn new(behavior: Behavior) -> Self {
        let engine = Self::default();
        engine.state.lock().unwrap().behavior = behavior;
        engine
    }

    pub fn set_program(&self, program: Program) {
        self.state.lock().unwrap().behavior.program = program;
    }

    pub fn base_builds(&self) -> usize {
        self.state.lock().unwrap().base_builds
    }

    pub fn job_builds(&self) -> usize {
        self.state.lock().unwrap().job_builds
    }

    pub fn container_count(&self) -> usize {
        self.state.lock().unwrap().containers.len()
    }

    pub fn last_spec(&self) -> Option<ContainerSpec> {
        self.state.lock().unwrap().last_spec.clone()
    }

    pub fn image_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.state.lock().unwrap().images.keys().cloned().collect();
        tags.sort();
        tags
    }

    pub fn job_images(&self) -> Vec<String> {
        self.image_tags()
            .into_iter()
            .filter(|t| t.contains("-job:"))
            .collect()
    }

    pub fn dockerfile(&self, tag: &str) -> Option<String> {
        self.state.lock().unwrap().dockerfiles.get(tag).cloned()
    }

    /// Adds a labelled container as if left behind by a crashed process.
    pub fn insert_container(&self, name: &str, labels: HashMap<String, String>) {
        let mut state = self.state.lock().unwrap();
        let (killed, _) = watch::channel(false);
        state.containers.insert(
            name.to_string(),
            FakeContainer {
                name: name.to_string(),
                image: String::new(),
                labels,
                killed,
            },
        );
    }

    pub fn insert_image(&self, tag: &str, labels: HashMap<String, String>) {
        self.state
            .lock()
            .unwrap()
            .images
            .insert(tag.to_string(), labels);
    }

    fn find(state: &State, id: &str) -> Option<String> {
        if state.containers.contains_key(id) {
            return Some(id.to_string());
        }
        state
            .containers
            .iter()
            .find(|(_, c)| c.name == id)
            .map(|(key, _)| key.clone())
    }
}

fn matches_label(labels: &HashMap<String, String>, filter: &str) -> bool {
    match filter.split_once('=') {
        Some((k, v)) => labels.get(k).is_some_and(|value| value == v),
        None => labels.contains_key(filter),
    }
}

impl ContainerEngine for FakeEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn image_exists(&self, tag: &str) -> Result<bool, EngineError> {
        Ok(self.state.lock().unwrap().images.contains_key(tag))
    }

    async fn build_image(&self, ctx: BuildContext) -> Result<(), EngineError> {
        let dockerfile = std::fs::read_to_string(ctx.dir.join("Dockerfile"))
            .map_err(|e| EngineError::BuildFailed(e.to_string()))?;
        let is_base = ctx.tag.contains("-base-");

        let delay = self.state.lock().unwrap().behavior.build_delay;
        tokio::time::sleep(delay).await;

        let mut state = self.state.lock().unwrap();
        state.dockerfiles.insert(ctx.tag.clone(), dockerfile.clone());
        if is_base {
            state.base_builds += 1;
            if state.behavior.failing_base_builds > 0 {
                state.behavior.failing_base_builds -= 1;
                return Err(EngineError::BuildFailed(
                    "ERROR: No matching distribution found".into(),
                ));
            }
        } else {
            state.job_builds += 1;
            if state.behavior.fail_job_build {
                return Err(EngineError::BuildFailed("COPY failed".into()));
            }
            let from = dockerfile
                .lines()
                .find_map(|line| line.strip_prefix("FROM "))
                .unwrap_or_default()
                .trim();
            if !state.images.contains_key(from) {
                return Err(EngineError::BuildFailed(format!(
                    "pull access denied for {from}"
                )));
            }
        }
        state.images.insert(ctx.tag, ctx.labels);
        Ok(())
    }

    async fn create_container(&self, spec: ContainerSpec) -> Result<String, EngineError> {
        let mut state = self.state.lock().unwrap();
        if !state.images.contains_key(&spec.image) {
            return Err(EngineError::NotFound(spec.image.clone()));
        }
        if state.containers.values().any(|c| c.name == spec.name) {
            return Err(EngineError::Conflict(format!("name {} in use", spec.name)));
        }

        state.next_id += 1;
        let id = format!("c{:04}", state.next_id);
        let (killed, _) = watch::channel(false);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                name: spec.name.clone(),
                image: spec.image.clone(),
                labels: spec.labels.clone(),
                killed,
            },
        );
        state.last_spec = Some(spec);
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        let panic_on_start = self.state.lock().unwrap().behavior.panic_on_start;
        if panic_on_start {
            panic!("engine exploded");
        }
        let state = self.state.lock().unwrap();
        match Self::find(&state, id) {
            Some(_) => Ok(()),
            None => Err(EngineError::NotFound(id.to_string())),
        }
    }

    fn logs(&self, _id: &str) -> BoxStream<'static, Result<LogChunk, EngineError>> {
        let chunks = self.state.lock().unwrap().behavior.program.output.clone();
        stream::iter(chunks.into_iter().map(Ok)).boxed()
    }

    async fn wait_container(&self, id: &str) -> Result<ExitStatus, EngineError> {
        let (mut killed, program) = {
            let state = self.state.lock().unwrap();
            let key = Self::find(&state, id).ok_or_else(|| EngineError::NotFound(id.to_string()))?;
            (
                state.containers[&key].killed.subscribe(),
                state.behavior.program.clone(),
            )
        };

        let killed_status = ExitStatus {
            code: 137,
            oom_killed: false,
        };
        match program.runtime {
            Some(runtime) => tokio::select! {
                _ = tokio::time::sleep(runtime) => Ok(program.exit),
                _ = killed.wait_for(|k| *k) => Ok(killed_status),
            },
            None => {
                // A dropped sender means the container was removed.
                let _ = killed.wait_for(|k| *k).await;
                Ok(killed_status)
            }
        }
    }

    async fn kill_container(&self, id: &str) -> Result<(), EngineError> {
        let state = self.state.lock().unwrap();
        let key = Self::find(&state, id).ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        state.containers[&key].killed.send_replace(true);
        Ok(())
    }

    async fn stats(&self, id: &str) -> Result<Option<StatsSample>, EngineError> {
        let mut state = self.state.lock().unwrap();
        if Self::find(&state, id).is_none() {
            return Ok(None);
        }
        let samples = &state.behavior.stats;
        let sample = match samples.len() {
            0 => None,
            n => Some(samples[state.stats_calls.min(n - 1)]),
        };
        state.stats_calls += 1;
        Ok(sample)
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        let key = Self::find(&state, id).ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        if let Some(container) = state.containers.remove(&key) {
            container.killed.send_replace(true);
        }
        Ok(())
    }

    async fn remove_image(&self, tag: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        if !state.images.contains_key(tag) {
            return Err(EngineError::NotFound(tag.to_string()));
        }
        if state.behavior.fail_image_removal {
            return Err(EngineError::Api("device busy".into()));
        }
        if state.containers.values().any(|c| c.image == tag) {
            return Err(EngineError::Conflict(format!("image {tag} is in use")));
        }
        state.images.remove(tag);
        Ok(())
    }

    async fn list_containers(&self, label: &str) -> Result<Vec<ManagedResource>, EngineError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .containers
            .iter()
            .filter(|(_, c)| matches_label(&c.labels, label))
            .map(|(id, c)| ManagedResource {
                name: id.clone(),
                labels: c.labels.clone(),
            })
            .collect())
    }

    async fn list_images(&self, label: &str) -> Result<Vec<ManagedResource>, EngineError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .images
            .iter()
            .filter(|(_, labels)| matches_label(labels, label))
            .map(|(tag, labels)| ManagedResource {
                name: tag.clone(),
                labels: labels.clone(),
            })
            .collect())
    }
}

pub fn test_config(work_dir: &std::path::Path) -> SandboxConfig {
    SandboxConfig {
        work_dir: work_dir.to_path_buf(),
        sample_interval_ms: 10,
        kill_grace_ms: 500,
        default_timeout_ms: 2_000,
        ..Default::default()
    }
}

pub fn request(language: &str, source: &str) -> JobRequest {
    JobRequest {
        language: language.into(),
        source_code: source.into(),
        ..Default::default()
    }
}

pub fn deps(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}
