use crate::config::ResourceLimits;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// A directory holding a `Dockerfile` and the files it copies in.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub tag: String,
    pub dir: PathBuf,
    pub labels: HashMap<String, String>,
}

/// Everything the engine needs to create a sandbox container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub labels: HashMap<String, String>,
    pub limits: ResourceLimits,
    /// `uid:gid` the entrypoint runs as.
    pub user: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LogSource {
    Stdout,
    Stderr,
    /// Raw, non-demultiplexed output (e.g. a tty attached container).
    Console,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogChunk {
    pub source: LogSource,
    pub bytes: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: i64,
    /// The kernel killed the process for exceeding the memory ceiling.
    pub oom_killed: bool,
}

/// One raw stats reading. Fields the engine did not report are [`None`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSample {
    /// Cumulative CPU time of the container, in nanoseconds.
    pub cpu_total_usage: Option<u64>,
    /// Cumulative CPU time of the host, in nanoseconds.
    pub system_cpu_usage: Option<u64>,
    pub online_cpus: Option<u32>,
    /// Working-set memory in bytes.
    pub memory_usage: Option<u64>,
}

impl StatsSample {
    /// Whether the sample carries CPU counters usable for a rate.
    pub fn has_cpu(&self) -> bool {
        matches!(self.cpu_total_usage, Some(c) if c > 0)
            && matches!(self.system_cpu_usage, Some(s) if s > 0)
    }
}

/// A container or image carrying the sandbox's labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedResource {
    /// Engine id (containers) or tag (images).
    pub name: String,
    pub labels: HashMap<String, String>,
}
