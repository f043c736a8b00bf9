use crate::constants::limits::*;
use crate::error::ConfigError;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Hard limits applied to every sandbox container. There is no knob for networking: it is always off.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ResourceLimits {
    /// Memory ceiling in bytes. Swap is capped at the same value.
    pub memory_bytes: u64,
    /// CPU share in billionths of a core (`500_000_000` = half a core).
    pub nano_cpus: i64,
    pub pids_limit: i64,
    /// Size of the writable `/tmp` tmpfs.
    pub tmpfs_bytes: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: DEFAULT_MEMORY_BYTES,
            nano_cpus: DEFAULT_NANO_CPUS,
            pids_limit: DEFAULT_PIDS_LIMIT,
            tmpfs_bytes: DEFAULT_TMPFS_BYTES,
        }
    }
}

/// Per-deployment sandbox configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SandboxConfig {
    pub limits: ResourceLimits,
    /// Used when a request carries no timeout.
    pub default_timeout_ms: u64,
    /// Requested timeouts are clamped to this value.
    pub max_timeout_ms: u64,
    pub max_output_bytes: usize,
    pub max_error_bytes: usize,
    /// Interval between stats samples while a container runs.
    pub sample_interval_ms: u64,
    /// How long to wait for a killed container to be reported as stopped.
    pub kill_grace_ms: u64,
    /// Root for per-job build contexts.
    pub work_dir: PathBuf,
    /// Prefix of every image tag and container name.
    pub image_prefix: String,
    /// Keep base images with dependencies once no running job uses them.
    pub keep_base_images: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            limits: ResourceLimits::default(),
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            max_timeout_ms: MAX_TIMEOUT_MS,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            max_error_bytes: DEFAULT_MAX_ERROR_BYTES,
            sample_interval_ms: DEFAULT_SAMPLE_INTERVAL_MS,
            kill_grace_ms: DEFAULT_KILL_GRACE_MS,
            work_dir: std::env::temp_dir().join("rentbox"),
            image_prefix: "rentbox".to_string(),
            keep_base_images: true,
        }
    }
}

impl SandboxConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.memory_bytes == 0 {
            return Err(ConfigError::Zero("memory limit"));
        }
        if self.limits.nano_cpus <= 0 {
            return Err(ConfigError::Zero("cpu share"));
        }
        if self.limits.pids_limit <= 0 {
            return Err(ConfigError::Zero("pids limit"));
        }
        if self.default_timeout_ms == 0 {
            return Err(ConfigError::Zero("default timeout"));
        }
        if self.max_timeout_ms == 0 {
            return Err(ConfigError::Zero("max timeout"));
        }
        if self.default_timeout_ms > self.max_timeout_ms {
            return Err(ConfigError::TimeoutOrder {
                default_ms: self.default_timeout_ms,
                max_ms: self.max_timeout_ms,
            });
        }
        if self.max_output_bytes == 0 {
            return Err(ConfigError::Zero("output cap"));
        }
        if self.sample_interval_ms == 0 {
            return Err(ConfigError::Zero("sample interval"));
        }

        let prefix_ok = !self.image_prefix.is_empty()
            && self
                .image_prefix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
        if !prefix_ok {
            return Err(ConfigError::Invalid(
                "image prefix",
                self.image_prefix.clone(),
            ));
        }

        Ok(())
    }

    /// The effective timeout for a request: the default when absent, clamped to `1..=max`.
    pub fn effective_timeout(&self, requested_ms: Option<u64>) -> Duration {
        let ms = requested_ms
            .unwrap_or(self.default_timeout_ms)
            .clamp(1, self.max_timeout_ms);
        Duration::from_millis(ms)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}
