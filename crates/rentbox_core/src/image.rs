use crate::language::Language;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Cache key of a base image: the language plus a hash of its normalized dependency set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageKey {
    pub language: Language,
    pub dependency_hash: String,
}

impl ImageKey {
    /// Two dependency lists that differ only in order, duplicates or surrounding
    /// whitespace produce the same key.
    pub fn new(language: Language, dependencies: &[String]) -> Self {
        let deps = normalize_dependencies(dependencies);

        let mut hasher = Sha256::new();
        hasher.update(language.as_str().as_bytes());
        for dep in &deps {
            hasher.update([0u8]);
            hasher.update(dep.as_bytes());
        }

        Self {
            language,
            dependency_hash: hex::encode(hasher.finalize()),
        }
    }

    /// The image tag for this key. Derived from the key alone so any host rebuilds the same name.
    pub fn tag(&self, prefix: &str) -> String {
        format!(
            "{prefix}-base-{}:{}",
            self.language,
            self.short_hash()
        )
    }

    /// First 16 hex digits of the hash, or all of it when shorter.
    fn short_hash(&self) -> &str {
        self.dependency_hash
            .get(..16)
            .unwrap_or(&self.dependency_hash)
    }
}

impl fmt::Display for ImageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.language, self.short_hash())
    }
}

/// Trimmed, de-duplicated and sorted.
pub fn normalize_dependencies(dependencies: &[String]) -> Vec<String> {
    let mut deps: Vec<String> = dependencies
        .iter()
        .map(|d| d.trim())
        .filter(|d| !d.is_empty())
        .map(str::to_string)
        .collect();
    deps.sort();
    deps.dedup();
    deps
}

/// Tag of the ephemeral image holding one job's source.
pub fn job_image_tag(prefix: &str, job_id: &str) -> String {
    format!("{prefix}-job:{job_id}")
}

/// Name of the one container a job runs in.
pub fn job_container_name(prefix: &str, job_id: &str) -> String {
    format!("{prefix}-job-{job_id}")
}

/// Whether an image is shared across jobs or belongs to exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageKind {
    Base,
    Job,
}

impl ImageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageKind::Base => "base",
            ImageKind::Job => "job",
        }
    }
}

/// A built image that can be handed to the runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHandle {
    pub tag: String,
    pub kind: ImageKind,
}
