use thiserror::Error;

/// Errors reported by a [`ContainerEngine`](crate::traits::ContainerEngine) implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The engine daemon could not be reached or refused the connection.
    #[error("Container engine unavailable: {0}")]
    Unavailable(String),

    /// The container or image does not exist (anymore).
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// A build step failed, e.g. a package manager exited non-zero.
    #[error("Image build failed: {0}")]
    BuildFailed(String),

    /// The engine refused the request because of the resource's state
    /// (e.g., removing an image that still has containers).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Any other engine API failure.
    #[error("Engine request failed: {0}")]
    Api(String),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }
}

/// Failures of the image builder.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BuildError {
    /// The requested language has no build recipe. No resources were created.
    /// Maps to **HTTP 400 Bad Request** when raised from request validation.
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    /// A declared dependency was rejected or could not be installed.
    #[error("Dependency resolution failed: {0}")]
    DependencyResolution(String),

    /// The container engine could not be used.
    #[error("Container engine unavailable: {0}")]
    EngineUnavailable(String),

    /// The per-job image could not be built.
    #[error("Image build failed: {0}")]
    Image(String),

    /// The build context could not be written to disk.
    #[error("Could not prepare build context: {0}")]
    Context(String),
}

impl From<EngineError> for BuildError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Unavailable(msg) => BuildError::EngineUnavailable(msg),
            EngineError::BuildFailed(msg) => BuildError::Image(msg),
            other => BuildError::Image(other.to_string()),
        }
    }
}

impl From<std::io::Error> for BuildError {
    fn from(err: std::io::Error) -> Self {
        BuildError::Context(err.to_string())
    }
}

/// Terminal failure of a job. The [`Display`](std::fmt::Display) text is what the renter sees.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Build(#[from] BuildError),

    /// The wall-clock budget elapsed before the program finished.
    #[error("Execution timed out after {0} ms")]
    RunTimeout(u64),

    /// The renter's process exited non-zero or was killed by the memory ceiling.
    #[error("{0}")]
    RunFailure(String),

    /// The engine failed for reasons unrelated to the renter's code.
    #[error("Container engine error: {0}")]
    Engine(String),

    /// A sandbox stage panicked. Details are logged, never returned.
    #[error("Internal sandbox error")]
    Internal,
}

impl From<EngineError> for JobError {
    fn from(err: EngineError) -> Self {
        JobError::Engine(err.to_string())
    }
}

/// The kind of resource a cleanup step was working on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Container,
    Image,
    TempPath,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResourceKind::Container => "container",
            ResourceKind::Image => "image",
            ResourceKind::TempPath => "temp path",
        };
        f.write_str(s)
    }
}

/// A resource could not be released. Logged and recorded, never surfaced as a job failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Failed to remove {kind} {name}: {message}")]
pub struct CleanupError {
    pub kind: ResourceKind,
    pub name: String,
    pub message: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("default timeout ({default_ms} ms) exceeds the maximum timeout ({max_ms} ms)")]
    TimeoutOrder { default_ms: u64, max_ms: u64 },

    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}
