pub mod labels {
    /// Set on every container and image created by the sandbox.
    pub const MANAGED: &str = "rentbox.managed";
    /// `base` or `job`, see [`ImageKind`](crate::image::ImageKind).
    pub const KIND: &str = "rentbox.kind";
    /// The owning job id. Absent on base images.
    pub const JOB: &str = "rentbox.job";
}

pub mod limits {
    pub const MIB: u64 = 1024 * 1024;
    pub const NANO_CPUS_PER_CORE: i64 = 1_000_000_000;

    pub const DEFAULT_MEMORY_BYTES: u64 = 512 * MIB;
    pub const DEFAULT_NANO_CPUS: i64 = NANO_CPUS_PER_CORE / 2;
    pub const DEFAULT_PIDS_LIMIT: i64 = 128;
    pub const DEFAULT_TMPFS_BYTES: u64 = 64 * MIB;

    pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;
    pub const MAX_TIMEOUT_MS: u64 = 60_000;

    pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 64 * 1024;
    pub const DEFAULT_MAX_ERROR_BYTES: usize = 4 * 1024;

    pub const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 250;
    pub const DEFAULT_KILL_GRACE_MS: u64 = 2_000;
}

pub mod routes {
    pub const HEALTH: &str = "/health";
    pub const JOBS_EXECUTE: &str = "/jobs/execute";
    pub const JOBS_ACTIVE: &str = "/jobs/active";

    /// Session service endpoints polled by the lender agent.
    pub const LENDER_NEXT_JOB: &str = "/lender/jobs/next";
    pub const LENDER_JOB_RESULT: &str = "/lender/jobs/{id}/result";
}

/// User the renter's process runs as inside the container (`nobody`).
pub const SANDBOX_USER: &str = "65534:65534";

/// Appended to output that hit the size cap.
pub const TRUNCATION_MARKER: &str = "\n[output truncated]\n";
