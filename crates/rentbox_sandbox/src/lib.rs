//! # Rentbox Sandbox
//!
//! Runs untrusted programs in throwaway containers.
//!
//! - **[`Coordinator`](coordinator::Coordinator)**: the entry point. Takes a [`JobRequest`](rentbox_core::job::JobRequest), returns an [`ExecutionResult`](rentbox_core::job::ExecutionResult).
//! - **[`ImageBuilder`](builder::ImageBuilder)**: cached base images per language and dependency set, plus one image per job.
//! - **[`SandboxRunner`](runner::SandboxRunner)**: no network, capped CPU/memory/pids, hard timeout.
//! - **[`ResourceMonitor`](monitor::ResourceMonitor)**: CPU, memory and GPU usage of a run.
//! - **[`Reaper`](reaper::Reaper)**: removes what a job created, and sweeps up after crashes.
//!
//! ## Example
//!
//! ```no_run
//! use rentbox_core::prelude::*;
//! use rentbox_sandbox::prelude::*;
//!
//! async fn run<E: ContainerEngine>(engine: E) -> Result<(), ConfigError> {
//!     let coordinator = Coordinator::new(engine, SandboxConfig::default())?;
//!     let result = coordinator
//!         .execute(JobRequest {
//!             language: "python".into(),
//!             source_code: "print('hello')".into(),
//!             ..Default::default()
//!         })
//!         .await;
//!     println!("{}: {}", result.status, result.output);
//!     Ok(())
//! }
//! ```

pub mod builder;
pub mod coordinator;
pub mod gpu;
pub mod monitor;
pub mod reaper;
pub mod recipe;
pub mod runner;

pub mod prelude {
    pub use super::builder::{BaseImage, ImageBuilder};
    pub use super::coordinator::Coordinator;
    pub use super::gpu::NvidiaSmiProbe;
    pub use super::monitor::{ResourceMonitor, Sampler, UsageTracker};
    pub use super::reaper::{CleanupLedger, CleanupRecord, JobResources, Reaper, SweepReport};
    pub use super::runner::{RunOutcome, SandboxRunner, Termination};
}
