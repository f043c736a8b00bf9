//! # Rentbox Core
//!
//! Types and traits shared by the sandbox crates.
//!
//! - **[`Job`](job::Job)** / **[`ExecutionResult`](job::ExecutionResult)**: one execution attempt and its outcome.
//! - **[`ImageKey`](image::ImageKey)**: content address of a cached base image (language + dependency set).
//! - **[`ContainerEngine`](traits::ContainerEngine)**: trait for plugging in a container engine (e.g., Docker).
//! - **[`SandboxConfig`](config::SandboxConfig)**: per-deployment limits and timeouts.

pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod image;
pub mod job;
pub mod language;
pub mod output;
pub mod traits;
pub mod usage;

pub mod prelude {
    pub use super::config::*;
    pub use super::constants::*;
    pub use super::engine::*;
    pub use super::error::*;
    pub use super::image::*;
    pub use super::job::*;
    pub use super::language::*;
    pub use super::traits::*;
}
