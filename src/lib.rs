//! # Rentbox
//!
//! A sandbox for running untrusted, renter-submitted Python and JavaScript on a lender's
//! machine. Every job gets its own network-less container with hard memory and CPU caps
//! and a wall-clock timeout, and everything it created is removed afterwards.
//!
//! This crate serves as an entry point, re-exporting the core types and the sandbox
//! pipeline, and optionally the Docker engine, HTTP server, client and lender agent via
//! feature flags.
//!
//! ## Feature Flags
//!
//! | Feature | Description |
//! |---------|-------------|
//! | **`docker`** | Container engine backed by the local Docker daemon (`rentbox_docker`). |
//! | **`server`** | Axum-based HTTP front for the sandbox (`rentbox_server`). |
//! | **`client`** | HTTP clients for the rentbox server and the session service (`rentbox_client`). |
//! | **`agent`** | Lender agent that polls a session service for jobs (`rentbox_agent`). |
//!
//! ## Example: Run a Job
//!
//! ```toml
//! [dependencies]
//! rentbox = { version = "0.3", features = ["docker"] }
//! ```
//!
//! ```rust,ignore
//! use rentbox::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = DockerEngine::connect_local()?;
//!     let coordinator = Coordinator::new(engine, SandboxConfig::default())?;
//!
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

pub use rentbox_core::*;

pub mod sandbox {
    pub use rentbox_sandbox::*;
}

#[cfg(feature = "docker")]
pub mod docker {
    pub use rentbox_docker::*;
}

#[cfg(feature = "server")]
pub mod server {
    pub use rentbox_server::*;
}

#[cfg(feature = "client")]
pub mod client {
    pub use rentbox_client::*;
}

#[cfg(feature = "agent")]
pub mod agent {
    pub use rentbox_agent::*;
}

pub mod prelude {
    pub use rentbox_core::prelude::*;
    pub use rentbox_sandbox::prelude::*;

    #[cfg(feature = "docker")]
    pub use rentbox_docker::DockerEngine;

    #[cfg(feature = "server")]
    pub use rentbox_server::prelude::*;

    #[cfg(feature = "client")]
    pub use rentbox_client::{RentboxClient, SessionClient};

    #[cfg(feature = "agent")]
    pub use rentbox_agent::{Agent, AgentConfig};
}
