//! # Rentbox Server
//!
//! An Axum-based HTTP front for the sandbox [`Coordinator`](rentbox_sandbox::coordinator::Coordinator).
//!
//! Provides the [`RentboxServer`] builder, which wraps a coordinator in a router.
//!
//! ## Routes
//!
//! * **`GET /health`**: `OK` while the container engine answers, `503` otherwise.
//! * **`POST /jobs/execute`**: runs a [`JobRequest`](rentbox_core::job::JobRequest) and returns
//!   its [`ExecutionResult`](rentbox_core::job::ExecutionResult). Failed and timed out jobs are
//!   results too and come back with `200`.
//! * **`GET /jobs/active`**: ids of jobs currently running.
//!
//! ## Example
//!
//! ```no_run
//! use rentbox_core::prelude::*;
//! use rentbox_sandbox::prelude::*;
//! use rentbox_server::prelude::*;
//!
//! # fn run<E: ContainerEngine>(engine: E) -> Result<(), ConfigError> {
//! let coordinator = Coordinator::new(engine, SandboxConfig::default())?;
//! let app = RentboxServer::default().build(coordinator);
//! # Ok(())
//! # }
//! ```

mod api;

pub mod state;

use rentbox_core::constants::routes;
use rentbox_core::prelude::*;
use rentbox_sandbox::coordinator::Coordinator;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use state::AppState;
use tower_http::trace::TraceLayer;

/// The builder for the Rentbox Server.
#[derive(Clone, Debug, Default)]
pub struct RentboxServer {
    config: RentboxServerConfig,
}

impl RentboxServer {
    pub fn new(config: RentboxServerConfig) -> Self {
        Self { config }
    }
}

#[derive(Clone, Debug)]
pub struct RentboxServerConfig {
    /// Largest accepted request body.
    ///
    /// Defaults to 1 MiB.
    pub body_limit: usize,
}

impl Default for RentboxServerConfig {
    fn default() -> Self {
        Self {
            body_limit: 1024 * 1024,
        }
    }
}

impl RentboxServer {
    pub fn build<E: ContainerEngine, G: GpuProbe>(self, coordinator: Coordinator<E, G>) -> Router {
        let RentboxServerConfig { body_limit } = self.config;
        Router::new()
            .route(routes::HEALTH, get(api::health))
            .route(routes::JOBS_EXECUTE, post(api::execute))
            .route(routes::JOBS_ACTIVE, get(api::active_jobs))
            .layer(DefaultBodyLimit::max(body_limit))
            .layer(TraceLayer::new_for_http())
            .with_state(AppState { coordinator })
    }
}

pub mod prelude {
    pub use crate::state::*;
    pub use crate::{RentboxServer, RentboxServerConfig};
}
