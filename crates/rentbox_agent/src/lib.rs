//! # Rentbox Agent
//!
//! The lender-side worker. Polls the session service for pending jobs, runs them in
//! the local sandbox and reports the results back.
//!
//! ```no_run
//! use rentbox_agent::{Agent, AgentConfig};
//! use rentbox_core::prelude::*;
//! use rentbox_sandbox::prelude::*;
//!
//! async fn lend<E: ContainerEngine>(engine: E) -> anyhow::Result<()> {
//!     let coordinator = Coordinator::new(engine, SandboxConfig::default())?;
//!     let config = AgentConfig {
//!         session_url: "https://sessions.example.com".into(),
//!         token: "lender-token".into(),
//!         ..Default::default()
//!     };
//!     Agent::new(config, coordinator)
//!         .run(async { tokio::signal::ctrl_c().await.ok(); })
//!         .await
//! }
//! ```

use rentbox_client::SessionClient;
use rentbox_core::prelude::*;
use rentbox_sandbox::coordinator::Coordinator;

use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub session_url: String,
    pub token: String,
    pub poll_interval: Duration,
    /// Jobs running at once. Polling pauses while this many are in flight.
    pub max_concurrent_jobs: usize,
    /// Remove leftovers of earlier runs before polling.
    pub sweep_on_start: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            session_url: "http://localhost:8080".to_string(),
            token: String::new(),
            poll_interval: Duration::from_secs(2),
            max_concurrent_jobs: 2,
            sweep_on_start: true,
        }
    }
}

/// Polls, executes, reports. One per lender host.
pub struct Agent<E: ContainerEngine, G: GpuProbe> {
    config: AgentConfig,
    session: SessionClient,
    coordinator: Coordinator<E, G>,
}

impl<E: ContainerEngine, G: GpuProbe> Agent<E, G> {
    pub fn new(config: AgentConfig, coordinator: Coordinator<E, G>) -> Self {
        let session = SessionClient::new(config.session_url.clone(), config.token.clone());
        Self {
            config,
            session,
            coordinator,
        }
    }

    /// Runs until `shutdown` resolves, then waits for in-flight jobs to finish and report.
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send) -> anyhow::Result<()> {
        if self.config.max_concurrent_jobs == 0 {
            anyhow::bail!("max_concurrent_jobs must be greater than zero");
        }

        if self.config.sweep_on_start {
            match self.coordinator.sweep(false).await {
                Ok(report) => debug!(?report, "startup sweep done"),
                Err(e) => warn!("startup sweep failed: {e}"),
            }
        }

        info!(
            session = %self.config.session_url,
            interval_ms = self.config.poll_interval.as_millis() as u64,
            max_concurrent_jobs = self.config.max_concurrent_jobs,
            "agent started"
        );

        let mut jobs = JoinSet::new();
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(joined) = jobs.join_next(), if !jobs.is_empty() => log_join(joined),
                _ = ticker.tick() => tokio::select! {
                    // A slow session service must not hold up shutdown.
                    _ = &mut shutdown => break,
                    _ = self.poll(&mut jobs) => {}
                },
            }
        }

        info!(in_flight = jobs.len(), "agent stopping");
        while let Some(joined) = jobs.join_next().await {
            log_join(joined);
        }
        Ok(())
    }

    /// Takes jobs until the queue is empty or capacity is reached.
    async fn poll(&self, jobs: &mut JoinSet<()>) {
        while jobs.len() < self.config.max_concurrent_jobs {
            match self.session.next_job().await {
                Ok(Some(job)) => {
                    info!(job_id = %job.job_id, language = %job.language, "picked up job");
                    let coordinator = self.coordinator.clone();
                    let session = self.session.clone();
                    jobs.spawn(async move {
                        let job_id = job.job_id.clone();
                        let result = coordinator.execute(job.into()).await;
                        if let Err(e) = session.report(&job_id, &result).await {
                            warn!(job_id = %job_id, "failed to report result: {e}");
                        }
                    });
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("poll failed: {e}");
                    break;
                }
            }
        }
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!("job task failed: {e}");
    }
}
