//! `rentbox`: run untrusted code in a locked-down Docker container, serve the sandbox
//! over HTTP or lend this machine to a session service.

use rentbox_agent::{Agent, AgentConfig};
use rentbox_core::constants::limits::{MIB, NANO_CPUS_PER_CORE};
use rentbox_core::prelude::*;
use rentbox_docker::DockerEngine;
use rentbox_sandbox::prelude::*;
use rentbox_server::prelude::*;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rentbox", version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    sandbox: SandboxArgs,

    /// Report GPU utilization read from nvidia-smi
    #[arg(long, global = true, env = "RENTBOX_GPU")]
    gpu: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct SandboxArgs {
    /// Memory limit per container in MiB
    #[arg(long, global = true, env = "RENTBOX_MEMORY_MB")]
    memory_mb: Option<u64>,

    /// CPU share per container in cores, e.g. 0.5
    #[arg(long, global = true, env = "RENTBOX_CPUS")]
    cpus: Option<f64>,

    /// Timeout for jobs that do not ask for one
    #[arg(long, global = true, env = "RENTBOX_TIMEOUT_MS")]
    default_timeout_ms: Option<u64>,

    /// Upper bound for requested timeouts
    #[arg(long, global = true, env = "RENTBOX_MAX_TIMEOUT_MS")]
    max_timeout_ms: Option<u64>,

    /// Directory for build contexts
    #[arg(long, global = true, env = "RENTBOX_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Remove base images with dependencies once no running job uses them
    #[arg(long, global = true, env = "RENTBOX_DROP_BASE_IMAGES")]
    drop_base_images: bool,
}

impl SandboxArgs {
    fn config(&self) -> Result<SandboxConfig> {
        let mut config = SandboxConfig::default();
        if let Some(mb) = self.memory_mb {
            config.limits.memory_bytes = mb.saturating_mul(MIB);
        }
        if let Some(cpus) = self.cpus {
            config.limits.nano_cpus = (cpus * NANO_CPUS_PER_CORE as f64) as i64;
        }
        if let Some(ms) = self.default_timeout_ms {
            config.default_timeout_ms = ms;
        }
        if let Some(ms) = self.max_timeout_ms {
            config.max_timeout_ms = ms;
        }
        if let Some(dir) = &self.work_dir {
            config.work_dir = dir.clone();
        }
        config.keep_base_images = !self.drop_base_images;

        config.validate().context("invalid sandbox configuration")?;
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Command {
    /// Run a single source file in the sandbox
    Run {
        /// Source file to execute
        file: PathBuf,
        /// Language, inferred from the file extension when omitted
        #[arg(long, short)]
        language: Option<String>,
        /// Package to install before running (repeatable)
        #[arg(long = "dep", short = 'd', value_name = "PACKAGE")]
        dependencies: Vec<String>,
        /// Timeout for this run
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Serve the sandbox over HTTP
    Serve {
        #[arg(long, env = "HOST", default_value = "0.0.0.0")]
        host: String,
        #[arg(long, env = "PORT", default_value_t = 8080)]
        port: u16,
        /// Largest accepted request body in bytes
        #[arg(long, default_value_t = 1024 * 1024)]
        body_limit: usize,
    },
    /// Poll a session service for jobs and execute them
    Agent {
        #[arg(long, env = "RENTBOX_SESSION_URL")]
        session_url: String,
        #[arg(long, env = "RENTBOX_TOKEN", hide_env_values = true)]
        token: String,
        #[arg(long, env = "RENTBOX_POLL_INTERVAL_MS", default_value_t = 2_000)]
        poll_interval_ms: u64,
        #[arg(long, env = "RENTBOX_MAX_CONCURRENT_JOBS", default_value_t = 2)]
        max_concurrent_jobs: usize,
        /// Skip removing leftovers of earlier runs on startup
        #[arg(long)]
        no_sweep: bool,
    },
    /// Remove containers, images and build contexts left behind by earlier runs
    Sweep {
        /// Remove cached base images too
        #[arg(long)]
        include_base: bool,
    },
    /// Check the Docker connection and print the effective configuration
    Doctor,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.sandbox.config()?;
    let engine = DockerEngine::connect_local().context("failed to connect to Docker")?;

    if cli.gpu {
        dispatch(cli.command, engine, config, NvidiaSmiProbe::default()).await
    } else {
        dispatch(cli.command, engine, config, NoGpuProbe).await
    }
}

async fn dispatch<G: GpuProbe>(
    command: Command,
    engine: DockerEngine,
    config: SandboxConfig,
    gpu: G,
) -> Result<ExitCode> {
    let coordinator = Coordinator::with_gpu_probe(engine, config, gpu.clone())?;

    match command {
        Command::Run {
            file,
            language,
            dependencies,
            timeout_ms,
            json,
        } => {
            let source_code = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let language = match language {
                Some(language) => language,
                None => file
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .and_then(Language::from_extension)
                    .map(|l| l.as_str().to_string())
                    .context("cannot infer the language from the file name, pass --language")?,
            };

            let result = coordinator
                .execute(JobRequest {
                    language,
                    source_code,
                    dependencies,
                    timeout_ms,
                    ..Default::default()
                })
                .await;

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print!("{}", result.output);
                if !result.error.is_empty() {
                    eprintln!("error: {}", result.error);
                }
                let usage = &result.resource_usage;
                eprintln!(
                    "[{}] {} ms, cpu {:.1}%, memory {:.1} MiB, gpu {:.1}%",
                    result.status,
                    result.execution_time_ms,
                    usage.cpu_percent,
                    usage.memory_bytes as f64 / MIB as f64,
                    usage.gpu_utilization_percent,
                );
            }

            Ok(if result.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Serve {
            host,
            port,
            body_limit,
        } => {
            let app = RentboxServer::new(RentboxServerConfig { body_limit }).build(coordinator);
            let listener = tokio::net::TcpListener::bind((host.as_str(), port))
                .await
                .with_context(|| format!("failed to bind {host}:{port}"))?;
            info!("listening on http://{}", listener.local_addr()?);

            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Agent {
            session_url,
            token,
            poll_interval_ms,
            max_concurrent_jobs,
            no_sweep,
        } => {
            let config = AgentConfig {
                session_url,
                token,
                poll_interval: Duration::from_millis(poll_interval_ms),
                max_concurrent_jobs,
                sweep_on_start: !no_sweep,
            };
            Agent::new(config, coordinator).run(shutdown_signal()).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Sweep { include_base } => {
            let report = coordinator.sweep(include_base).await?;
            println!(
                "removed {} containers, {} images, {} build contexts",
                report.containers, report.images, report.temp_paths
            );
            for failure in &report.failures {
                eprintln!("{failure}");
            }
            Ok(if report.failures.is_empty() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Doctor => {
            let docker = coordinator.ping().await;
            match &docker {
                Ok(()) => println!("docker: ok"),
                Err(e) => println!("docker: {e}"),
            }
            match gpu.utilization().await {
                Some(percent) => println!("gpu: {percent:.1}% busy"),
                None => println!("gpu: not available"),
            }
            println!(
                "config: {}",
                serde_json::to_string_pretty(coordinator.config())?
            );
            Ok(if docker.is_ok() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutting down"),
        Err(e) => {
            warn!("cannot listen for ctrl-c: {e}");
            std::future::pending::<()>().await
        }
    }
}
