//! vacal-jobs - verbal-autopsy job service
//!
//! `vacal-jobs serve` runs the HTTP API. `vacal-jobs worker --job-id <id>` runs
//! one job to completion; the server launches one such process per job.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;
use vacal_common::config::{default_config_path, write_config_if_missing, TomlConfig, CONFIG_PATH_ENV};

use vacal_jobs::config::ServiceConfig;
use vacal_jobs::services::{run_job, JobLauncher, JobService, WorkerContext, WorkerOutcome};
use vacal_jobs::AppState;

/// Command-line arguments for vacal-jobs
#[derive(Parser, Debug)]
#[command(name = "vacal-jobs")]
#[command(about = "Verbal-autopsy classification and calibration job service")]
#[command(version)]
struct Args {
    /// Data folder (overrides VACAL_DATA_DIR and the config file)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API
    Serve {
        /// Listen address (defaults to `bind_address` from the config)
        #[arg(long)]
        bind: Option<String>,
    },
    /// Run a single job
    Worker {
        #[arg(long)]
        job_id: Uuid,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let toml = TomlConfig::load_or_default(args.config.as_deref())
        .context("Failed to load configuration")?;

    // Workers write to stderr, which the launcher captures per job
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&toml.logging.level)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = ServiceConfig::resolve_from(&toml, args.data_dir.as_deref(), args.config.as_deref())
        .context("Failed to initialize data folder")?;

    match args.command {
        Command::Serve { bind } => {
            if args.config.is_none() && std::env::var_os(CONFIG_PATH_ENV).is_none() {
                save_default_config(&toml);
            }
            serve(config, bind).await
        }
        Command::Worker { job_id } => worker(config, job_id).await,
    }
}

/// Leave an editable config at the platform location on first start
fn save_default_config(toml: &TomlConfig) {
    let Some(path) = default_config_path() else {
        return;
    };
    if let Err(e) = write_config_if_missing(toml, &path) {
        tracing::warn!(path = %path.display(), error = %e, "Failed to write default config");
    }
}

async fn serve(config: ServiceConfig, bind: Option<String>) -> Result<()> {
    info!("Starting vacal-jobs {}", env!("CARGO_PKG_VERSION"));
    info!("Database: {}", config.database_path.display());

    let pool = vacal_jobs::db::init_database_pool(&config.database_path).await?;
    let bind = bind.unwrap_or_else(|| config.bind_address.clone());
    let worker = WorkerContext::from_config(pool.clone(), Arc::new(config))
        .context("Failed to configure engines")?;

    let service = JobService::new(pool, JobLauncher::new(worker));
    let app = vacal_jobs::build_router(AppState::new(service));

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind to {}", bind))?;
    info!("Listening on http://{}", bind);
    info!("Health check: http://{}/health", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutdown complete");
    Ok(())
}

async fn worker(config: ServiceConfig, job_id: Uuid) -> Result<()> {
    info!(job_id = %job_id, pid = std::process::id(), "Worker starting");

    let pool = vacal_jobs::db::init_database_pool(&config.database_path).await?;
    let ctx = WorkerContext::from_config(pool, Arc::new(config))
        .context("Failed to configure engines")?;

    match run_job(&ctx, job_id).await? {
        WorkerOutcome::Completed => info!(job_id = %job_id, "Worker finished: completed"),
        WorkerOutcome::Failed(error) => info!(job_id = %job_id, error = %error, "Worker finished: failed"),
        WorkerOutcome::Skipped(status) => info!(job_id = %job_id, status = %status, "Worker finished: skipped"),
    }
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received terminate signal, shutting down"),
    }
}
