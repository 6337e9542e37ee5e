//! Leadflow Worker - resumable lead import, resync and export jobs
//!
//! `serve` connects to NATS and answers job control requests; the other
//! subcommands run a single operation against the database and exit.

mod cli;
mod config;
mod db;
mod error;
mod handlers;
mod services;
mod types;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use sqlx::PgPool;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use crate::cli::{Cli, Command};
use crate::config::Config;
use crate::services::control::ControlRegistry;
use crate::services::controller::EngineContext;
use crate::services::crm::CrmClient;
use crate::services::job_store::{PgJobStore, PgMappingRepository};
use crate::services::notifier::{BroadcastNotifier, JobNotifier, NatsNotifier};
use crate::services::source::DefaultSourceProvider;
use crate::services::supervisor::JobSupervisor;
use crate::services::writer::DefaultDestinationProvider;
use crate::types::{
    CreateJobRequest, JobKind, JobStatus, JobStatusUpdate, MappingRule, MappingSet,
    MappingSetRef, SourceLocator, TargetDescriptor,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    let _guard = init_logging(&config.logs_dir);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Migrate => {
            let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
            db::run_migrations(&pool).await
        }
        Command::Import {
            file,
            table,
            mapping,
            key,
            compare_timestamp,
            batch_size,
            delimiter,
            dry_run,
        } => {
            // Files named on the command line belong to the operator
            config.keep_uploads = true;

            let mut target = TargetDescriptor::table(table);
            if let Some(key) = key {
                target = target.upsert_on(key);
            }
            if let Some(field) = compare_timestamp {
                target = target.skip_older_by(field);
            }
            let request = CreateJobRequest {
                kind: JobKind::CsvImport,
                source: SourceLocator::File {
                    path: file.to_string_lossy().into_owned(),
                    delimiter,
                },
                target,
                mapping_set: MappingSetRef::Name(mapping),
                batch_size,
                dry_run,
            };
            run_in_foreground(&config, Foreground::Create(request)).await
        }
        Command::Resume { job_id } => {
            config.keep_uploads = true;
            run_in_foreground(&config, Foreground::Resume(job_id)).await
        }
        Command::Status { job_id } => {
            let (supervisor, _) = local_supervisor(&config).await?;
            let job = supervisor.status(job_id).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
            Ok(())
        }
        Command::History { limit } => {
            let (supervisor, _) = local_supervisor(&config).await?;
            for job in supervisor.history(limit).await? {
                println!(
                    "{}  {:<12} {:<22} {:>8}/{:<8} ok={} failed={} skipped={}  {}",
                    job.id,
                    job.kind.as_str(),
                    job.status.as_str(),
                    job.processed,
                    job.total_records.map_or_else(|| "?".to_string(), |t| t.to_string()),
                    job.succeeded,
                    job.failed,
                    job.skipped,
                    job.created_at.to_rfc3339(),
                );
            }
            Ok(())
        }
        Command::Recover => {
            let (supervisor, _) = local_supervisor(&config).await?;
            let paused = supervisor.recover_orphans().await?;
            info!("Paused {} orphaned job(s)", paused.len());
            Ok(())
        }
        Command::MappingAdd { name, rules } => {
            let raw = std::fs::read_to_string(&rules)
                .with_context(|| format!("cannot read {}", rules.display()))?;
            let rules: Vec<MappingRule> =
                serde_json::from_str(&raw).context("rules file must be a JSON array of mapping rules")?;
            MappingSet::new(name.as_str(), rules.clone())
                .validate()
                .map_err(anyhow::Error::msg)?;

            let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
            let set = db::queries::mapping::create_mapping_version(&pool, &name, rules).await?;
            info!("Stored mapping set {} v{} ({})", set.name, set.version, set.id);
            println!("{}", set.id);
            Ok(())
        }
    }
}

/// Stdout plus a daily-rotating file in `logs_dir`
fn init_logging(logs_dir: &str) -> WorkerGuard {
    std::fs::create_dir_all(logs_dir).ok();

    let file_appender = RollingFileAppender::new(Rotation::DAILY, logs_dir, "worker.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,leadflow_worker=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    guard
}

fn build_context(
    config: &Config,
    pool: PgPool,
    notifier: Arc<dyn JobNotifier>,
) -> Result<EngineContext> {
    let crm = match &config.crm_base_url {
        Some(url) => Some(Arc::new(CrmClient::new(url, config.crm_api_token.clone())?)),
        None => {
            info!("CRM_BASE_URL not set, CRM sources and targets are disabled");
            None
        }
    };

    Ok(EngineContext {
        store: Arc::new(PgJobStore::new(pool.clone())),
        mappings: Arc::new(PgMappingRepository::new(pool.clone())),
        sources: Arc::new(DefaultSourceProvider::new(
            pool.clone(),
            crm.clone(),
            config.upload_dir.clone(),
            config.max_upload_bytes,
            config.keep_uploads,
        )),
        destinations: Arc::new(DefaultDestinationProvider::new(pool, crm)),
        notifier,
        control: ControlRegistry::default(),
        settings: config.engine_settings(),
    })
}

async fn connect_nats(config: &Config) -> Result<async_nats::Client> {
    let client = match config.nats_credentials() {
        Some((user, password)) => {
            async_nats::ConnectOptions::new()
                .user_and_password(user, password)
                .connect(&config.nats_url)
                .await?
        }
        None => async_nats::connect(&config.nats_url).await?,
    };
    Ok(client)
}

async fn serve(config: Config) -> Result<()> {
    info!("Starting Leadflow Worker...");

    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    info!("Connected to PostgreSQL");
    db::run_migrations(&pool).await?;

    let nats_client = connect_nats(&config).await?;
    info!("Connected to NATS at {}", config.nats_url);

    let notifier = Arc::new(NatsNotifier::new(nats_client.clone()));
    let supervisor = Arc::new(JobSupervisor::new(build_context(&config, pool, notifier)?));

    match supervisor.recover_orphans().await {
        Ok(paused) if !paused.is_empty() => warn!("Paused {} orphaned job(s) at start-up", paused.len()),
        Ok(_) => {}
        Err(e) => error!("Orphan recovery failed: {}", e),
    }
    let sweeper = supervisor.spawn_stale_sweeper();

    let result = tokio::select! {
        result = handlers::start_handlers(nats_client.clone(), supervisor.clone(), &config) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            Ok(())
        }
    };

    let stopped = supervisor.shutdown().await;
    for job in &stopped {
        info!("Job {} left in {}", job.id, job.status);
    }
    let _ = sweeper.await;
    if let Err(e) = nats_client.flush().await {
        warn!("Failed to flush NATS before exit: {}", e);
    }

    if let Err(e) = &result {
        error!("Handler error: {}", e);
    }
    result
}

/// Supervisor wired to an in-process notifier, for one-shot commands
async fn local_supervisor(config: &Config) -> Result<(JobSupervisor, broadcast::Receiver<JobStatusUpdate>)> {
    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    let notifier = Arc::new(BroadcastNotifier::new(64));
    let updates = notifier.subscribe();
    let supervisor = JobSupervisor::new(build_context(config, pool, notifier)?);
    Ok((supervisor, updates))
}

enum Foreground {
    Create(CreateJobRequest),
    Resume(Uuid),
}

/// Run one job in this process, logging progress until it stops.
/// Ctrl-C pauses the job at its next chunk boundary.
async fn run_in_foreground(config: &Config, what: Foreground) -> Result<()> {
    let (supervisor, mut updates) = local_supervisor(config).await?;

    let job = match what {
        Foreground::Create(request) => supervisor.create(request).await?,
        Foreground::Resume(id) => supervisor.resume(id).await?,
    };
    let job_id = job.id;
    info!("Running {} job {}", job.kind.as_str(), job_id);

    let progress = tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(update) if update.job_id == job_id => {
                    let job = update.job;
                    let percent = job
                        .progress_percent()
                        .map_or_else(|| "?".to_string(), |p| format!("{}%", p));
                    info!(
                        "{}: {} {} processed={} succeeded={} failed={} skipped={}",
                        job_id,
                        job.status,
                        percent,
                        job.processed,
                        job.succeeded,
                        job.failed,
                        job.skipped
                    );
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    });

    let control = supervisor.context().control.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, pausing job {}", job_id);
            control.shutdown();
        }
    });

    let finished = supervisor.join(job_id).await;
    interrupt.abort();
    progress.abort();

    let Some(job) = finished else {
        bail!("job {} did not finish cleanly", job_id);
    };
    println!("{}", serde_json::to_string_pretty(&job)?);

    match job.status {
        JobStatus::Failed => bail!(
            "job {} failed: {}",
            job.id,
            job.error_message.as_deref().unwrap_or("unknown error")
        ),
        JobStatus::Paused => {
            info!("Job {} paused; continue with `leadflow-worker resume {}`", job.id, job.id);
            Ok(())
        }
        _ => Ok(()),
    }
}
