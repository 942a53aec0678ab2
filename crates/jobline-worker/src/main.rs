//! jobline-worker: consumes jobs from the priority channel and exposes
//! operator commands over the job store.

mod cli;
mod config;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use jobline_core::{CreateJobRequest, JobStore, PriorityChannel, UpdateJobStatusRequest};
use jobline_db::Database;
use jobline_inference::OpenAIBackend;
use jobline_jobs::{
    CompletionConfig, CompletionHandler, ConsumerConfig, ConsumerHandle, Dispatcher, JobConsumer,
};
use jobline_queue::{ChannelConfig, PgChannel};

use crate::cli::{Cli, Command};
use crate::config::AppConfig;

#[tokio::main]
async fn main() -> ExitCode {
    // Load environment variables
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let _log_guard = init_tracing();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<jobline_core::Error>() {
                Some(err) => eprintln!("Error [{}]: {:#}", err.kind().code(), e),
                None => eprintln!("Error: {:#}", e),
            }
            ExitCode::FAILURE
        }
    }
}

/// Initialize tracing with configurable output.
///
/// Environment variables:
///   LOG_FORMAT  - "json" or "text" (default: "text")
///   LOG_FILE    - path to log file (optional, enables file logging)
///   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
///   RUST_LOG    - standard env filter
///
/// Console logs go to stderr so command output on stdout stays parseable.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "jobline_worker=info,jobline_jobs=info,jobline_queue=info".into());

    let registry = tracing_subscriber::registry().with(env_filter);

    let guard = if let Some(ref path) = log_file {
        let file_dir = std::path::Path::new(path)
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(std::path::Path::new("."));
        let file_name = std::path::Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("jobline-worker.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            // No ANSI in files unless asked for.
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        // Console-only output
        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(std::io::stderr),
                )
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stderr)"),
        "Logging initialized"
    );

    guard
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = AppConfig::from_env();

    info!("Connecting to database...");
    let db = Database::connect_with_config(&config.database_url, config.pool_config())
        .await
        .context("failed to connect to database")?
        .with_lock_timeout(config.transaction_timeout);

    info!("Running database migrations...");
    db.migrate().await.context("failed to run migrations")?;

    let channel = Arc::new(PgChannel::new(db.pool.clone(), ChannelConfig::from_env()));
    let store: Arc<dyn JobStore> = db.jobs.clone();
    let dispatcher = Dispatcher::new(store.clone(), channel.clone());

    let outcome = execute(
        cli.command.unwrap_or(Command::Run),
        &config,
        store,
        channel,
        dispatcher,
    )
    .await;

    db.close().await;
    outcome
}

async fn execute(
    command: Command,
    config: &AppConfig,
    store: Arc<dyn JobStore>,
    channel: Arc<PgChannel>,
    dispatcher: Dispatcher,
) -> anyhow::Result<()> {
    match command {
        Command::Run => run_worker(config, store, channel, dispatcher).await,
        Command::Enqueue {
            owner,
            input,
            priority,
        } => {
            let input = serde_json::from_str(&input).context("--input must be valid JSON")?;
            let job = dispatcher
                .create_job(CreateJobRequest::new(owner, input, priority))
                .await?;
            print_json(&job)
        }
        Command::Get { id } => print_json(&store.get(id).await?),
        Command::List { owner } => print_json(&store.list_for_owner(&owner).await?),
        Command::Next => print_json(&store.next_queued().await?),
        Command::SetStatus {
            id,
            status,
            result,
            error,
        } => {
            let result = result
                .map(|r| serde_json::from_str(&r))
                .transpose()
                .context("--result must be valid JSON")?;
            let job = store
                .apply_status_request(
                    id,
                    UpdateJobStatusRequest {
                        status,
                        result,
                        error_message: error,
                    },
                )
                .await?;
            print_json(&job)
        }
        Command::Reconcile { stale_after_secs } => {
            let stale_after = stale_after_secs
                .map(Duration::from_secs)
                .unwrap_or(config.stale_after);
            let report = dispatcher.reconcile_stale(stale_after).await?;
            println!(
                "scanned={} republished={} failed={}",
                report.scanned, report.republished, report.failed
            );
            Ok(())
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Consume jobs until a shutdown signal arrives or the consumer stops.
async fn run_worker(
    config: &AppConfig,
    store: Arc<dyn JobStore>,
    channel: Arc<PgChannel>,
    dispatcher: Dispatcher,
) -> anyhow::Result<()> {
    let backend = OpenAIBackend::from_env().context("failed to configure LLM backend")?;
    if backend.health_check().await {
        info!(base_url = %backend.config().base_url, "LLM service reachable");
    } else {
        // Jobs submitted now will fail after retries, but the worker keeps
        // consuming so it recovers when the service does.
        warn!(base_url = %backend.config().base_url, "LLM service health check failed");
    }

    let handler =
        CompletionHandler::new(Arc::new(backend)).with_config(CompletionConfig::from_env());
    let consumer = JobConsumer::new(
        store,
        channel.clone(),
        Arc::new(handler),
        ConsumerConfig::from_env(),
    );
    let handle = consumer.start();

    let reconciler = if config.reconcile_interval.is_zero() {
        info!("Stale-job reconciliation disabled");
        None
    } else {
        Some(spawn_reconciler(
            dispatcher,
            config.reconcile_interval,
            config.stale_after,
        ))
    };

    tokio::select! {
        _ = shutdown_signal() => info!("Shutdown signal received"),
        _ = consumer_exited(&handle) => warn!("Job consumer exited; shutting down"),
    }

    if let Some((stop_tx, join)) = reconciler {
        let _ = stop_tx.send(()).await;
        if let Err(e) = join.await {
            error!(error = ?e, "Reconciler task failed");
        }
    }

    // Waits for the in-flight delivery to be acknowledged or returned.
    let consumer_result = handle.shutdown().await;

    if let Err(e) = channel.close().await {
        warn!(error = %e, "Failed to close channel");
    }

    consumer_result?;
    info!("Worker stopped");
    Ok(())
}

/// Periodically republish orphaned QUEUED jobs.
fn spawn_reconciler(
    dispatcher: Dispatcher,
    every: Duration,
    stale_after: Duration,
) -> (mpsc::Sender<()>, JoinHandle<()>) {
    let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);

    let join = tokio::spawn(async move {
        info!(
            interval_secs = every.as_secs(),
            stale_after_secs = stale_after.as_secs(),
            "Stale-job reconciler started"
        );
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop_rx.recv() => break,
                _ = ticker.tick() => {
                    if let Err(e) = dispatcher.reconcile_stale(stale_after).await {
                        warn!(error = %e, "Stale-job sweep failed");
                    }
                }
            }
        }
        info!("Stale-job reconciler stopped");
    });

    (stop_tx, join)
}

async fn consumer_exited(handle: &ConsumerHandle) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    while !handle.is_finished() {
        ticker.tick().await;
    }
}

/// Resolve on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
