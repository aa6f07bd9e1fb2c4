//! CSV Import Worker - consumes import tasks from RabbitMQ priority queues
//! and bulk-loads company data into a normalized MySQL schema.

mod cache;
mod cli;
mod config;
mod db;
mod loader;
mod parser;
mod retry;
mod types;
mod worker;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    dotenvy::dotenv().ok();

    let config = config::Config::from_env()?;

    match cli.command {
        Some(cli::Command::Serve) | None => run(config).await,
    }
}

async fn run(config: config::Config) -> Result<()> {
    let logs_dir = std::env::var("LOGS_DIR").unwrap_or_else(|_| "logs".to_string());
    std::fs::create_dir_all(&logs_dir).ok();

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &logs_dir, "worker.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,csv_import_worker=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    info!("Starting CSV import worker...");

    let pool = db::create_pool(&config.database_url()).await?;
    info!("Connected to MySQL at {}:{}", config.db_host, config.db_port);

    info!("Starting workers for queues: {}", config.queues.join(", "));

    let shutdown = CancellationToken::new();
    let mut workers = JoinSet::new();
    for queue in &config.queues {
        let worker = worker::Worker::connect(&config, pool.clone(), queue)
            .await
            .with_context(|| format!("failed to create worker for queue {queue}"))?;
        let token = shutdown.clone();
        workers.spawn(async move { worker.run(token).await });
    }

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    // Wait for a shutdown signal or the first worker failure. A worker that
    // finishes cleanly (e.g. its queue is owned by another consumer) is not a
    // reason to stop the rest.
    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received interrupt, shutting down...");
                break Ok(());
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                break Ok(());
            }
            joined = workers.join_next() => match joined {
                None => break Ok(()),
                Some(Ok(Ok(()))) => continue,
                Some(Ok(Err(err))) => break Err(err.context("worker failed")),
                Some(Err(err)) => break Err(anyhow!(err).context("worker task panicked")),
            },
        }
    };

    shutdown.cancel();
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!("Worker failed during shutdown: {err:#}"),
            Err(err) => error!("Worker task panicked during shutdown: {err}"),
        }
    }

    match outcome {
        Ok(()) => {
            info!("All workers stopped");
            Ok(())
        }
        Err(err) => {
            error!("{err:#}");
            Err(err)
        }
    }
}
