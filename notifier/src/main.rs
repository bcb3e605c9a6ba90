//! Notifier Worker - fires due notification tasks from the Redis queue.
//!
//! Each due task calls the webhook once and, on success, records the event as
//! sent in PostgreSQL. Failed tasks are retried with exponential backoff and
//! dead-lettered once their attempts run out.

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use notifier::runtime::Services;
use notifier::util::shutdown_signal;
use notifier::{Config, RetryPolicy, TaskWorker, WorkerSettings};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    tracing::info!("worker_starting");

    let config = Config::from_env().context("Invalid configuration")?;
    tracing::info!(
        webhook_url = %config.webhook_url,
        signing_enabled = config.webhook_signing_secret.is_some(),
        concurrency = config.worker_concurrency,
        max_attempts = config.max_attempts,
        poll_interval_ms = config.poll_interval_ms,
        lease_secs = config.task_lease_secs,
        queue_prefix = %config.queue_prefix,
        "config_loaded"
    );

    let services = Services::connect(&config).await?;

    let worker = TaskWorker::new(
        services.queue,
        services.orchestrator,
        services.clock,
        RetryPolicy::from_config(&config),
        WorkerSettings::from_config(&config),
    );

    worker.run_until(shutdown_signal()).await?;

    Ok(())
}
