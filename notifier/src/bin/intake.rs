//! Notifier Intake - consumes `user.created` events and schedules notifications.
//!
//! The intake only schedules; it never calls the webhook. A message is acked
//! once its task is stored in the queue.

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use notifier::intake::consumer;
use notifier::runtime::connect_intake;
use notifier::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("intake_starting");

    let config = Config::from_env().context("Invalid configuration")?;
    info!(
        rabbitmq_uri_set = !config.rabbitmq_uri.is_empty(),
        notification_delay_secs = config.notification_delay_secs,
        queue_prefix = %config.queue_prefix,
        "config_loaded"
    );

    // Only Redis is needed here; Postgres and the webhook belong to the worker
    let scheduler = connect_intake(&config).await?;

    let prefetch = u16::try_from(config.worker_concurrency).unwrap_or(u16::MAX);
    consumer::run(&config.rabbitmq_uri, prefetch, scheduler).await?;

    Ok(())
}
