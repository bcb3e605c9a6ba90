//! Wiring of the production collaborators from [`Config`].

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::Config;
use crate::dispatch::{WebhookConfig, WebhookDispatcher};
use crate::ledger::PostgresLedger;
use crate::orchestrator::{NotificationScheduler, Orchestrator};
use crate::scheduler::{Clock, DelayScheduler, RedisTaskQueue, SystemClock, TaskQueue};

/// Connect the Redis task queue.
pub async fn connect_queue(config: &Config) -> Result<Arc<dyn TaskQueue>> {
    let queue = RedisTaskQueue::connect(&config.redis_url, config.queue_prefix.clone())
        .await
        .context("Failed to connect to Redis")?;
    Ok(Arc::new(queue))
}

/// Everything the intake needs: the queue and the configured delay.
pub async fn connect_intake(config: &Config) -> Result<NotificationScheduler> {
    let queue = connect_queue(config).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    Ok(NotificationScheduler::new(
        DelayScheduler::new(queue, clock),
        config.notification_delay(),
    ))
}

/// Connected collaborators for the worker.
pub struct Services {
    pub queue: Arc<dyn TaskQueue>,
    pub clock: Arc<dyn Clock>,
    pub orchestrator: Orchestrator,
}

impl Services {
    /// Connect to Redis and Postgres and build the orchestrator.
    pub async fn connect(config: &Config) -> Result<Self> {
        let queue = connect_queue(config).await?;

        let ledger = PostgresLedger::connect(&config.pg_url, config.db_max_connections)
            .await
            .context("Failed to connect to PostgreSQL")?;

        let dispatcher = WebhookDispatcher::new(WebhookConfig::from_config(config))
            .context("Failed to build webhook client")?;
        info!(url = %dispatcher.url(), "webhook_client_created");

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let orchestrator = Orchestrator::new(
            DelayScheduler::new(Arc::clone(&queue), Arc::clone(&clock)),
            Arc::new(dispatcher),
            Arc::new(ledger),
            config.notification_delay(),
        )
        .with_precheck(config.ledger_precheck);

        Ok(Self {
            queue,
            clock,
            orchestrator,
        })
    }
}
