//! RabbitMQ consumer for user events using lapin.
//!
//! Connects to RabbitMQ, binds the service queue to the `user.created`
//! routing key and spawns a task per message.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use super::types::{USER_CREATED_QUEUE, USER_CREATED_ROUTING_KEY, USER_EXCHANGE};
use super::{handle_message, Disposition};
use crate::orchestrator::NotificationScheduler;
use crate::util::shutdown_signal;

/// Run the intake consumer until SIGINT/SIGTERM or the broker closes the stream.
///
/// This function:
/// 1. Connects to RabbitMQ
/// 2. Declares the topic exchange and the durable service queue, and binds them
/// 3. Sets QoS so at most `prefetch` events are in flight
/// 4. Consumes messages, acking, rejecting or requeueing each one
/// 5. On shutdown, settles every in-flight message before closing the channel
pub async fn run(rabbitmq_uri: &str, prefetch: u16, scheduler: NotificationScheduler) -> Result<()> {
    let scheduler = Arc::new(scheduler);

    // Connect to RabbitMQ
    info!(url_length = rabbitmq_uri.len(), "rabbitmq_connecting");

    let conn = Connection::connect(rabbitmq_uri, ConnectionProperties::default())
        .await
        .context("Failed to connect to RabbitMQ")?;

    info!("rabbitmq_connected");

    // Create a channel
    let channel = conn.create_channel().await.context("Failed to create channel")?;

    info!("rabbitmq_channel_created");

    // Set QoS so unacked deliveries never exceed the prefetch window
    channel
        .basic_qos(prefetch, BasicQosOptions::default())
        .await
        .context("Failed to set QoS")?;

    info!(prefetch_count = prefetch, "rabbitmq_qos_set");

    // Declare exchange, queue and binding (idempotent)
    declare_topology(&channel).await?;

    // Start consuming
    let mut consumer = channel
        .basic_consume(
            USER_CREATED_QUEUE,
            "notifier-intake",
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .context("Failed to start consumer")?;

    info!(queue = USER_CREATED_QUEUE, "rabbitmq_consumer_started");
    info!("intake_ready");

    let channel = Arc::new(channel);
    let mut in_flight = JoinSet::new();

    // Set up graceful shutdown
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    // Process messages until shutdown
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("intake_stopping");
                break;
            }
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "intake_task_panicked");
                }
            }
            delivery = consumer.next() => {
                match delivery {
                    Some(Ok(delivery)) => {
                        let delivery_tag = delivery.delivery_tag;
                        let message_id = delivery
                            .properties
                            .message_id()
                            .as_ref()
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| "unknown".to_string());

                        info!(
                            queue = USER_CREATED_QUEUE,
                            message_id = %message_id,
                            delivery_tag = delivery_tag,
                            redelivered = delivery.redelivered,
                            body_length = delivery.data.len(),
                            "intake_event_received"
                        );

                        // Spawn a task to schedule and settle this message
                        let scheduler = Arc::clone(&scheduler);
                        let channel = Arc::clone(&channel);

                        in_flight.spawn(async move {
                            let disposition =
                                handle_message(&scheduler, &delivery.data, &message_id).await;
                            settle(&channel, delivery_tag, disposition, &message_id).await;
                        });
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "rabbitmq_delivery_error");
                    }
                    None => {
                        warn!("rabbitmq_consumer_closed");
                        break;
                    }
                }
            }
        }
    }

    // Let in-flight messages settle while the channel is still open
    let drained = drain(&mut in_flight).await;
    info!(settled = drained, "intake_in_flight_drained");

    // Close channel and connection
    if let Err(e) = channel.close(200, "Normal shutdown").await {
        warn!(error = %e, "rabbitmq_channel_close_error");
    }
    if let Err(e) = conn.close(200, "Normal shutdown").await {
        warn!(error = %e, "rabbitmq_connection_close_error");
    }

    info!("intake_shutdown_complete");
    Ok(())
}

/// Wait for every spawned message task; returns how many finished.
async fn drain(in_flight: &mut JoinSet<()>) -> usize {
    let mut finished = 0;
    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "intake_task_panicked");
        }
        finished += 1;
    }
    finished
}

/// Declare the exchange, the durable queue and the binding (all idempotent).
async fn declare_topology(channel: &Channel) -> Result<()> {
    // Topic exchange owned by the user service (durable to match the publisher)
    channel
        .exchange_declare(
            USER_EXCHANGE,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .context("Failed to declare exchange")?;

    // Service queue survives broker restarts
    channel
        .queue_declare(
            USER_CREATED_QUEUE,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .context("Failed to declare queue")?;

    // Only account creation events
    channel
        .queue_bind(
            USER_CREATED_QUEUE,
            USER_EXCHANGE,
            USER_CREATED_ROUTING_KEY,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .context("Failed to bind queue")?;

    info!(
        exchange = USER_EXCHANGE,
        queue = USER_CREATED_QUEUE,
        routing_key = USER_CREATED_ROUTING_KEY,
        "rabbitmq_topology_declared"
    );

    Ok(())
}

/// Ack, reject or requeue a delivery.
async fn settle(channel: &Channel, delivery_tag: u64, disposition: Disposition, message_id: &str) {
    let result = match disposition {
        Disposition::Ack => {
            channel
                .basic_ack(delivery_tag, BasicAckOptions::default())
                .await
        }
        Disposition::Reject | Disposition::Requeue => {
            channel
                .basic_nack(
                    delivery_tag,
                    BasicNackOptions {
                        requeue: disposition == Disposition::Requeue,
                        ..Default::default()
                    },
                )
                .await
        }
    };

    match result {
        Ok(()) => info!(
            message_id = %message_id,
            disposition = ?disposition,
            "intake_event_settled"
        ),
        Err(e) => error!(
            delivery_tag = delivery_tag,
            disposition = ?disposition,
            error = %e,
            "rabbitmq_settle_failed"
        ),
    }
}
