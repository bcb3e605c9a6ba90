//! Delay scheduling and the deferred task queue.
//!
//! The scheduler turns a fire time into a delay and hands the task to a
//! [`TaskQueue`]. It returns as soon as the queue accepts the task; the
//! worker pool picks it up when it becomes due.

pub mod clock;
pub mod queue;
pub mod redis_queue;
pub mod retry;
pub mod task;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info};

use crate::error::SchedulingError;
use crate::intake::UserPayload;

pub use clock::{Clock, FixedClock, SystemClock};
pub use queue::{DeadLetter, InMemoryTaskQueue, TaskQueue};
pub use redis_queue::RedisTaskQueue;
pub use retry::RetryPolicy;
pub use task::{DeferredTask, ScheduledDispatch, SEND_NOTIFICATION_TASK};

/// What the queue accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulingResult {
    pub task_id: String,
    pub fire_at: DateTime<Utc>,
    /// Delay submitted to the queue; zero when `fire_at` already passed.
    pub delay: Duration,
}

/// Defers notification tasks until their fire time.
#[derive(Clone)]
pub struct DelayScheduler {
    queue: Arc<dyn TaskQueue>,
    clock: Arc<dyn Clock>,
}

impl DelayScheduler {
    pub fn new(queue: Arc<dyn TaskQueue>, clock: Arc<dyn Clock>) -> Self {
        Self { queue, clock }
    }

    /// Submit a task that fires at `fire_at`, or immediately if that is past.
    pub async fn schedule(
        &self,
        event_id: &str,
        fire_payload: UserPayload,
        fire_at: DateTime<Utc>,
    ) -> Result<SchedulingResult, SchedulingError> {
        let now = self.clock.now();
        let delay = delay_until(now, fire_at);

        let task = DeferredTask::new(ScheduledDispatch {
            event_id: event_id.to_string(),
            fire_payload,
            fire_at,
        });

        if let Err(e) = self.queue.enqueue(&task, now, delay).await {
            error!(
                event_id = %event_id,
                error = %e,
                "notification_schedule_failed"
            );
            return Err(SchedulingError {
                event_id: event_id.to_string(),
                source: e,
            });
        }

        info!(
            event_id = %event_id,
            task_id = %task.id,
            task = %task.name,
            fire_at = %fire_at.to_rfc3339(),
            delay_ms = delay.as_millis() as u64,
            "notification_task_enqueued"
        );

        Ok(SchedulingResult {
            task_id: task.id,
            fire_at,
            delay,
        })
    }
}

/// `max(0, fire_at - now)`.
pub fn delay_until(now: DateTime<Utc>, fire_at: DateTime<Utc>) -> Duration {
    (fire_at - now).to_std().unwrap_or(Duration::ZERO)
}
