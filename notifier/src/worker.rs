//! Deferred task worker pool.
//!
//! Polls the queue for due tasks, runs each through
//! [`Orchestrator::on_fire`] on its own tokio task (bounded by a semaphore)
//! and settles it: complete, retry with backoff, or dead-letter.
//!
//! A worker that dies mid-task leaves the task in the active set; once its
//! lease expires any worker moves it back to the delayed set.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Semaphore;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::orchestrator::{FireOutcome, Orchestrator};
use crate::scheduler::{Clock, DeferredTask, RetryPolicy, TaskQueue};

/// Pool sizing and timing.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub lease: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            concurrency: config.worker_concurrency.max(1),
            poll_interval: config.poll_interval(),
            lease: config.task_lease(),
        }
    }
}

/// How a fired task was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskResult {
    Completed(FireOutcome),
    Retrying { attempts: u32, delay: Duration },
    DeadLettered { attempts: u32, reason: String },
}

/// Runs due notification tasks.
#[derive(Clone)]
pub struct TaskWorker {
    queue: Arc<dyn TaskQueue>,
    orchestrator: Arc<Orchestrator>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    settings: WorkerSettings,
}

impl TaskWorker {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        orchestrator: Orchestrator,
        clock: Arc<dyn Clock>,
        policy: RetryPolicy,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            queue,
            orchestrator: Arc::new(orchestrator),
            clock,
            policy,
            settings,
        }
    }

    /// Fire one claimed task and settle it in the queue.
    pub async fn process(&self, task: DeferredTask) -> TaskResult {
        info!(
            task_id = %task.id,
            event_id = %task.event_id(),
            attempt = task.attempts + 1,
            fire_at = %task.dispatch.fire_at.to_rfc3339(),
            "worker_task_started"
        );

        let result = match self
            .orchestrator
            .on_fire(task.event_id(), &task.dispatch.fire_payload)
            .await
        {
            Ok(outcome) => {
                if let Err(e) = self.queue.complete(&task).await {
                    // The lease will expire and the re-fire is absorbed by the ledger.
                    error!(task_id = %task.id, error = %e, "worker_task_complete_failed");
                }
                TaskResult::Completed(outcome)
            }
            Err(e) => {
                let failed = task.failed_attempt(e.to_string());

                if e.is_retryable() && self.policy.should_retry(failed.attempts) {
                    let delay = self.policy.next_delay(failed.attempts);
                    if let Err(qe) = self.queue.retry(&failed, self.clock.now(), delay).await {
                        error!(task_id = %task.id, error = %qe, "worker_task_retry_failed");
                    }
                    TaskResult::Retrying {
                        attempts: failed.attempts,
                        delay,
                    }
                } else {
                    let reason = if e.is_retryable() {
                        format!("attempts exhausted after {}: {}", failed.attempts, e)
                    } else {
                        format!("non-retryable failure: {}", e)
                    };
                    let now = self.clock.now();
                    if let Err(qe) = self.queue.dead_letter(&failed, &reason, now).await {
                        error!(task_id = %task.id, error = %qe, "worker_task_dead_letter_failed");
                    }
                    TaskResult::DeadLettered {
                        attempts: failed.attempts,
                        reason,
                    }
                }
            }
        };

        match &result {
            TaskResult::Completed(outcome) => info!(
                task_id = %task.id,
                event_id = %task.event_id(),
                outcome = ?outcome,
                "worker_task_completed"
            ),
            TaskResult::Retrying { attempts, delay } => warn!(
                task_id = %task.id,
                event_id = %task.event_id(),
                attempts = *attempts,
                retry_in_ms = delay.as_millis() as u64,
                "worker_task_retry_scheduled"
            ),
            TaskResult::DeadLettered { attempts, reason } => error!(
                task_id = %task.id,
                event_id = %task.event_id(),
                user_id = %task.dispatch.fire_payload.id,
                attempts = *attempts,
                reason = %reason,
                "worker_task_dead_lettered"
            ),
        }

        result
    }

    /// Claim every task due now (up to the pool size) and run them to completion.
    pub async fn run_once(&self) -> Result<Vec<TaskResult>> {
        let now = self.clock.now();
        self.queue
            .requeue_expired(now)
            .await
            .context("Failed to requeue expired tasks")?;

        let tasks = self
            .queue
            .claim_due(now, self.settings.concurrency, self.settings.lease)
            .await
            .context("Failed to claim due tasks")?;

        let runs = tasks.into_iter().map(|task| self.process(task));
        Ok(futures::future::join_all(runs).await)
    }

    /// Poll until `shutdown` resolves, then wait for in-flight tasks.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let permits = Arc::new(Semaphore::new(self.settings.concurrency));
        let mut ticker = interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::pin!(shutdown);

        info!(
            concurrency = self.settings.concurrency,
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            lease_secs = self.settings.lease.as_secs(),
            "worker_ready"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("worker_stopping");
                    break;
                }
                _ = ticker.tick() => {
                    self.poll(&permits).await;
                }
            }
        }

        // Every permit back means every spawned task finished.
        let total = self.settings.concurrency as u32;
        let _drained = permits
            .acquire_many(total)
            .await
            .context("Worker semaphore closed")?;

        info!("worker_shutdown_complete");
        Ok(())
    }

    async fn poll(&self, permits: &Arc<Semaphore>) {
        let now = self.clock.now();

        match self.queue.requeue_expired(now).await {
            Ok(0) => {}
            Ok(n) => warn!(count = n, "worker_stalled_tasks_requeued"),
            Err(e) => error!(error = %e, "worker_requeue_expired_failed"),
        }

        let available = permits.available_permits();
        if available == 0 {
            return;
        }

        let tasks = match self.queue.claim_due(now, available, self.settings.lease).await {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(error = %e, "worker_claim_failed");
                return;
            }
        };

        for task in tasks {
            let permit = match Arc::clone(permits).acquire_owned().await {
                Ok(p) => p,
                Err(_) => return,
            };
            let worker = self.clone();
            tokio::spawn(async move {
                worker.process(task).await;
                drop(permit);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    use super::*;
    use crate::dispatch::{DispatchOutcome, NotificationDispatcher, ResponseSummary};
    use crate::intake::{NotificationEvent, UserId, UserPayload};
    use crate::ledger::{DeliveryLedger, InMemoryLedger};
    use crate::scheduler::{DelayScheduler, FixedClock, InMemoryTaskQueue};

    /// Returns the same outcome on every call.
    struct FixedDispatcher {
        outcome: DispatchOutcome,
        calls: AtomicUsize,
    }

    impl FixedDispatcher {
        fn new(outcome: DispatchOutcome) -> Self {
            Self {
                outcome,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl NotificationDispatcher for FixedDispatcher {
        async fn dispatch(&self, _event: &NotificationEvent) -> DispatchOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome.clone()
        }
    }

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn event(event_id: &str) -> NotificationEvent {
        NotificationEvent {
            event_id: event_id.to_string(),
            user: UserPayload {
                id: UserId::from("u1"),
                first_name: "Ann".to_string(),
                created_at: at("2024-01-01T00:00:00Z").into(),
                extra: Default::default(),
            },
        }
    }

    struct Harness {
        worker: TaskWorker,
        orchestrator: Orchestrator,
        queue: Arc<InMemoryTaskQueue>,
        ledger: Arc<InMemoryLedger>,
        clock: Arc<FixedClock>,
        dispatcher: Arc<FixedDispatcher>,
    }

    fn harness(outcome: DispatchOutcome, max_attempts: u32) -> Harness {
        let queue = Arc::new(InMemoryTaskQueue::new());
        let clock = Arc::new(FixedClock::new(at("2024-01-01T00:00:00Z")));
        let ledger = Arc::new(InMemoryLedger::new());
        let dispatcher = Arc::new(FixedDispatcher::new(outcome));
        let orchestrator = Orchestrator::new(
            DelayScheduler::new(queue.clone(), clock.clone()),
            dispatcher.clone(),
            ledger.clone(),
            Duration::from_secs(60),
        );
        let policy = RetryPolicy {
            max_attempts,
            base_delay: Duration::from_secs(2),
            jitter: 0.0,
            ..RetryPolicy::default()
        };
        let settings = WorkerSettings {
            concurrency: 4,
            poll_interval: Duration::from_millis(10),
            lease: Duration::from_secs(30),
        };
        let worker = TaskWorker::new(
            queue.clone(),
            orchestrator.clone(),
            clock.clone(),
            policy,
            settings,
        );
        Harness {
            worker,
            orchestrator,
            queue,
            ledger,
            clock,
            dispatcher,
        }
    }

    fn delivered() -> DispatchOutcome {
        DispatchOutcome::Delivered(ResponseSummary {
            status: 200,
            body: "ok".to_string(),
        })
    }

    #[tokio::test]
    async fn test_task_not_fired_before_due() {
        let h = harness(delivered(), 5);
        h.orchestrator.on_event_received(event("e1")).await.unwrap();

        assert!(h.worker.run_once().await.unwrap().is_empty());
        assert_eq!(h.dispatcher.calls.load(Ordering::SeqCst), 0);

        h.clock.set(at("2024-01-01T00:01:00Z"));
        let results = h.worker.run_once().await.unwrap();
        assert_eq!(results, vec![TaskResult::Completed(FireOutcome::Sent)]);
        assert!(h.ledger.is_sent("e1").await.unwrap());
        assert!(h.queue.is_drained().await);
    }

    #[tokio::test]
    async fn test_retryable_failure_backs_off_then_dead_letters() {
        let h = harness(
            DispatchOutcome::Rejected {
                status: 503,
                body: "unavailable".to_string(),
            },
            3,
        );
        h.orchestrator.on_event_received(event("e1")).await.unwrap();
        h.clock.set(at("2024-01-01T00:01:00Z"));

        let first = h.worker.run_once().await.unwrap();
        assert_eq!(
            first,
            vec![TaskResult::Retrying {
                attempts: 1,
                delay: Duration::from_secs(2)
            }]
        );
        assert_eq!(h.queue.delayed().await[0].1, at("2024-01-01T00:01:02Z"));

        h.clock.set(at("2024-01-01T00:01:02Z"));
        let second = h.worker.run_once().await.unwrap();
        assert_eq!(
            second,
            vec![TaskResult::Retrying {
                attempts: 2,
                delay: Duration::from_secs(4)
            }]
        );

        h.clock.set(at("2024-01-01T00:01:06Z"));
        let third = h.worker.run_once().await.unwrap();
        assert!(matches!(third[0], TaskResult::DeadLettered { attempts: 3, .. }));

        assert!(h.queue.is_drained().await);
        let dead = h.queue.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].task.attempts, 3);
        assert_eq!(dead[0].failed_at, at("2024-01-01T00:01:06Z"));
        assert!(!h.ledger.is_sent("e1").await.unwrap());
    }

    #[tokio::test]
    async fn test_non_retryable_rejection_dead_letters_immediately() {
        let h = harness(
            DispatchOutcome::Rejected {
                status: 400,
                body: "bad request".to_string(),
            },
            5,
        );
        h.orchestrator.on_event_received(event("e1")).await.unwrap();
        h.clock.set(at("2024-01-01T00:01:00Z"));

        let results = h.worker.run_once().await.unwrap();
        assert!(matches!(results[0], TaskResult::DeadLettered { attempts: 1, .. }));
        assert_eq!(h.dispatcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicate_tasks_send_once() {
        let h = harness(delivered(), 5);
        h.orchestrator.on_event_received(event("e1")).await.unwrap();
        h.orchestrator.on_event_received(event("e1")).await.unwrap();
        h.clock.set(at("2024-01-01T00:01:00Z"));

        // Sequential fires: the second one is stopped by the pre-check.
        let claimed = h
            .queue
            .claim_due(h.clock.now(), 1, Duration::from_secs(30))
            .await
            .unwrap()
            .remove(0);
        let first = h.worker.process(claimed).await;
        let second = h.worker.run_once().await.unwrap();

        assert_eq!(first, TaskResult::Completed(FireOutcome::Sent));
        assert_eq!(second, vec![TaskResult::Completed(FireOutcome::SkippedAlreadySent)]);
        assert_eq!(h.dispatcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.ledger.sent_count().await, 1);
    }

    #[tokio::test]
    async fn test_stalled_task_is_refired_after_lease() {
        let h = harness(delivered(), 5);
        h.orchestrator.on_event_received(event("e1")).await.unwrap();
        h.clock.set(at("2024-01-01T00:01:00Z"));

        // A worker claims the task and disappears.
        let claimed = h
            .queue
            .claim_due(h.clock.now(), 1, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert!(h.worker.run_once().await.unwrap().is_empty());

        h.clock.set(at("2024-01-01T00:01:30Z"));
        let results = h.worker.run_once().await.unwrap();
        assert_eq!(results, vec![TaskResult::Completed(FireOutcome::Sent)]);
    }

    #[tokio::test]
    async fn test_run_until_drains_and_stops() {
        let h = harness(delivered(), 5);
        h.orchestrator.on_event_received(event("e1")).await.unwrap();
        h.orchestrator.on_event_received(event("e2")).await.unwrap();
        h.clock.set(at("2024-01-01T00:01:00Z"));

        let ledger = h.ledger.clone();
        let shutdown = async move {
            for _ in 0..200 {
                if ledger.sent_count().await == 2 {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };

        h.worker.clone().run_until(shutdown).await.unwrap();

        assert_eq!(h.ledger.sent_count().await, 2);
        assert!(h.queue.is_drained().await);
    }
}
