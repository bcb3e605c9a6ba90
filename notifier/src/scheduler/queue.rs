//! Deferred task queue port and its in-memory implementation.
//!
//! A queue keeps three sets of tasks:
//!
//! ```text
//! delayed (ready_at) --claim_due--> active (lease deadline) --complete--> gone
//!        ^                               |   |
//!        +------ retry / requeue_expired-+   +--dead_letter--> dead
//! ```

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::task::DeferredTask;
use crate::error::QueueError;

/// A task that exhausted its attempts or failed terminally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub task: DeferredTask,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

/// Execution substrate that runs a task after a caller-chosen delay.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Store the task so it becomes due `delay` after `now`.
    async fn enqueue(
        &self,
        task: &DeferredTask,
        now: DateTime<Utc>,
        delay: Duration,
    ) -> Result<(), QueueError>;

    /// Atomically move up to `limit` due tasks to the active set.
    ///
    /// A claimed task is invisible to other claimers until `lease` expires.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<DeferredTask>, QueueError>;

    /// Forget a task that finished.
    async fn complete(&self, task: &DeferredTask) -> Result<(), QueueError>;

    /// Put a failed task back, due `delay` after `now`.
    async fn retry(
        &self,
        task: &DeferredTask,
        now: DateTime<Utc>,
        delay: Duration,
    ) -> Result<(), QueueError>;

    /// Remove a task for good and keep it for operators, stamped with `now`.
    async fn dead_letter(
        &self,
        task: &DeferredTask,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError>;

    /// Return active tasks whose lease expired to the delayed set.
    async fn requeue_expired(&self, now: DateTime<Utc>) -> Result<usize, QueueError>;
}

pub(crate) fn ready_at(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    match chrono::Duration::from_std(delay) {
        Ok(d) => now.checked_add_signed(d).unwrap_or(DateTime::<Utc>::MAX_UTC),
        Err(_) => DateTime::<Utc>::MAX_UTC,
    }
}

#[derive(Default)]
struct MemoryState {
    tasks: HashMap<String, DeferredTask>,
    delayed: HashMap<String, DateTime<Utc>>,
    active: HashMap<String, DateTime<Utc>>,
    dead: Vec<DeadLetter>,
    enqueued: usize,
}

/// In-memory queue for tests and single-process runs.
#[derive(Default)]
pub struct InMemoryTaskQueue {
    state: Mutex<MemoryState>,
    unavailable: std::sync::atomic::AtomicBool,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail, as if the backend were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable
            .store(unavailable, std::sync::atomic::Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), QueueError> {
        if self.unavailable.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(QueueError::Unavailable("queue marked unavailable".to_string()));
        }
        Ok(())
    }

    /// Delayed tasks with their due times, earliest first.
    pub async fn delayed(&self) -> Vec<(DeferredTask, DateTime<Utc>)> {
        let state = self.state.lock().await;
        let mut out: Vec<_> = state
            .delayed
            .iter()
            .filter_map(|(id, at)| state.tasks.get(id).map(|t| (t.clone(), *at)))
            .collect();
        out.sort_by_key(|(_, at)| *at);
        out
    }

    pub async fn active_count(&self) -> usize {
        self.state.lock().await.active.len()
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().await.dead.clone()
    }

    /// Number of successful `enqueue` calls so far.
    pub async fn enqueued_count(&self) -> usize {
        self.state.lock().await.enqueued
    }

    /// True when nothing is delayed or active.
    pub async fn is_drained(&self) -> bool {
        let state = self.state.lock().await;
        state.delayed.is_empty() && state.active.is_empty()
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(
        &self,
        task: &DeferredTask,
        now: DateTime<Utc>,
        delay: Duration,
    ) -> Result<(), QueueError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.tasks.insert(task.id.clone(), task.clone());
        state.delayed.insert(task.id.clone(), ready_at(now, delay));
        state.enqueued += 1;
        Ok(())
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<DeferredTask>, QueueError> {
        self.check_available()?;
        let mut state = self.state.lock().await;

        let mut due: Vec<(String, DateTime<Utc>)> = state
            .delayed
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, at)| (id.clone(), *at))
            .collect();
        due.sort_by_key(|(_, at)| *at);
        due.truncate(limit);

        let deadline = ready_at(now, lease);
        let mut claimed = Vec::with_capacity(due.len());
        for (id, _) in due {
            state.delayed.remove(&id);
            if let Some(task) = state.tasks.get(&id).cloned() {
                state.active.insert(id, deadline);
                claimed.push(task);
            }
        }
        Ok(claimed)
    }

    async fn complete(&self, task: &DeferredTask) -> Result<(), QueueError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.active.remove(&task.id);
        state.tasks.remove(&task.id);
        Ok(())
    }

    async fn retry(
        &self,
        task: &DeferredTask,
        now: DateTime<Utc>,
        delay: Duration,
    ) -> Result<(), QueueError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.active.remove(&task.id);
        state.tasks.insert(task.id.clone(), task.clone());
        state.delayed.insert(task.id.clone(), ready_at(now, delay));
        Ok(())
    }

    async fn dead_letter(
        &self,
        task: &DeferredTask,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.active.remove(&task.id);
        state.delayed.remove(&task.id);
        state.tasks.remove(&task.id);
        state.dead.push(DeadLetter {
            task: task.clone(),
            reason: reason.to_string(),
            failed_at: now,
        });
        Ok(())
    }

    async fn requeue_expired(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let expired: Vec<String> = state
            .active
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            state.active.remove(id);
            state.delayed.insert(id.clone(), now);
        }
        Ok(expired.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intake::{UserId, UserPayload};
    use crate::scheduler::task::ScheduledDispatch;

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn task(event_id: &str) -> DeferredTask {
        DeferredTask::new(ScheduledDispatch {
            event_id: event_id.to_string(),
            fire_payload: UserPayload {
                id: UserId::from("u1"),
                first_name: "Ann".to_string(),
                created_at: at("2024-01-01T00:00:00Z").into(),
                extra: Default::default(),
            },
            fire_at: at("2024-01-01T00:01:00Z"),
        })
    }

    #[tokio::test]
    async fn test_task_not_claimed_before_due() {
        let queue = InMemoryTaskQueue::new();
        let now = at("2024-01-01T00:00:00Z");
        queue.enqueue(&task("e1"), now, Duration::from_secs(60)).await.unwrap();

        let early = queue
            .claim_due(at("2024-01-01T00:00:59Z"), 10, Duration::from_secs(30))
            .await
            .unwrap();
        assert!(early.is_empty());

        let due = queue
            .claim_due(at("2024-01-01T00:01:00Z"), 10, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].event_id(), "e1");
        assert_eq!(queue.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let queue = InMemoryTaskQueue::new();
        let now = at("2024-01-01T00:00:00Z");
        queue.enqueue(&task("e1"), now, Duration::ZERO).await.unwrap();

        let first = queue.claim_due(now, 10, Duration::from_secs(30)).await.unwrap();
        let second = queue.claim_due(now, 10, Duration::from_secs(30)).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_claim_respects_limit_and_order() {
        let queue = InMemoryTaskQueue::new();
        let now = at("2024-01-01T00:00:00Z");
        queue.enqueue(&task("late"), now, Duration::from_secs(3)).await.unwrap();
        queue.enqueue(&task("early"), now, Duration::from_secs(1)).await.unwrap();
        queue.enqueue(&task("middle"), now, Duration::from_secs(2)).await.unwrap();

        let claimed = queue
            .claim_due(at("2024-01-01T00:00:10Z"), 2, Duration::from_secs(30))
            .await
            .unwrap();
        let ids: Vec<_> = claimed.iter().map(|t| t.event_id()).collect();
        assert_eq!(ids, vec!["early", "middle"]);
    }

    #[tokio::test]
    async fn test_expired_lease_is_requeued() {
        let queue = InMemoryTaskQueue::new();
        let now = at("2024-01-01T00:00:00Z");
        queue.enqueue(&task("e1"), now, Duration::ZERO).await.unwrap();
        queue.claim_due(now, 1, Duration::from_secs(30)).await.unwrap();

        assert_eq!(queue.requeue_expired(at("2024-01-01T00:00:29Z")).await.unwrap(), 0);
        assert_eq!(queue.requeue_expired(at("2024-01-01T00:00:30Z")).await.unwrap(), 1);

        let again = queue
            .claim_due(at("2024-01-01T00:00:30Z"), 1, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(again.len(), 1);
    }

    #[tokio::test]
    async fn test_retry_and_dead_letter() {
        let queue = InMemoryTaskQueue::new();
        let now = at("2024-01-01T00:00:00Z");
        let original = task("e1");
        queue.enqueue(&original, now, Duration::ZERO).await.unwrap();
        let claimed = queue.claim_due(now, 1, Duration::from_secs(30)).await.unwrap();

        let failed = claimed[0].failed_attempt("status 500");
        queue.retry(&failed, now, Duration::from_secs(2)).await.unwrap();
        let delayed = queue.delayed().await;
        assert_eq!(delayed.len(), 1);
        assert_eq!(delayed[0].0.attempts, 1);
        assert_eq!(delayed[0].1, at("2024-01-01T00:00:02Z"));

        queue
            .dead_letter(&failed, "max attempts", at("2024-01-01T00:00:05Z"))
            .await
            .unwrap();
        assert!(queue.is_drained().await);
        let dead = queue.dead_letters().await;
        assert_eq!(dead[0].reason, "max attempts");
        assert_eq!(dead[0].failed_at, at("2024-01-01T00:00:05Z"));
    }

    #[tokio::test]
    async fn test_unavailable_queue_rejects_enqueue() {
        let queue = InMemoryTaskQueue::new();
        queue.set_unavailable(true);
        let err = queue
            .enqueue(&task("e1"), Utc::now(), Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Unavailable(_)));
        assert_eq!(queue.enqueued_count().await, 0);
    }
}
