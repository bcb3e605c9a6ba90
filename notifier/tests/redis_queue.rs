//! RedisTaskQueue against a real Redis.
//!
//! These tests require a running Redis server. `REDIS_URL` defaults to
//! `redis://127.0.0.1:6379`. Run with:
//!
//! ```bash
//! REDIS_URL="redis://..." cargo test -p signup-notifier --test redis_queue -- --ignored --nocapture
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::AsyncCommands;

use notifier::intake::{UserId, UserPayload};
use notifier::scheduler::{DeadLetter, DeferredTask, RedisTaskQueue, ScheduledDispatch, TaskQueue};

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

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

/// Queue under a prefix no other test run shares, plus a raw connection.
async fn setup() -> (RedisTaskQueue, redis::aio::MultiplexedConnection, String) {
    let prefix = format!("notifier-test-{}", uuid::Uuid::new_v4());
    let queue = RedisTaskQueue::connect(&redis_url(), prefix.clone())
        .await
        .unwrap();
    let conn = redis::Client::open(redis_url())
        .unwrap()
        .get_multiplexed_async_connection()
        .await
        .unwrap();
    (queue, conn, prefix)
}

async fn cleanup(conn: &mut redis::aio::MultiplexedConnection, prefix: &str) {
    let keys: Vec<String> = ["tasks", "delayed", "active", "dead"]
        .iter()
        .map(|k| format!("{}:{}", prefix, k))
        .collect();
    let _: () = conn.del(keys).await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Redis — run explicitly with --ignored
async fn test_claim_only_when_due_and_only_once() {
    let (queue, mut conn, prefix) = setup().await;
    let now = at("2024-01-01T00:00:00Z");
    let lease = Duration::from_secs(30);

    queue.enqueue(&task("e1"), now, Duration::from_secs(60)).await.unwrap();

    assert!(queue
        .claim_due(at("2024-01-01T00:00:59Z"), 10, lease)
        .await
        .unwrap()
        .is_empty());

    let due = queue.claim_due(at("2024-01-01T00:01:00Z"), 10, lease).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].event_id(), "e1");

    let again = queue.claim_due(at("2024-01-01T00:01:00Z"), 10, lease).await.unwrap();
    assert!(again.is_empty());

    queue.complete(&due[0]).await.unwrap();
    let active: usize = conn.zcard(format!("{}:active", prefix)).await.unwrap();
    let tasks: usize = conn.hlen(format!("{}:tasks", prefix)).await.unwrap();
    assert_eq!((active, tasks), (0, 0));

    cleanup(&mut conn, &prefix).await;
}

#[tokio::test]
#[ignore]
async fn test_expired_lease_returns_task_to_delayed() {
    let (queue, mut conn, prefix) = setup().await;
    let now = at("2024-01-01T00:00:00Z");
    let lease = Duration::from_secs(30);

    queue.enqueue(&task("e1"), now, Duration::ZERO).await.unwrap();
    assert_eq!(queue.claim_due(now, 1, lease).await.unwrap().len(), 1);

    assert_eq!(queue.requeue_expired(at("2024-01-01T00:00:29Z")).await.unwrap(), 0);
    assert_eq!(queue.requeue_expired(at("2024-01-01T00:00:30Z")).await.unwrap(), 1);

    let reclaimed = queue
        .claim_due(at("2024-01-01T00:00:30Z"), 1, lease)
        .await
        .unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].event_id(), "e1");

    cleanup(&mut conn, &prefix).await;
}

#[tokio::test]
#[ignore]
async fn test_retry_keeps_attempts_and_dead_letter_records_reason() {
    let (queue, mut conn, prefix) = setup().await;
    let now = at("2024-01-01T00:00:00Z");
    let lease = Duration::from_secs(30);

    queue.enqueue(&task("e1"), now, Duration::ZERO).await.unwrap();
    let claimed = queue.claim_due(now, 1, lease).await.unwrap().remove(0);

    let failed = claimed.failed_attempt("status 500");
    queue.retry(&failed, now, Duration::from_secs(2)).await.unwrap();
    assert!(queue
        .claim_due(at("2024-01-01T00:00:01Z"), 1, lease)
        .await
        .unwrap()
        .is_empty());

    let retried = queue
        .claim_due(at("2024-01-01T00:00:02Z"), 1, lease)
        .await
        .unwrap()
        .remove(0);
    assert_eq!(retried.attempts, 1);

    queue
        .dead_letter(&retried, "max attempts", at("2024-01-01T00:00:03Z"))
        .await
        .unwrap();
    let dead: Vec<String> = conn.lrange(format!("{}:dead", prefix), 0, -1).await.unwrap();
    assert_eq!(dead.len(), 1);
    let entry: DeadLetter = serde_json::from_str(&dead[0]).unwrap();
    assert_eq!(entry.reason, "max attempts");
    assert_eq!(entry.failed_at, at("2024-01-01T00:00:03Z"));
    assert_eq!(entry.task.id, claimed.id);

    cleanup(&mut conn, &prefix).await;
}

#[tokio::test]
#[ignore]
async fn test_corrupt_task_body_is_dead_lettered() {
    let (queue, mut conn, prefix) = setup().await;
    let tasks_key = format!("{}:tasks", prefix);

    let _: () = conn.hset(&tasks_key, "bad-1", "not json").await.unwrap();
    let _: () = conn
        .zadd(format!("{}:delayed", prefix), "bad-1", 0)
        .await
        .unwrap();

    let claimed = queue
        .claim_due(at("2024-01-01T00:00:00Z"), 10, Duration::from_secs(30))
        .await
        .unwrap();
    assert!(claimed.is_empty());

    let dead: Vec<String> = conn.lrange(format!("{}:dead", prefix), 0, -1).await.unwrap();
    assert_eq!(dead, vec!["not json".to_string()]);
    let active: usize = conn.zcard(format!("{}:active", prefix)).await.unwrap();
    let remaining: bool = conn.hexists(&tasks_key, "bad-1").await.unwrap();
    assert_eq!(active, 0);
    assert!(!remaining);

    // Nothing comes back after the lease would have expired.
    assert_eq!(
        queue.requeue_expired(at("2024-01-01T01:00:00Z")).await.unwrap(),
        0
    );

    cleanup(&mut conn, &prefix).await;
}
