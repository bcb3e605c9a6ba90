//! Redis-backed deferred task queue.
//!
//! Layout under the configured prefix:
//! - `{prefix}:tasks`   hash, task id -> task JSON
//! - `{prefix}:delayed` sorted set, task id scored by due time (ms)
//! - `{prefix}:active`  sorted set, task id scored by lease deadline (ms)
//! - `{prefix}:dead`    list of dead-letter JSON entries
//!
//! Claiming and lease recovery run as Lua scripts so a task is never in
//! both sets or in neither.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tracing::{info, warn};

use super::queue::{ready_at, DeadLetter, TaskQueue};
use super::task::DeferredTask;
use crate::error::QueueError;

const CLAIM_DUE_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
local out = {}
for _, id in ipairs(ids) do
  redis.call('ZREM', KEYS[1], id)
  local body = redis.call('HGET', KEYS[3], id)
  if body then
    redis.call('ZADD', KEYS[2], ARGV[3], id)
    table.insert(out, id)
    table.insert(out, body)
  end
end
return out
"#;

const REQUEUE_EXPIRED_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, id in ipairs(ids) do
  redis.call('ZREM', KEYS[1], id)
  redis.call('ZADD', KEYS[2], ARGV[1], id)
end
return #ids
"#;

/// Deferred task queue stored in Redis.
#[derive(Clone)]
pub struct RedisTaskQueue {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisTaskQueue {
    /// Connect and build a queue under `prefix`.
    pub async fn connect(redis_url: &str, prefix: impl Into<String>) -> Result<Self, QueueError> {
        let client = Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        let prefix = prefix.into();

        info!(prefix = %prefix, "redis_queue_connected");
        Ok(Self { conn, prefix })
    }

    fn tasks_key(&self) -> String {
        format!("{}:tasks", self.prefix)
    }

    fn delayed_key(&self) -> String {
        format!("{}:delayed", self.prefix)
    }

    fn active_key(&self) -> String {
        format!("{}:active", self.prefix)
    }

    fn dead_key(&self) -> String {
        format!("{}:dead", self.prefix)
    }
}

fn score(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn enqueue(
        &self,
        task: &DeferredTask,
        now: DateTime<Utc>,
        delay: Duration,
    ) -> Result<(), QueueError> {
        let body = serde_json::to_string(task)?;
        let mut conn = self.conn.clone();

        let _: () = redis::pipe()
            .atomic()
            .hset(self.tasks_key(), &task.id, body)
            .ignore()
            .zadd(self.delayed_key(), &task.id, score(ready_at(now, delay)))
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<DeferredTask>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        // Flat list of id, body pairs.
        let claimed: Vec<String> = Script::new(CLAIM_DUE_SCRIPT)
            .key(self.delayed_key())
            .key(self.active_key())
            .key(self.tasks_key())
            .arg(score(now))
            .arg(limit)
            .arg(score(ready_at(now, lease)))
            .invoke_async(&mut conn)
            .await?;

        let mut tasks = Vec::with_capacity(claimed.len() / 2);
        for pair in claimed.chunks_exact(2) {
            let (id, body) = (&pair[0], &pair[1]);
            match serde_json::from_str::<DeferredTask>(body) {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    // Unreadable entries would otherwise cycle through lease expiry forever.
                    warn!(
                        task_id = %id,
                        error = %e,
                        body_preview = %body.chars().take(200).collect::<String>(),
                        "redis_queue_task_corrupt"
                    );
                    let _: () = redis::pipe()
                        .atomic()
                        .zrem(self.active_key(), id)
                        .ignore()
                        .hdel(self.tasks_key(), id)
                        .ignore()
                        .rpush(self.dead_key(), body)
                        .ignore()
                        .query_async(&mut conn)
                        .await?;
                }
            }
        }
        Ok(tasks)
    }

    async fn complete(&self, task: &DeferredTask) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .zrem(self.active_key(), &task.id)
            .ignore()
            .hdel(self.tasks_key(), &task.id)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn retry(
        &self,
        task: &DeferredTask,
        now: DateTime<Utc>,
        delay: Duration,
    ) -> Result<(), QueueError> {
        let body = serde_json::to_string(task)?;
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .zrem(self.active_key(), &task.id)
            .ignore()
            .hset(self.tasks_key(), &task.id, body)
            .ignore()
            .zadd(self.delayed_key(), &task.id, score(ready_at(now, delay)))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn dead_letter(
        &self,
        task: &DeferredTask,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let entry = DeadLetter {
            task: task.clone(),
            reason: reason.to_string(),
            failed_at: now,
        };
        let body = serde_json::to_string(&entry)?;
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .zrem(self.active_key(), &task.id)
            .ignore()
            .zrem(self.delayed_key(), &task.id)
            .ignore()
            .hdel(self.tasks_key(), &task.id)
            .ignore()
            .rpush(self.dead_key(), body)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn requeue_expired(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let moved: usize = Script::new(REQUEUE_EXPIRED_SCRIPT)
            .key(self.active_key())
            .key(self.delayed_key())
            .arg(score(now))
            .invoke_async(&mut conn)
            .await?;
        Ok(moved)
    }
}
