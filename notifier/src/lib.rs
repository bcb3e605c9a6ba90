//! Signup notifier - delayed, idempotent webhook notifications for new users.
//!
//! This library provides shared modules for the three binaries:
//! - `notifier-intake`: RabbitMQ consumer that schedules a notification per `user.created` event
//! - `notifier-worker`: Worker pool that fires due notifications and records delivery
//! - `notifier-web`: Liveness server
//!
//! ## Architecture
//!
//! ```text
//! user.created -> Intake -> Orchestrator -> DelayScheduler -> TaskQueue (Redis)
//!                                                                 |
//!                   Ledger (Postgres) <- Orchestrator <- Worker <-+
//!                                            |
//!                                            +-> WebhookDispatcher -> WEBHOOK_URL
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod intake;
pub mod ledger;
pub mod orchestrator;
pub mod runtime;
pub mod scheduler;
pub mod util;
pub mod web;
pub mod worker;

// Re-export commonly used types
pub use config::Config;
pub use dispatch::{DispatchOutcome, NotificationDispatcher, WebhookConfig, WebhookDispatcher};
pub use error::{DispatchFailure, FireError, LedgerError, QueueError, SchedulingError};
pub use intake::{CreatedAt, NotificationEvent, UserId, UserPayload};
pub use ledger::{DeliveryLedger, InMemoryLedger, MarkOutcome, PostgresLedger};
pub use orchestrator::{DispatchState, FireOutcome, NotificationScheduler, Orchestrator};
pub use scheduler::{DelayScheduler, RedisTaskQueue, RetryPolicy, SchedulingResult, TaskQueue};
pub use worker::{TaskResult, TaskWorker, WorkerSettings};
