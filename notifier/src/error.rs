//! Error types for each stage of the notification pipeline.
//!
//! Every stage has its own error so callers can decide between acking,
//! requeueing, retrying or dead-lettering without string matching.

use thiserror::Error;

/// Configuration could not be loaded from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// An inbound message could not be turned into a notification event.
///
/// Shape errors never heal on redelivery, so these are dropped.
#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("malformed event payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("event is missing an eventId")]
    MissingEventId,
}

/// Errors raised by a deferred-task queue backend.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("task serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("queue unavailable: {0}")]
    Unavailable(String),
}

/// The delay scheduler could not hand the task to the queue.
///
/// The originating event must not be acknowledged when this is returned.
#[derive(Debug, Error)]
#[error("failed to schedule notification for event {event_id}: {source}")]
pub struct SchedulingError {
    pub event_id: String,
    #[source]
    pub source: QueueError,
}

/// The delivery ledger could not be read or written.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

/// A webhook call that did not end in a 2xx response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchFailure {
    /// The endpoint answered with a non-success status.
    #[error("webhook rejected the notification with status {status}")]
    Rejected { status: u16, body: String },

    /// The endpoint could not be reached or did not answer in time.
    #[error("webhook unreachable: {cause}")]
    Unreachable { cause: String },
}

impl DispatchFailure {
    /// Whether a later attempt could plausibly succeed.
    ///
    /// Network failures always are; rejections only for server errors,
    /// request timeouts and rate limiting.
    pub fn is_retryable(&self) -> bool {
        match self {
            DispatchFailure::Unreachable { .. } => true,
            DispatchFailure::Rejected { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
        }
    }

    /// Response body returned by the endpoint, if any.
    pub fn body(&self) -> Option<&str> {
        match self {
            DispatchFailure::Rejected { body, .. } if !body.is_empty() => Some(body),
            _ => None,
        }
    }
}

/// A fired task that did not reach a terminal success.
#[derive(Debug, Error)]
pub enum FireError {
    #[error(transparent)]
    Dispatch(#[from] DispatchFailure),

    /// The webhook may already have been called; the ledger did not record it.
    #[error("failed to record delivery: {0}")]
    Ledger(#[from] LedgerError),
}

impl FireError {
    pub fn is_retryable(&self) -> bool {
        match self {
            FireError::Dispatch(failure) => failure.is_retryable(),
            FireError::Ledger(_) => true,
        }
    }
}
