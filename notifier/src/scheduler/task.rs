//! Deferred task payloads handed to the queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::intake::{NotificationEvent, UserPayload};

/// Task name for the notification job.
pub const SEND_NOTIFICATION_TASK: &str = "sendNotification";

/// A notification whose fire time has been fixed.
///
/// `fire_at` is computed once from the original `createdAt` and travels with
/// the task, so retries never recompute it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledDispatch {
    pub event_id: String,
    pub fire_payload: UserPayload,
    pub fire_at: DateTime<Utc>,
}

impl ScheduledDispatch {
    /// The event as it will be handed back to the orchestrator at fire time.
    pub fn event(&self) -> NotificationEvent {
        NotificationEvent {
            event_id: self.event_id.clone(),
            user: self.fire_payload.clone(),
        }
    }
}

/// A unit of work owned by the queue between scheduling and firing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredTask {
    /// Queue-level identity; distinct per submission even for duplicate events.
    pub id: String,
    pub name: String,
    pub dispatch: ScheduledDispatch,
    /// Attempts already made; zero until the first fire fails.
    #[serde(default)]
    pub attempts: u32,
    /// Last failure recorded against the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl DeferredTask {
    pub fn new(dispatch: ScheduledDispatch) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: SEND_NOTIFICATION_TASK.to_string(),
            dispatch,
            attempts: 0,
            last_error: None,
        }
    }

    pub fn event_id(&self) -> &str {
        &self.dispatch.event_id
    }

    /// Copy of this task after a failed attempt.
    pub fn failed_attempt(&self, error: impl Into<String>) -> Self {
        Self {
            attempts: self.attempts + 1,
            last_error: Some(error.into()),
            ..self.clone()
        }
    }
}
