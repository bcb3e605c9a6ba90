//! Dispatch orchestration - the per-event notification state machine.
//!
//! ```text
//! Received -> Scheduled -> Dispatching -> Sent
//!                                     \-> Failed (retried by the worker)
//! ```
//!
//! The webhook call happens before, and outside of, the ledger transaction.
//! The ledger's conditional write is the only record of "sent", so repeated
//! fires for one event converge on a single `Sent` even if the webhook is
//! called more than once.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::dispatch::NotificationDispatcher;
use crate::error::{FireError, SchedulingError};
use crate::intake::{NotificationEvent, UserPayload};
use crate::ledger::{DeliveryLedger, MarkOutcome};
use crate::scheduler::{DelayScheduler, SchedulingResult};

/// Lifecycle of one notification, carried on every transition log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Received,
    Scheduled,
    Dispatching,
    Sent,
    Failed,
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DispatchState::Received => "received",
            DispatchState::Scheduled => "scheduled",
            DispatchState::Dispatching => "dispatching",
            DispatchState::Sent => "sent",
            DispatchState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// How a fired task ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome {
    /// The webhook was called and this attempt recorded the send.
    Sent,
    /// The ledger pre-check found the event already sent; no call was made.
    SkippedAlreadySent,
    /// The webhook was called but another attempt recorded the send first.
    AlreadyRecorded,
}

/// Intake half of the state machine: `Received -> Scheduled`.
///
/// Needs only the task queue, so the intake process never touches the
/// ledger or the webhook.
#[derive(Clone)]
pub struct NotificationScheduler {
    scheduler: DelayScheduler,
    offset: chrono::Duration,
}

impl NotificationScheduler {
    /// `delay` is added to each user's `createdAt` to get the fire time.
    pub fn new(scheduler: DelayScheduler, delay: Duration) -> Self {
        Self {
            scheduler,
            offset: chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX),
        }
    }

    /// Fire time for an event: `createdAt + offset`.
    pub fn fire_at(&self, user: &UserPayload) -> DateTime<Utc> {
        user.created_at
            .instant()
            .checked_add_signed(self.offset)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Schedule the notification for a freshly received event.
    ///
    /// On error nothing has been persisted and the event must be redelivered.
    pub async fn on_event_received(
        &self,
        event: NotificationEvent,
    ) -> Result<SchedulingResult, SchedulingError> {
        info!(
            event_id = %event.event_id,
            user_id = %event.user.id,
            created_at = %event.user.created_at,
            state = %DispatchState::Received,
            "notification_received"
        );

        let fire_at = self.fire_at(&event.user);
        let NotificationEvent { event_id, user } = event;
        let result = self.scheduler.schedule(&event_id, user, fire_at).await?;

        info!(
            event_id = %event_id,
            task_id = %result.task_id,
            fire_at = %result.fire_at.to_rfc3339(),
            delay_ms = result.delay.as_millis() as u64,
            state = %DispatchState::Scheduled,
            "notification_scheduled"
        );

        Ok(result)
    }
}

/// Ties intake, scheduling, dispatch and the ledger together.
#[derive(Clone)]
pub struct Orchestrator {
    scheduling: NotificationScheduler,
    dispatcher: Arc<dyn NotificationDispatcher>,
    ledger: Arc<dyn DeliveryLedger>,
    precheck: bool,
}

impl Orchestrator {
    /// `delay` is added to each user's `createdAt` to get the fire time.
    pub fn new(
        scheduler: DelayScheduler,
        dispatcher: Arc<dyn NotificationDispatcher>,
        ledger: Arc<dyn DeliveryLedger>,
        delay: Duration,
    ) -> Self {
        Self {
            scheduling: NotificationScheduler::new(scheduler, delay),
            dispatcher,
            ledger,
            precheck: true,
        }
    }

    /// Enable or disable the ledger lookup before each webhook call.
    pub fn with_precheck(mut self, precheck: bool) -> Self {
        self.precheck = precheck;
        self
    }

    /// The intake half, for handing to the event consumer.
    pub fn scheduling(&self) -> &NotificationScheduler {
        &self.scheduling
    }

    pub fn fire_at(&self, user: &UserPayload) -> DateTime<Utc> {
        self.scheduling.fire_at(user)
    }

    pub async fn on_event_received(
        &self,
        event: NotificationEvent,
    ) -> Result<SchedulingResult, SchedulingError> {
        self.scheduling.on_event_received(event).await
    }

    /// Run a deferred notification task.
    ///
    /// An `Err` leaves the ledger untouched (or unable to record) and asks the
    /// queue to fire the task again.
    pub async fn on_fire(
        &self,
        event_id: &str,
        payload: &UserPayload,
    ) -> Result<FireOutcome, FireError> {
        if self.precheck {
            match self.ledger.is_sent(event_id).await {
                Ok(true) => {
                    info!(
                        event_id = %event_id,
                        user_id = %payload.id,
                        state = %DispatchState::Sent,
                        "notification_already_sent"
                    );
                    return Ok(FireOutcome::SkippedAlreadySent);
                }
                Ok(false) => {}
                Err(e) => {
                    error!(
                        event_id = %event_id,
                        user_id = %payload.id,
                        error = %e,
                        state = %DispatchState::Failed,
                        "notification_precheck_failed"
                    );
                    return Err(FireError::Ledger(e));
                }
            }
        }

        info!(
            event_id = %event_id,
            user_id = %payload.id,
            state = %DispatchState::Dispatching,
            "notification_dispatching"
        );

        let event = NotificationEvent {
            event_id: event_id.to_string(),
            user: payload.clone(),
        };

        let summary = match self.dispatcher.dispatch(&event).await.into_result() {
            Ok(summary) => summary,
            Err(failure) => {
                error!(
                    event_id = %event_id,
                    user_id = %payload.id,
                    error = %failure,
                    response_body = failure.body().unwrap_or(""),
                    retryable = failure.is_retryable(),
                    state = %DispatchState::Failed,
                    "notification_dispatch_failed"
                );
                return Err(FireError::Dispatch(failure));
            }
        };

        match self.ledger.mark_sent(event_id).await {
            Ok(MarkOutcome::Applied) => {
                info!(
                    event_id = %event_id,
                    user_id = %payload.id,
                    status_code = summary.status,
                    response_body = %summary.body,
                    state = %DispatchState::Sent,
                    "notification_sent"
                );
                Ok(FireOutcome::Sent)
            }
            Ok(MarkOutcome::AlreadyApplied) => {
                info!(
                    event_id = %event_id,
                    user_id = %payload.id,
                    state = %DispatchState::Sent,
                    "notification_already_recorded"
                );
                Ok(FireOutcome::AlreadyRecorded)
            }
            Err(e) => {
                // The webhook already accepted the call; a retry may repeat it.
                warn!(
                    event_id = %event_id,
                    user_id = %payload.id,
                    error = %e,
                    state = %DispatchState::Failed,
                    "notification_record_failed"
                );
                Err(FireError::Ledger(e))
            }
        }
    }
}
