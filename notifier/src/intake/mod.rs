//! Event intake for `user.created` messages.
//!
//! ```text
//! user.exchange --user.created--> notification-service-user-created --> NotificationScheduler::on_event_received
//! ```

pub mod consumer;
pub mod types;

use tracing::{error, warn};

use crate::orchestrator::NotificationScheduler;

pub use types::{
    CreatedAt, NotificationEvent, UserId, UserPayload, USER_CREATED_QUEUE,
    USER_CREATED_ROUTING_KEY, USER_EXCHANGE,
};

/// What to tell the broker about a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Scheduled; the message is consumed.
    Ack,
    /// Malformed; drop it without requeue.
    Reject,
    /// Scheduling failed; requeue for redelivery.
    Requeue,
}

/// Decode a message body and schedule its notification.
///
/// Duplicate event ids are passed through; the delivery ledger deals with them.
pub async fn handle_message(
    scheduler: &NotificationScheduler,
    body: &[u8],
    message_id: &str,
) -> Disposition {
    let event = match NotificationEvent::from_slice(body) {
        Ok(event) => event,
        Err(e) => {
            error!(
                message_id = %message_id,
                error = %e,
                body_preview = %String::from_utf8_lossy(&body[..body.len().min(500)]),
                "intake_event_parse_failed"
            );
            return Disposition::Reject;
        }
    };

    match scheduler.on_event_received(event).await {
        Ok(_) => Disposition::Ack,
        Err(e) => {
            warn!(
                message_id = %message_id,
                event_id = %e.event_id,
                error = %e,
                "intake_event_requeued"
            );
            Disposition::Requeue
        }
    }
}
