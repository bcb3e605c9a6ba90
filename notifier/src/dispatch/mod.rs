//! Webhook dispatch.
//!
//! The dispatcher makes exactly one outbound call per invocation and
//! classifies the result; retry decisions belong to the worker.

pub mod signing;
pub mod webhook;

pub use signing::{sign, verify_signature, SIGNATURE_HEADER, TIMESTAMP_HEADER};
pub use webhook::{
    render_message, DispatchOutcome, NotificationDispatcher, ResponseSummary, WebhookConfig,
    WebhookDispatcher, EVENT_ID_HEADER,
};
