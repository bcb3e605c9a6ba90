//! Outbound webhook call for a single notification.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{redirect, Client};
use serde::Serialize;
use tracing::{error, info, warn};
use url::Url;

use super::signing::{sign, unix_now, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use crate::error::DispatchFailure;
use crate::intake::{NotificationEvent, UserPayload};

/// Header carrying the originating event id.
pub const EVENT_ID_HEADER: &str = "X-Notification-Event-Id";

/// Longest response body kept for logs and outcomes.
const MAX_BODY_CHARS: usize = 2048;

/// Build the notification text for a user.
pub fn render_message(user: &UserPayload) -> String {
    format!(
        "Dear {} this is push notification about you created account!",
        user.first_name
    )
}

/// JSON body POSTed to the webhook.
#[derive(Debug, Serialize)]
pub struct WebhookBody<'a> {
    pub message: String,
    pub user: &'a UserPayload,
}

/// Summary of a 2xx response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseSummary {
    pub status: u16,
    pub body: String,
}

/// Classified result of one webhook call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered(ResponseSummary),
    Rejected { status: u16, body: String },
    Unreachable { cause: String },
}

impl DispatchOutcome {
    pub fn into_result(self) -> Result<ResponseSummary, DispatchFailure> {
        match self {
            DispatchOutcome::Delivered(summary) => Ok(summary),
            DispatchOutcome::Rejected { status, body } => {
                Err(DispatchFailure::Rejected { status, body })
            }
            DispatchOutcome::Unreachable { cause } => Err(DispatchFailure::Unreachable { cause }),
        }
    }
}

/// Performs the outbound side effect of a notification.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    /// Call the endpoint once. Never retries.
    async fn dispatch(&self, event: &NotificationEvent) -> DispatchOutcome;
}

/// Settings for the webhook client.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: Url,
    pub timeout: Duration,
    pub max_redirects: usize,
    pub signing_secret: Option<String>,
}

impl WebhookConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            timeout: Duration::from_millis(5000),
            max_redirects: 5,
            signing_secret: None,
        }
    }

    pub fn from_config(config: &crate::Config) -> Self {
        Self {
            url: config.webhook_url.clone(),
            timeout: config.webhook_timeout(),
            max_redirects: config.webhook_max_redirects,
            signing_secret: config.webhook_signing_secret.clone(),
        }
    }
}

/// reqwest-backed dispatcher posting `{message, user}` to one URL.
#[derive(Debug, Clone)]
pub struct WebhookDispatcher {
    client: Client,
    config: WebhookConfig,
}

impl WebhookDispatcher {
    pub fn new(config: WebhookConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(config.timeout)
            .redirect(redirect::Policy::limited(config.max_redirects))
            .pool_max_idle_per_host(32)
            .build()?;

        Ok(Self { client, config })
    }

    pub fn url(&self) -> &Url {
        &self.config.url
    }
}

#[async_trait]
impl NotificationDispatcher for WebhookDispatcher {
    async fn dispatch(&self, event: &NotificationEvent) -> DispatchOutcome {
        let body = WebhookBody {
            message: render_message(&event.user),
            user: &event.user,
        };
        let body = match serde_json::to_vec(&body) {
            Ok(b) => b,
            Err(e) => {
                return DispatchOutcome::Unreachable {
                    cause: format!("failed to serialize request body: {}", e),
                }
            }
        };

        info!(
            event_id = %event.event_id,
            user_id = %event.user.id,
            url = %self.config.url,
            body_length = body.len(),
            "webhook_request_starting"
        );

        let mut request = self
            .client
            .post(self.config.url.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(EVENT_ID_HEADER, event.event_id.as_str());

        if let Some(secret) = &self.config.signing_secret {
            let timestamp = unix_now();
            match sign(secret, timestamp, &body) {
                Ok(signature) => {
                    request = request
                        .header(TIMESTAMP_HEADER, timestamp.to_string())
                        .header(SIGNATURE_HEADER, signature);
                }
                Err(e) => {
                    return DispatchOutcome::Unreachable {
                        cause: format!("failed to sign request: {}", e),
                    }
                }
            }
        }

        let started = Instant::now();
        let response = match request.body(body).send().await {
            Ok(r) => r,
            Err(e) => {
                let cause = if e.is_timeout() {
                    format!("request timed out after {}ms", self.config.timeout.as_millis())
                } else if e.is_connect() {
                    format!("connection failed: {}", e)
                } else if e.is_redirect() {
                    format!("too many redirects: {}", e)
                } else {
                    e.to_string()
                };

                error!(
                    event_id = %event.event_id,
                    user_id = %event.user.id,
                    duration_ms = started.elapsed().as_millis() as u64,
                    timeout = e.is_timeout(),
                    error = %e,
                    "webhook_request_failed"
                );
                return DispatchOutcome::Unreachable { cause };
            }
        };

        let status = response.status().as_u16();
        let body = match response.text().await {
            Ok(text) => truncate(text),
            Err(e) => {
                warn!(
                    event_id = %event.event_id,
                    status_code = status,
                    error = %e,
                    "webhook_response_body_unreadable"
                );
                String::new()
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        if (200..300).contains(&status) {
            info!(
                event_id = %event.event_id,
                status_code = status,
                duration_ms = duration_ms,
                "webhook_request_complete"
            );
            DispatchOutcome::Delivered(ResponseSummary { status, body })
        } else {
            warn!(
                event_id = %event.event_id,
                user_id = %event.user.id,
                status_code = status,
                duration_ms = duration_ms,
                response_body = %body,
                "webhook_request_rejected"
            );
            DispatchOutcome::Rejected { status, body }
        }
    }
}

fn truncate(mut text: String) -> String {
    if let Some((idx, _)) = text.char_indices().nth(MAX_BODY_CHARS) {
        text.truncate(idx);
    }
    text
}
