//! Message types for the `user.created` event stream.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::error::IntakeError;

/// Topic exchange the user service publishes to.
pub const USER_EXCHANGE: &str = "user.exchange";

/// Routing key for account creation events.
pub const USER_CREATED_ROUTING_KEY: &str = "user.created";

/// Durable queue bound to the exchange for this service.
pub const USER_CREATED_QUEUE: &str = "notification-service-user-created";

/// A "user created" event as published upstream.
///
/// Wire format: `{"eventId": "...", "data": {"id": ..., "firstName": "...", "createdAt": "..."}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    /// Identity of the upstream domain event; the idempotency key.
    #[serde(rename = "eventId")]
    pub event_id: String,
    /// The user the notification is about.
    #[serde(rename = "data")]
    pub user: UserPayload,
}

/// User data carried by the event and forwarded verbatim to the webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPayload {
    pub id: UserId,
    #[serde(rename = "firstName")]
    pub first_name: String,
    #[serde(rename = "createdAt")]
    pub created_at: CreatedAt,
    /// Any other fields the publisher included.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// User identifier exactly as the publisher sent it (string, integer or any
/// other JSON value).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub serde_json::Value);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            serde_json::Value::String(s) => f.write_str(s),
            other => write!(f, "{}", other),
        }
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        UserId(serde_json::Value::String(id.to_string()))
    }
}

impl From<u64> for UserId {
    fn from(id: u64) -> Self {
        UserId(serde_json::Value::from(id))
    }
}

/// Account creation time.
///
/// Keeps the publisher's string for forwarding and the parsed instant for
/// computing the fire time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedAt {
    raw: String,
    instant: DateTime<Utc>,
}

impl CreatedAt {
    pub fn instant(&self) -> DateTime<Utc> {
        self.instant
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for CreatedAt {
    type Err = chrono::ParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let instant = raw.parse::<DateTime<Utc>>()?;
        Ok(Self {
            raw: raw.to_string(),
            instant,
        })
    }
}

impl From<DateTime<Utc>> for CreatedAt {
    fn from(instant: DateTime<Utc>) -> Self {
        Self {
            raw: instant.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            instant,
        }
    }
}

impl fmt::Display for CreatedAt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Serialize for CreatedAt {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for CreatedAt {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

impl NotificationEvent {
    /// Decode a raw message body.
    pub fn from_slice(body: &[u8]) -> Result<Self, IntakeError> {
        let event: NotificationEvent = serde_json::from_slice(body)?;
        if event.event_id.trim().is_empty() {
            return Err(IntakeError::MissingEventId);
        }
        Ok(event)
    }
}
