//! HMAC signing of outbound notification requests.
//!
//! When a signing secret is configured every request carries:
//! - `X-Notification-Timestamp`: Unix epoch seconds at send time
//! - `X-Notification-Signature`: hex HMAC-SHA256 of `"{timestamp}.{body}"`
//!
//! Receivers recompute the digest with [`verify_signature`].

use hmac::digest::InvalidLength;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

pub const TIMESTAMP_HEADER: &str = "X-Notification-Timestamp";
pub const SIGNATURE_HEADER: &str = "X-Notification-Signature";

/// Compute the hex signature for a request body.
pub fn sign(secret: &str, timestamp: u64, body: &[u8]) -> Result<String, InvalidLength> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Current Unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Verify a signed notification request.
///
/// Returns `false` for empty inputs, non-numeric or stale timestamps and
/// signature mismatches.
pub fn verify_signature(
    secret: &str,
    timestamp: &str,
    body: &[u8],
    signature: &str,
    max_age_seconds: u64,
) -> bool {
    if secret.is_empty() || timestamp.is_empty() || signature.is_empty() {
        warn!(
            has_secret = !secret.is_empty(),
            has_timestamp = !timestamp.is_empty(),
            has_signature = !signature.is_empty(),
            "notification_signature_missing_fields"
        );
        return false;
    }

    let sent_at: u64 = match timestamp.parse() {
        Ok(t) => t,
        Err(_) => {
            warn!(timestamp = %timestamp, "notification_signature_invalid_timestamp");
            return false;
        }
    };

    let age = unix_now().abs_diff(sent_at);
    if age > max_age_seconds {
        warn!(
            age_seconds = age,
            max_age_seconds = max_age_seconds,
            "notification_signature_stale"
        );
        return false;
    }

    let expected = match sign(secret, sent_at, body) {
        Ok(s) => s,
        Err(_) => {
            warn!("notification_signature_invalid_key");
            return false;
        }
    };
    let valid = constant_time_compare(&expected, signature);
    if !valid {
        warn!(
            expected_length = expected.len(),
            actual_length = signature.len(),
            "notification_signature_mismatch"
        );
    }
    valid
}

/// Constant-time string comparison.
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}
