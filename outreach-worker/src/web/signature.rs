//! Request authentication for the intake endpoints.
//!
//! Mailgun signs event webhooks with HMAC-SHA256 over `timestamp + token`,
//! keyed by the account's webhook signing key. Campaign submissions carry a
//! static bearer token.

use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Why a Mailgun signature was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing signature field: {0}")]
    MissingField(&'static str),

    #[error("timestamp is not unix seconds: {0:?}")]
    BadTimestamp(String),

    #[error("timestamp is {age_seconds}s from now, limit {max_age_seconds}s")]
    Stale { age_seconds: u64, max_age_seconds: u64 },

    #[error("signature does not match")]
    Mismatch,
}

/// Signed fields of a Mailgun webhook.
#[derive(Debug, Clone, Copy)]
pub struct MailgunSignature<'a> {
    pub timestamp: &'a str,
    pub token: &'a str,
    pub signature: &'a str,
}

impl MailgunSignature<'_> {
    /// Verify against `signing_key`, rejecting timestamps further than
    /// `max_age_seconds` from `now` in either direction.
    pub fn verify_at(
        &self,
        signing_key: &str,
        max_age_seconds: u64,
        now: u64,
    ) -> Result<(), SignatureError> {
        for (name, value) in [
            ("timestamp", self.timestamp),
            ("token", self.token),
            ("signature", self.signature),
        ] {
            if value.is_empty() {
                return Err(SignatureError::MissingField(name));
            }
        }

        let sent_at: u64 = self
            .timestamp
            .parse()
            .map_err(|_| SignatureError::BadTimestamp(self.timestamp.to_string()))?;

        let age_seconds = now.abs_diff(sent_at);
        if age_seconds > max_age_seconds {
            return Err(SignatureError::Stale {
                age_seconds,
                max_age_seconds,
            });
        }

        let expected = hex_digest(signing_key, self.timestamp, self.token);
        if constant_time_eq(
            expected.as_bytes(),
            self.signature.to_ascii_lowercase().as_bytes(),
        ) {
            Ok(())
        } else {
            Err(SignatureError::Mismatch)
        }
    }

    /// Verify against the current system clock.
    pub fn verify(&self, signing_key: &str, max_age_seconds: u64) -> Result<(), SignatureError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.verify_at(signing_key, max_age_seconds, now)
    }
}

fn hex_digest(signing_key: &str, timestamp: &str, token: &str) -> String {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(signing_key.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(timestamp.as_bytes());
    mac.update(token.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// The configured signing key, if verification is turned on.
pub fn signing_key(configured: &Option<String>) -> Option<&str> {
    configured
        .as_deref()
        .map(str::trim)
        .filter(|k| !k.is_empty())
}

/// Check an `Authorization` header value against the configured API token.
///
/// Accepts `Bearer <token>` with a case-insensitive scheme.
pub fn verify_bearer_token(header: Option<&str>, expected: &str) -> bool {
    let Some((scheme, token)) = header.and_then(|h| h.trim().split_once(' ')) else {
        return false;
    };
    !expected.is_empty()
        && scheme.eq_ignore_ascii_case("bearer")
        && constant_time_eq(token.trim().as_bytes(), expected.as_bytes())
}

/// Compare without short-circuiting on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
