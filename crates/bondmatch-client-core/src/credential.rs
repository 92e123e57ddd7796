//! Bearer credential decoding.
//!
//! Tokens are three dot-delimited base64url segments (`header.payload.signature`).
//! Only the payload is read; signatures are the server's business. Decoding never
//! touches the network and never panics: anything that does not decode is treated
//! as an expired credential by [`is_token_expired`].

use std::sync::Mutex;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

const UNSIGNED_HEADER: &str = r#"{"alg":"none","typ":"JWT"}"#;
const UNSIGNED_SIGNATURE: &str = "unsigned";
const TOKEN_PREVIEW_CHARS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Claims {
    pub subject_id: Option<String>,
    pub subject_name: Option<String>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
    #[error("expected 3 token segments, found {found}")]
    SegmentCount { found: usize },
    #[error("payload segment is not base64url: {0}")]
    Encoding(String),
    #[error("payload segment is not a claims object: {0}")]
    Payload(String),
    #[error("claims do not carry a usable expiry")]
    MissingExpiry,
}

#[derive(Debug, Deserialize)]
struct RawClaims {
    #[serde(default)]
    sub: Option<serde_json::Value>,
    #[serde(default)]
    user_id: Option<serde_json::Value>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    exp: Option<serde_json::Value>,
}

pub fn decode(token: &str) -> Result<Claims, CredentialError> {
    let segments = token.trim().split('.').collect::<Vec<_>>();
    let [_, payload, _] = segments.as_slice() else {
        return Err(CredentialError::SegmentCount {
            found: segments.len(),
        });
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|error| CredentialError::Encoding(error.to_string()))?;
    let raw: RawClaims = serde_json::from_slice(&bytes)
        .map_err(|error| CredentialError::Payload(error.to_string()))?;

    let expires_at = raw
        .exp
        .as_ref()
        .and_then(expiry_seconds)
        .and_then(|seconds| Utc.timestamp_opt(seconds, 0).single())
        .ok_or(CredentialError::MissingExpiry)?;

    Ok(Claims {
        subject_id: raw
            .sub
            .as_ref()
            .or(raw.user_id.as_ref())
            .and_then(subject_string),
        subject_name: raw.username.or(raw.name).filter(|value| !value.is_empty()),
        expires_at,
    })
}

#[must_use]
pub fn is_expired(claims: &Claims, now: DateTime<Utc>) -> bool {
    now >= claims.expires_at
}

/// Malformed tokens count as expired.
#[must_use]
pub fn is_token_expired(token: &str, now: DateTime<Utc>) -> bool {
    decode(token).map_or(true, |claims| is_expired(&claims, now))
}

/// Claims of a token that is still usable at `now`.
pub(crate) fn usable_claims(token: &str, now: DateTime<Utc>) -> Option<Claims> {
    decode(token)
        .ok()
        .filter(|claims| !is_expired(claims, now))
}

/// Builds an unsigned token carrying `claims`, for fixtures and fakes that need
/// tokens with known contents.
#[must_use]
pub fn encode_unsigned(claims: &Claims) -> String {
    let mut payload = serde_json::Map::new();
    if let Some(subject_id) = &claims.subject_id {
        payload.insert("sub".to_string(), subject_id.clone().into());
    }
    if let Some(subject_name) = &claims.subject_name {
        payload.insert("username".to_string(), subject_name.clone().into());
    }
    payload.insert("exp".to_string(), claims.expires_at.timestamp().into());

    let payload = serde_json::Value::Object(payload).to_string();
    format!(
        "{}.{}.{}",
        URL_SAFE_NO_PAD.encode(UNSIGNED_HEADER),
        URL_SAFE_NO_PAD.encode(payload),
        UNSIGNED_SIGNATURE
    )
}

/// Short prefix of a token that is safe to put in logs.
#[must_use]
pub fn token_preview(token: &str) -> String {
    let preview = token.chars().take(TOKEN_PREVIEW_CHARS).collect::<String>();
    format!("{preview}...")
}

fn expiry_seconds(value: &serde_json::Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|seconds| seconds.floor() as i64))
}

fn subject_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(text) if !text.is_empty() => Some(text.clone()),
        serde_json::Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
