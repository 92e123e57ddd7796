use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::credential::Credential;
use crate::error::TransportError;

pub const LOGIN_PATH: &str = "/token/";
pub const REFRESH_PATH: &str = "/token/refresh/";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthInputError {
    #[error("base url must not be empty")]
    EmptyBaseUrl,
    #[error("base url must use http:// or https:// and include a host")]
    InvalidBaseUrl,
    #[error("username must not be empty")]
    EmptyUsername,
    #[error("password must not be empty")]
    EmptyPassword,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginResponse {
    pub access: String,
    pub refresh: String,
}

impl From<LoginResponse> for Credential {
    fn from(response: LoginResponse) -> Self {
        Self {
            access_token: response.access,
            refresh_token: response.refresh,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub refresh: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub access: String,
    /// Present when the server rotates refresh credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh: Option<String>,
}

impl RefreshResponse {
    #[must_use]
    pub fn access_only(access: impl Into<String>) -> Self {
        Self {
            access: access.into(),
            refresh: None,
        }
    }
}

/// Network side of authentication.
///
/// Implementations must report HTTP answers as [`TransportError::Rejected`] and
/// connection failures or timeouts as [`TransportError::Network`]; the session
/// manager logs the user out on the first and keeps the session on the second.
#[async_trait]
pub trait AuthApiTransport: Send + Sync {
    async fn login(&self, request: LoginRequest) -> Result<Credential, TransportError>;
    async fn refresh(&self, request: RefreshRequest) -> Result<RefreshResponse, TransportError>;
}

/// Usernames are case-sensitive on the server, so only surrounding whitespace goes.
pub fn normalize_username(raw: &str) -> Result<String, AuthInputError> {
    let normalized = raw.trim();
    if normalized.is_empty() {
        return Err(AuthInputError::EmptyUsername);
    }
    Ok(normalized.to_string())
}

pub fn normalize_password(raw: &str) -> Result<String, AuthInputError> {
    let without_newline = raw.trim_end_matches(['\r', '\n']);
    if without_newline.is_empty() {
        return Err(AuthInputError::EmptyPassword);
    }
    Ok(without_newline.to_string())
}

pub fn login_request(username: &str, password: &str) -> Result<LoginRequest, AuthInputError> {
    Ok(LoginRequest {
        username: normalize_username(username)?,
        password: normalize_password(password)?,
    })
}
