//! Authenticated API calls with one transparent credential refresh on 401.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::config::DEFAULT_RETRY_BUDGET;
use crate::error::{SessionError, TransportError};
use crate::session::SessionManager;

const AUTHORIZATION_HEADER: &str = "authorization";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }

    /// Safe to re-send after a network failure.
    #[must_use]
    pub fn is_idempotent(self) -> bool {
        matches!(self, Self::Get | Self::Put | Self::Delete)
    }
}

/// A call relative to the API base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: HttpMethod,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    #[must_use]
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, path)
    }

    #[must_use]
    pub fn post(path: impl Into<String>, body: serde_json::Value) -> Self {
        let mut request = Self::new(HttpMethod::Post, path);
        request.body = Some(body);
        request
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// The bearer credential attached to this request, if any.
    #[must_use]
    pub fn bearer_token(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(AUTHORIZATION_HEADER))
            .and_then(|(_, value)| value.strip_prefix("Bearer "))
    }

    fn authorized_with(&self, access_token: &str) -> Self {
        let mut request = self.clone();
        request
            .headers
            .retain(|(name, _)| !name.eq_ignore_ascii_case(AUTHORIZATION_HEADER));
        request.headers.push((
            AUTHORIZATION_HEADER.to_string(),
            format!("Bearer {access_token}"),
        ));
        request
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        self.status == 401
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, SessionError> {
        serde_json::from_str(&self.body).map_err(|error| SessionError::TransportFailure {
            message: format!("failed to decode response: {error}"),
        })
    }

    /// Server-provided reason from `{"error": ..}` or `{"detail": ..}` bodies.
    #[must_use]
    pub fn error_message(&self) -> String {
        error_message_from_body(&self.body)
            .unwrap_or_else(|| format!("request failed with status {}", self.status))
    }

    pub fn into_result(self) -> Result<Self, SessionError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(SessionError::Remote {
                status: self.status,
                message: self.error_message(),
            })
        }
    }
}

#[must_use]
pub fn error_message_from_body(body: &str) -> Option<String> {
    let value = serde_json::from_str::<serde_json::Value>(body).ok()?;
    ["error", "detail", "message"]
        .iter()
        .find_map(|field| value.get(field).and_then(serde_json::Value::as_str))
        .map(str::trim)
        .filter(|message| !message.is_empty())
        .map(str::to_string)
}

/// Sends one request. Any HTTP answer, including 4xx/5xx, is an [`ApiResponse`];
/// only a missing answer is a [`TransportError`].
#[async_trait]
pub trait RequestSender: Send + Sync {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError>;
}

#[derive(Clone)]
pub struct AuthorizedClient {
    session: SessionManager,
    sender: Arc<dyn RequestSender>,
    retry_budget: u8,
}

impl AuthorizedClient {
    #[must_use]
    pub fn new(session: SessionManager, sender: Arc<dyn RequestSender>) -> Self {
        Self {
            session,
            sender,
            retry_budget: DEFAULT_RETRY_BUDGET,
        }
    }

    #[must_use]
    pub fn with_retry_budget(mut self, retry_budget: u8) -> Self {
        self.retry_budget = retry_budget;
        self
    }

    #[must_use]
    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub async fn call_with_auth(&self, request: ApiRequest) -> Result<ApiResponse, SessionError> {
        self.call_with_retry_budget(request, self.retry_budget)
            .await
    }

    /// Attaches the current access credential and sends `request`. A 401 while
    /// budget remains forces a refresh and re-sends; a 401 after that is
    /// reported as [`SessionError::AuthorizationDenied`] without ending the session.
    pub async fn call_with_retry_budget(
        &self,
        request: ApiRequest,
        retry_budget: u8,
    ) -> Result<ApiResponse, SessionError> {
        let mut access_token = match self.session.valid_access_token().await {
            Ok(token) => token,
            Err(SessionError::CredentialExpired | SessionError::MalformedCredential) => {
                return Err(SessionError::NotAuthenticated);
            }
            Err(error) => return Err(error),
        };

        let mut retries_left = retry_budget;
        loop {
            let response = self
                .sender
                .send(request.authorized_with(&access_token))
                .await
                .map_err(SessionError::from_transport)?;
            if !response.is_unauthorized() {
                return Ok(response);
            }
            if retries_left == 0 {
                tracing::warn!(
                    method = request.method.as_str(),
                    path = %request.path,
                    "authorization denied after refresh"
                );
                return Err(SessionError::AuthorizationDenied {
                    message: response.error_message(),
                });
            }
            retries_left -= 1;
            tracing::debug!(
                method = request.method.as_str(),
                path = %request.path,
                "access credential rejected; refreshing before retry"
            );
            access_token = self.session.force_refresh(&access_token).await?;
        }
    }

    /// Authorized call whose successful body is decoded as `T`; non-2xx answers
    /// become [`SessionError::Remote`].
    pub async fn send_json<T: DeserializeOwned>(
        &self,
        request: ApiRequest,
    ) -> Result<T, SessionError> {
        self.call_with_auth(request).await?.into_result()?.json()
    }
}
