#![cfg_attr(test, allow(clippy::expect_used))]

//! reqwest-backed transport for the bondmatch session core.

use std::time::Duration;

use async_trait::async_trait;
use bondmatch_client_core::auth::{
    AuthApiTransport, AuthInputError, LOGIN_PATH, LoginRequest, LoginResponse, REFRESH_PATH,
    RefreshRequest, RefreshResponse,
};
use bondmatch_client_core::authorized::{
    ApiRequest, ApiResponse, HttpMethod, RequestSender, error_message_from_body,
};
use bondmatch_client_core::config::{ClientConfig, MIN_REQUEST_TIMEOUT_MS, normalize_base_url};
use bondmatch_client_core::{Credential, TransportError};
use reqwest::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use uuid::Uuid;


const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Error)]
pub enum HttpTransportError {
    #[error(transparent)]
    BaseUrl(#[from] AuthInputError),
    #[error("http_client_build_failed:{message}")]
    Build { message: String },
}

/// One HTTP client for both authentication endpoints and authorized API calls.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    base_url: String,
    timeout: Duration,
    request_attempts: usize,
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self, HttpTransportError> {
        let base_url = normalize_base_url(&config.api_base_url)?;
        let http = reqwest::Client::builder()
            .build()
            .map_err(|error| HttpTransportError::Build {
                message: error.to_string(),
            })?;
        Ok(Self {
            base_url,
            timeout: Duration::from_millis(config.request_timeout_ms.max(MIN_REQUEST_TIMEOUT_MS)),
            request_attempts: config.request_attempts.max(1),
            http,
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[must_use]
    pub fn endpoint(&self, path: &str) -> Option<String> {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed.starts_with('/') {
            Some(format!("{}{}", self.base_url, trimmed))
        } else {
            Some(format!("{}/{}", self.base_url, trimmed))
        }
    }

    /// Unauthenticated JSON POST, sent exactly once.
    async fn post_json<Req, Res>(&self, path: &str, payload: &Req) -> Result<Res, TransportError>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        let url = self.endpoint(path).ok_or_else(invalid_path)?;
        let response = self
            .http
            .post(url.as_str())
            .header(REQUEST_ID_HEADER, request_id())
            .timeout(self.timeout)
            .json(payload)
            .send()
            .await
            .map_err(|error| TransportError::Network(error.to_string()))?;
        decode_json_response(response).await
    }

    /// Sends `request`, re-sending idempotent methods on network failure.
    async fn dispatch(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        let url = self.endpoint(&request.path).ok_or_else(invalid_path)?;
        let attempts = if request.method.is_idempotent() {
            self.request_attempts
        } else {
            1
        };
        let mut last_error: Option<String> = None;

        for attempt in 0..attempts {
            let mut builder = self
                .http
                .request(reqwest_method(request.method), url.as_str())
                .header(REQUEST_ID_HEADER, request_id())
                .timeout(self.timeout);
            if !request.query.is_empty() {
                builder = builder.query(&request.query);
            }
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(body) = &request.body {
                builder = builder.json(body);
            }

            match builder.send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let body = response
                        .text()
                        .await
                        .map_err(|error| TransportError::Network(error.to_string()))?;
                    return Ok(ApiResponse { status, body });
                }
                Err(error) => {
                    tracing::debug!(
                        attempt = attempt + 1,
                        attempts,
                        method = request.method.as_str(),
                        path = %request.path,
                        error = %error,
                        "request attempt failed"
                    );
                    last_error = Some(error.to_string());
                }
            }
        }

        Err(TransportError::Network(
            last_error.unwrap_or_else(|| "unknown".to_string()),
        ))
    }
}

#[async_trait]
impl AuthApiTransport for HttpTransport {
    async fn login(&self, request: LoginRequest) -> Result<Credential, TransportError> {
        let response: LoginResponse = self.post_json(LOGIN_PATH, &request).await?;
        Ok(Credential::from(response))
    }

    async fn refresh(&self, request: RefreshRequest) -> Result<RefreshResponse, TransportError> {
        self.post_json(REFRESH_PATH, &request).await
    }
}

#[async_trait]
impl RequestSender for HttpTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        self.dispatch(&request).await
    }
}

/// Maps a non-success answer to [`TransportError::Rejected`], keeping the
/// server's `error`/`detail` message when one is present.
#[must_use]
pub fn format_http_error(status: StatusCode, body: &[u8]) -> TransportError {
    let text = String::from_utf8_lossy(body);
    let message = error_message_from_body(&text)
        .or_else(|| non_empty_string(&text))
        .unwrap_or_else(|| "<empty>".to_string());
    TransportError::Rejected {
        status: status.as_u16(),
        message,
    }
}

fn reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Delete => reqwest::Method::DELETE,
    }
}

fn request_id() -> String {
    format!("req_{}", Uuid::new_v4().simple())
}

fn invalid_path() -> TransportError {
    TransportError::Network("request path must not be empty".to_string())
}

async fn decode_json_response<T>(response: reqwest::Response) -> Result<T, TransportError>
where
    T: DeserializeOwned,
{
    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|error| TransportError::Network(error.to_string()))?;

    if !status.is_success() {
        return Err(format_http_error(status, &bytes));
    }

    serde_json::from_slice::<T>(&bytes).map_err(|error| TransportError::Decode(error.to_string()))
}

fn non_empty_string(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
