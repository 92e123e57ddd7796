use crate::auth::AuthInputError;

pub const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:8000/api";
pub const ENV_API_BASE_URL: &str = "BONDMATCH_API_BASE_URL";
pub const ENV_API_BASE_URL_LEGACY: &str = "BONDMATCH_BASE_URL";
pub const ENV_REQUEST_TIMEOUT_MS: &str = "BONDMATCH_REQUEST_TIMEOUT_MS";
pub const ENV_REQUEST_ATTEMPTS: &str = "BONDMATCH_REQUEST_ATTEMPTS";
pub const ENV_AUTH_RETRY_BUDGET: &str = "BONDMATCH_AUTH_RETRY_BUDGET";
pub const CONFIG_SOURCE_DEFAULT: &str = "default";

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
pub const MIN_REQUEST_TIMEOUT_MS: u64 = 250;
pub const DEFAULT_REQUEST_ATTEMPTS: usize = 2;
pub const DEFAULT_RETRY_BUDGET: u8 = 1;
pub const MAX_RETRY_BUDGET: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub request_timeout_ms: u64,
    /// Transport-level attempts for idempotent GETs.
    pub request_attempts: usize,
    /// Re-sends allowed after an authorization failure.
    pub retry_budget: u8,
}

impl ClientConfig {
    #[must_use]
    pub fn new(api_base_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            request_attempts: DEFAULT_REQUEST_ATTEMPTS,
            retry_budget: DEFAULT_RETRY_BUDGET,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(DEFAULT_API_BASE_URL)
    }
}

/// Where each resolved setting came from, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedClientConfig {
    pub config: ClientConfig,
    pub base_url_source: String,
    pub timeout_source: String,
    pub attempts_source: String,
    pub retry_budget_source: String,
}

pub fn resolve_client_config() -> Result<ResolvedClientConfig, AuthInputError> {
    let (api_base_url, base_url_source) = resolve_api_base_url()?;

    let (request_timeout_ms, timeout_source) =
        resolve_number(ENV_REQUEST_TIMEOUT_MS, DEFAULT_REQUEST_TIMEOUT_MS);
    let (request_attempts, attempts_source) =
        resolve_number(ENV_REQUEST_ATTEMPTS, DEFAULT_REQUEST_ATTEMPTS);
    let (retry_budget, retry_budget_source) =
        resolve_number(ENV_AUTH_RETRY_BUDGET, DEFAULT_RETRY_BUDGET);

    Ok(ResolvedClientConfig {
        config: ClientConfig {
            api_base_url,
            request_timeout_ms: request_timeout_ms.max(MIN_REQUEST_TIMEOUT_MS),
            request_attempts: request_attempts.max(1),
            retry_budget: retry_budget.min(MAX_RETRY_BUDGET),
        },
        base_url_source: base_url_source.to_string(),
        timeout_source,
        attempts_source,
        retry_budget_source,
    })
}

pub fn resolve_api_base_url() -> Result<(String, &'static str), AuthInputError> {
    if let Some(base_url) = env_non_empty(ENV_API_BASE_URL) {
        return normalize_base_url(&base_url).map(|normalized| (normalized, ENV_API_BASE_URL));
    }
    if let Some(base_url) = env_non_empty(ENV_API_BASE_URL_LEGACY) {
        return normalize_base_url(&base_url)
            .map(|normalized| (normalized, ENV_API_BASE_URL_LEGACY));
    }
    normalize_base_url(DEFAULT_API_BASE_URL).map(|normalized| (normalized, CONFIG_SOURCE_DEFAULT))
}

pub fn normalize_base_url(raw: &str) -> Result<String, AuthInputError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(AuthInputError::EmptyBaseUrl);
    }
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(AuthInputError::InvalidBaseUrl);
    }
    let Some((_, remainder)) = trimmed.split_once("://") else {
        return Err(AuthInputError::InvalidBaseUrl);
    };
    if remainder.trim().is_empty() || remainder.starts_with('/') {
        return Err(AuthInputError::InvalidBaseUrl);
    }
    Ok(trimmed.to_string())
}

fn resolve_number<T>(key: &str, default: T) -> (T, String)
where
    T: std::str::FromStr,
{
    match env_non_empty(key) {
        Some(raw) => match raw.parse::<T>() {
            Ok(value) => (value, key.to_string()),
            Err(_) => (default, format!("{key}:invalid({raw})->{CONFIG_SOURCE_DEFAULT}")),
        },
        None => (default, CONFIG_SOURCE_DEFAULT.to_string()),
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
}
