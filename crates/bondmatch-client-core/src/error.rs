//! Error taxonomy shared by the session layer and its collaborators.

/// Failure reported by a network collaborator (login, refresh, or an API call).
///
/// `Rejected` means the server answered with a non-success status; `Network`
/// covers connection failures and timeouts where no answer arrived.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("request rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("network failure: {0}")]
    Network(String),
    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl TransportError {
    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Rejected { status: 401, .. })
    }

    /// An explicit answer from the server that the credential is not acceptable.
    #[must_use]
    pub fn is_credential_rejection(&self) -> bool {
        matches!(self, Self::Rejected { status: 400 | 401 | 403, .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("persisted storage is unavailable: {0}")]
    Unavailable(String),
    #[error("failed to write persisted storage: {0}")]
    Write(String),
    #[error("failed to serialize persisted value: {0}")]
    Serialize(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("credential is malformed")]
    MalformedCredential,
    #[error("credential has expired")]
    CredentialExpired,
    #[error("refresh credential was rejected: {message}")]
    RefreshRejected { message: String },
    #[error("transport failure: {message}")]
    TransportFailure { message: String },
    #[error("authorization denied after retry: {message}")]
    AuthorizationDenied { message: String },
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("invalid credentials: {message}")]
    InvalidCredentials { message: String },
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("request failed with status {status}: {message}")]
    Remote { status: u16, message: String },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SessionError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedCredential => "malformed_credential",
            Self::CredentialExpired => "credential_expired",
            Self::RefreshRejected { .. } => "refresh_rejected",
            Self::TransportFailure { .. } => "transport_failure",
            Self::AuthorizationDenied { .. } => "authorization_denied",
            Self::NotAuthenticated => "not_authenticated",
            Self::InvalidCredentials { .. } => "invalid_credentials",
            Self::InvalidInput { .. } => "invalid_input",
            Self::Remote { .. } => "remote_error",
            Self::Storage(_) => "storage_error",
        }
    }

    /// Terminal authentication errors send the user back to the login entry point.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::CredentialExpired
                | Self::MalformedCredential
                | Self::RefreshRejected { .. }
                | Self::AuthorizationDenied { .. }
                | Self::NotAuthenticated
        )
    }

    /// The whole operation may be retried without touching session state.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransportFailure { .. } => true,
            Self::Remote { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    pub(crate) fn from_transport(error: TransportError) -> Self {
        match error {
            TransportError::Rejected { status, message } => Self::Remote { status, message },
            TransportError::Network(message) | TransportError::Decode(message) => {
                Self::TransportFailure { message }
            }
        }
    }
}
