use shared::error::{ApiError, ErrorCode};
use thiserror::Error;

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Failure taxonomy of the realtime session layer.
///
/// `Clone` so one refresh outcome can be handed to every coalesced waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),
    #[error("credential rejected by remote party")]
    AuthRejected,
    #[error("credential refresh denied: {0}")]
    RefreshDenied(String),
    #[error("timed out after {0} ms")]
    Timeout(u64),
    #[error("live connection is not established")]
    NotConnected,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("request rejected: {0}")]
    Remote(String),
    #[error("no active session")]
    SessionClosed,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("session store failure: {0}")]
    Storage(String),
}

impl ClientError {
    pub fn is_auth_rejected(&self) -> bool {
        matches!(self, ClientError::AuthRejected)
    }

    /// Failures that come from a stale local reference and should invalidate
    /// the owning collection.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }
}

impl From<ApiError> for ClientError {
    fn from(value: ApiError) -> Self {
        match value.code {
            ErrorCode::Unauthorized => ClientError::AuthRejected,
            ErrorCode::Forbidden => ClientError::Forbidden(value.message),
            ErrorCode::NotFound => ClientError::NotFound(value.message),
            ErrorCode::Validation => ClientError::Validation(value.message),
            ErrorCode::Conflict => ClientError::Conflict(value.message),
            ErrorCode::RateLimited | ErrorCode::Internal => ClientError::Remote(value.message),
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(value: serde_json::Error) -> Self {
        ClientError::Protocol(value.to_string())
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            return ClientError::Timeout(0);
        }
        if value.is_decode() {
            return ClientError::Protocol(value.to_string());
        }
        ClientError::NetworkUnavailable(value.to_string())
    }
}
