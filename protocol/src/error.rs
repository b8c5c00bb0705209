use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Outcome of a failed call against the remote identity service.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "message", rename_all = "snake_case")]
pub enum GaiaError {
    /// The request was dropped before it could complete, either by the
    /// network stack or because a queued log-out superseded it.
    #[error("request canceled")]
    RequestCanceled,

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The local credential was rejected or is missing.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("service error: {0}")]
    ServiceError(String),

    #[error("unexpected service response: {0}")]
    UnexpectedServiceResponse(String),
}

impl GaiaError {
    /// Transient failures are retried with backoff; everything else is final.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GaiaError::RequestCanceled
                | GaiaError::ConnectionFailed(_)
                | GaiaError::ServiceUnavailable(_)
        )
    }
}
