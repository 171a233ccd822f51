use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http::StatusCode;

use keyrelay_provider_core::provider::Classification;

#[derive(Debug)]
pub struct ProxyError {
    pub status: StatusCode,
    pub body: Bytes,
}

impl ProxyError {
    pub fn bad_request(message: impl Into<Bytes>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: message.into(),
        }
    }

    pub fn not_found(message: impl Into<Bytes>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            body: message.into(),
        }
    }

    pub fn method_not_allowed(message: impl Into<Bytes>) -> Self {
        Self {
            status: StatusCode::METHOD_NOT_ALLOWED,
            body: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<Bytes>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            body: message.into(),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status, self.body).into_response()
    }
}

/// Surfaced classification plus infra failures, carrying its own HTTP
/// mapping so the boundary (handler.rs) never has to pattern-match
/// `Classification` directly.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("authentication with upstream provider failed")]
    AuthFailure,
    #[error("upstream quota exhausted")]
    QuotaExhausted,
    #[error("rate limited by upstream provider")]
    RateLimit,
    #[error("no credential currently available for this request")]
    NoAvailableCredentials,
    #[error("transient upstream failure")]
    Transient,
    #[error("unrecoverable upstream failure")]
    Fatal,
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl EngineError {
    /// Ranks classifications by how actionable they are to the caller
    /// (most-informative wins when a deadline expires with several
    /// candidates already attempted).
    fn rank(&self) -> u8 {
        match self {
            EngineError::Fatal => 0,
            EngineError::InvalidRequest(_) => 1,
            EngineError::QuotaExhausted => 2,
            EngineError::RateLimit => 3,
            EngineError::AuthFailure => 4,
            EngineError::Transient => 5,
            EngineError::NoAvailableCredentials => 6,
            EngineError::UnknownProvider(_) => 7,
            EngineError::Io(_) | EngineError::Serde(_) => 8,
        }
    }

    /// Keeps whichever of `self`/`other` is more informative per the
    /// priority order `Fatal > InvalidRequest > QuotaExhausted > RateLimit >
    /// AuthFailure > Transient > NoAvailableCredentials`.
    pub fn most_informative(self, other: EngineError) -> EngineError {
        if other.rank() < self.rank() { other } else { self }
    }

    pub fn from_classification(classification: &Classification) -> Option<EngineError> {
        match classification {
            Classification::Success { .. } => None,
            Classification::RateLimit { .. } => Some(EngineError::RateLimit),
            Classification::QuotaExhausted { .. } => Some(EngineError::QuotaExhausted),
            Classification::AuthFailure { .. } => Some(EngineError::AuthFailure),
            Classification::InvalidRequest => Some(EngineError::InvalidRequest("rejected by upstream".into())),
            Classification::Transient { .. } => Some(EngineError::Transient),
            Classification::Fatal => Some(EngineError::Fatal),
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = match &self {
            EngineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            EngineError::AuthFailure => StatusCode::UNAUTHORIZED,
            EngineError::QuotaExhausted | EngineError::RateLimit => StatusCode::TOO_MANY_REQUESTS,
            EngineError::NoAvailableCredentials => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Transient => StatusCode::BAD_GATEWAY,
            EngineError::UnknownProvider(_) => StatusCode::NOT_FOUND,
            EngineError::Fatal | EngineError::Io(_) | EngineError::Serde(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = serde_json::json!({ "error": { "message": self.to_string() } }).to_string();
        (status, body).into_response()
    }
}
