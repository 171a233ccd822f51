use std::error::Error;
use std::fmt;
use std::time::Duration;

pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Clone)]
pub enum ProviderError {
    Unsupported(&'static str),
    InvalidConfig(String),
    MissingCredentialField(&'static str),
    /// The upstream answered with an HTTP status carrying refresh/auth
    /// semantics (401/403/429/5xx). `retry_after` is populated when the
    /// response carried a `Retry-After` header.
    UpstreamStatus {
        status: u16,
        retry_after: Option<Duration>,
        message: String,
    },
    Other(String),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Unsupported(what) => write!(f, "unsupported: {what}"),
            ProviderError::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            ProviderError::MissingCredentialField(field) => {
                write!(f, "missing credential field: {field}")
            }
            ProviderError::UpstreamStatus { status, message, .. } => {
                write!(f, "upstream responded {status}: {message}")
            }
            ProviderError::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl Error for ProviderError {}
