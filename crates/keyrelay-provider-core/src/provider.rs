use async_trait::async_trait;
use bytes::Bytes;
use std::time::{Duration, SystemTime};

use keyrelay_protocol::openai::{CreateChatCompletionRequestBody, Model};

use crate::config::{DispatchTable, OperationKind, ProviderConfig};
use crate::credential::{Credential, CredentialId, Scope};
use crate::errors::{ProviderError, ProviderResult};
use crate::headers::{Headers, header_get};
use crate::usage::Usage;

pub type ByteStream = tokio::sync::mpsc::Receiver<Bytes>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }

    pub fn parse(method: &str) -> Option<Self> {
        if method.eq_ignore_ascii_case("GET") {
            Some(HttpMethod::Get)
        } else if method.eq_ignore_ascii_case("POST") {
            Some(HttpMethod::Post)
        } else if method.eq_ignore_ascii_case("PUT") {
            Some(HttpMethod::Put)
        } else if method.eq_ignore_ascii_case("PATCH") {
            Some(HttpMethod::Patch)
        } else if method.eq_ignore_ascii_case("DELETE") {
            Some(HttpMethod::Delete)
        } else {
            None
        }
    }
}

#[derive(Debug)]
pub enum UpstreamBody {
    Bytes(Bytes),
    Stream(ByteStream),
}

#[derive(Debug)]
pub struct UpstreamHttpResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: UpstreamBody,
}

#[derive(Debug, Clone)]
pub struct UpstreamHttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
    pub is_stream: bool,
}

#[derive(Debug, Clone)]
pub struct UpstreamCtx {
    pub trace_id: Option<String>,
    pub provider: String,
    pub credential_id: Option<CredentialId>,
    pub operation: OperationKind,
    pub internal: bool,
    pub attempt_no: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum UpstreamTransportErrorKind {
    Timeout,
    ReadTimeout,
    Connect,
    Dns,
    Tls,
    Other,
}

#[derive(Debug, Clone)]
pub enum UpstreamFailure {
    /// Transport-level failures (no HTTP response).
    Transport {
        kind: UpstreamTransportErrorKind,
        message: String,
    },
    /// HTTP error response captured as bytes (usually non-2xx).
    Http {
        status: u16,
        headers: Headers,
        body: Bytes,
    },
    /// The plugin couldn't even build a request (bad config, wrong credential
    /// variant). Always classified as `Fatal` — retrying elsewhere won't help.
    Build(String),
}

/// Sends an already-built request over the wire. Implemented by a concrete
/// HTTP client in a higher layer; plugins depend only on this trait so
/// `keyrelay-provider-impl` never performs IO directly.
pub trait UpstreamClient: Send + Sync {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>,
    >;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationMode {
    Balanced,
    Sequential,
}

/// Outcome of a single `plugin.execute` attempt, as seen by the request
/// executor. `Success`'s usage is best-effort: providers that don't
/// report token counts leave fields at their defaults.
#[derive(Debug, Clone)]
pub enum Classification {
    Success {
        usage: Usage,
    },
    RateLimit {
        retry_after: Duration,
        scope: Scope,
    },
    QuotaExhausted {
        until: Option<SystemTime>,
        scope: Scope,
    },
    AuthFailure {
        needs_reauth: bool,
    },
    InvalidRequest,
    Transient {
        retryable: bool,
    },
    Fatal,
}

const RATE_LIMIT_FALLBACK_SECS: u64 = 30;

/// Default HTTP-status classification shared by plugins that don't need
/// provider-specific overrides (e.g. a quota-exhaustion body shape on 200).
pub fn default_classify_http_status(status: u16, headers: &Headers) -> Classification {
    match status {
        200..=299 => Classification::Success {
            usage: Usage::default(),
        },
        404 => Classification::InvalidRequest,
        429 => {
            let retry_after = parse_retry_after(headers)
                .unwrap_or_else(|| Duration::from_secs(RATE_LIMIT_FALLBACK_SECS));
            Classification::RateLimit {
                retry_after,
                scope: Scope::All,
            }
        }
        401 | 403 => Classification::AuthFailure { needs_reauth: true },
        400..=499 => Classification::InvalidRequest,
        500..=599 => Classification::Transient { retryable: true },
        _ => Classification::Fatal,
    }
}

pub fn default_classify_transport(kind: UpstreamTransportErrorKind) -> Classification {
    match kind {
        UpstreamTransportErrorKind::Timeout
        | UpstreamTransportErrorKind::ReadTimeout
        | UpstreamTransportErrorKind::Connect
        | UpstreamTransportErrorKind::Dns
        | UpstreamTransportErrorKind::Tls => Classification::Transient { retryable: true },
        UpstreamTransportErrorKind::Other => Classification::Fatal,
    }
}

fn parse_retry_after(headers: &Headers) -> Option<Duration> {
    let value = header_get(headers, "retry-after")?;
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let secs = value.parse::<u64>().ok()?;
    Some(Duration::from_secs(secs))
}

#[async_trait]
pub trait UpstreamProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Tells the executor whether a request shape is handled natively or
    /// needs the streaming translator. Actual translation happens
    /// inside `execute`.
    fn dispatch_table(&self, config: &ProviderConfig) -> DispatchTable;

    async fn list_models(
        &self,
        ctx: &UpstreamCtx,
        config: &ProviderConfig,
        credential: &Credential,
    ) -> ProviderResult<Vec<Model>>;

    /// Performs the wire call. Natively-OpenAI providers forward the body
    /// near-verbatim; others translate to their native shape and, for
    /// streaming, translate the native stream back to OpenAI chunks.
    /// `client` is the only IO surface plugins get; they never open sockets.
    async fn execute(
        &self,
        ctx: &UpstreamCtx,
        config: &ProviderConfig,
        credential: &Credential,
        client: &dyn UpstreamClient,
        request: &CreateChatCompletionRequestBody,
    ) -> Result<UpstreamHttpResponse, UpstreamFailure>;

    /// OAuth only.
    async fn refresh_token(
        &self,
        _ctx: &UpstreamCtx,
        _config: &ProviderConfig,
        _credential: &Credential,
        _client: &dyn UpstreamClient,
    ) -> ProviderResult<Credential> {
        Err(ProviderError::Unsupported("refresh_token"))
    }

    /// OAuth only. Spawns a local loopback callback server, prints the
    /// authorize URL for the operator to open, and exchanges code+PKCE for
    /// tokens.
    async fn interactive_reauth(
        &self,
        _ctx: &UpstreamCtx,
        _config: &ProviderConfig,
        _credential: &Credential,
        _client: &dyn UpstreamClient,
    ) -> ProviderResult<Credential> {
        Err(ProviderError::Unsupported("interactive_reauth"))
    }

    fn classify_http(&self, status: u16, headers: &Headers, _body: &Bytes) -> Classification {
        default_classify_http_status(status, headers)
    }

    fn classify_transport(&self, kind: UpstreamTransportErrorKind) -> Classification {
        default_classify_transport(kind)
    }

    /// Dispatches a raw `execute` outcome to `classify_http`/`classify_transport`.
    fn classify(&self, outcome: &Result<UpstreamHttpResponse, UpstreamFailure>) -> Classification {
        match outcome {
            Ok(resp) => {
                let body_for_quota = match &resp.body {
                    UpstreamBody::Bytes(bytes) => bytes.clone(),
                    UpstreamBody::Stream(_) => Bytes::new(),
                };
                self.classify_http(resp.status, &resp.headers, &body_for_quota)
            }
            Err(UpstreamFailure::Http {
                status,
                headers,
                body,
            }) => self.classify_http(*status, headers, body),
            Err(UpstreamFailure::Transport { kind, .. }) => self.classify_transport(*kind),
            Err(UpstreamFailure::Build(_)) => Classification::Fatal,
        }
    }

    /// Used to set a precise cooldown end instead of a provider-default window.
    fn parse_quota_reset(&self, _headers: &Headers, _body: &Bytes) -> Option<SystemTime> {
        None
    }

    fn default_rotation_mode(&self) -> RotationMode {
        RotationMode::Balanced
    }

    /// `model -> quota_group`. Models absent from the map use their own name as scope.
    fn model_quota_groups(&self) -> &'static [(&'static str, &'static str)] {
        &[]
    }

    /// `tier -> priority multiplier`, consulted by the selector's effective-max-concurrent calc.
    fn tier_priorities(&self) -> &'static [(&'static str, i32)] {
        &[]
    }

    /// Extra multiplier applied to `effective_max_concurrent` under
    /// `RotationMode::Sequential`, where only one credential is normally
    /// active at a time and a lone fallback key may need more headroom.
    fn sequential_fallback_multiplier(&self) -> f64 {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_rate_limit_with_retry_after() {
        let headers: Headers = vec![("Retry-After".to_string(), "12".to_string())];
        match default_classify_http_status(429, &headers) {
            Classification::RateLimit { retry_after, .. } => {
                assert_eq!(retry_after, Duration::from_secs(12));
            }
            other => panic!("expected RateLimit, got {other:?}"),
        }
    }

    #[test]
    fn classifies_rate_limit_without_header_falls_back() {
        match default_classify_http_status(429, &[]) {
            Classification::RateLimit { retry_after, .. } => {
                assert_eq!(retry_after, Duration::from_secs(RATE_LIMIT_FALLBACK_SECS));
            }
            other => panic!("expected RateLimit, got {other:?}"),
        }
    }

    #[test]
    fn classifies_auth_errors() {
        assert!(matches!(
            default_classify_http_status(401, &[]),
            Classification::AuthFailure { needs_reauth: true }
        ));
        assert!(matches!(
            default_classify_http_status(403, &[]),
            Classification::AuthFailure { needs_reauth: true }
        ));
    }

    #[test]
    fn classifies_5xx_as_retryable_transient() {
        assert!(matches!(
            default_classify_http_status(503, &[]),
            Classification::Transient { retryable: true }
        ));
    }
}
