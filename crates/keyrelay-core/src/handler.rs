use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use keyrelay_protocol::openai::Model;
use keyrelay_provider_core::provider::UpstreamBody;
use keyrelay_provider_core::{OperationKind, UpstreamCtx};

use crate::classify::classify_chat_completion;
use crate::error::ProxyError;
use crate::executor::{ExecuteRequest, execute_completion};
use crate::state::CoreState;

pub async fn chat_completions(
    State(state): State<Arc<CoreState>>,
    body: Bytes,
) -> Response {
    let classified = match classify_chat_completion(body) {
        Ok(c) => c,
        Err(err) => return err.into_response(),
    };
    let trace_id = Uuid::new_v4().to_string();
    let operation = if classified.is_stream {
        OperationKind::ChatCompletionsStream
    } else {
        OperationKind::ChatCompletions
    };

    let global_timeout = Duration::from_secs(state.global.load().global_timeout_secs);
    let req = ExecuteRequest {
        provider: &classified.provider,
        model: classified.model.clone(),
        body: &classified.body,
        deadline: Instant::now() + global_timeout,
        trace_id: Some(trace_id),
        operation,
    };

    let result = execute_completion(&state, req).await;
    match result {
        Ok(resp) => upstream_response_into_axum(resp),
        Err(err) => err.into_response(),
    }
}

fn upstream_response_into_axum(resp: keyrelay_provider_core::provider::UpstreamHttpResponse) -> Response {
    let mut builder = Response::builder().status(resp.status);
    for (k, v) in &resp.headers {
        builder = builder.header(k, v);
    }
    match resp.body {
        UpstreamBody::Bytes(bytes) => builder.body(Body::from(bytes)).unwrap_or_else(|_| {
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to build response").into_response()
        }),
        UpstreamBody::Stream(rx) => {
            let stream = ReceiverStream::new(rx).map(Ok::<_, std::io::Error>);
            builder
                .body(Body::from_stream(stream))
                .unwrap_or_else(|_| (StatusCode::INTERNAL_SERVER_ERROR, "failed to build response").into_response())
        }
    }
}

pub async fn list_models(State(state): State<Arc<CoreState>>) -> Response {
    let mut models = Vec::new();
    for name in state.provider_configs.keys() {
        let Some(provider) = state.registry.get(name) else { continue };
        let catalog = state.credentials.for_provider(name).await;
        let Some(credential) = catalog.first() else { continue };
        let config = state.provider_config(name);
        let ctx = UpstreamCtx {
            trace_id: None,
            provider: name.clone(),
            credential_id: Some(credential.stable_id.clone()),
            operation: OperationKind::ListModels,
            internal: true,
            attempt_no: 0,
        };
        if let Ok(listed) = provider.list_models(&ctx, &config, credential).await {
            models.extend(listed);
        }
    }
    Json(ModelsResponse {
        object: "list",
        data: models,
    })
    .into_response()
}

#[derive(serde::Serialize)]
struct ModelsResponse {
    object: &'static str,
    data: Vec<Model>,
}

pub async fn healthz() -> Response {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" }))).into_response()
}

pub async fn stats(State(state): State<Arc<CoreState>>, headers: HeaderMap) -> Response {
    if let Err(err) = require_admin(&state, &headers) {
        return err.into_response();
    }
    let value = state.usage.get_stats(None).await;
    Json(value).into_response()
}

pub async fn admin_refresh(State(state): State<Arc<CoreState>>, headers: HeaderMap) -> Response {
    if let Err(err) = require_admin(&state, &headers) {
        return err.into_response();
    }
    for credential in state.credentials.all().await {
        if credential.is_oauth() {
            state.oauth.enqueue_refresh(&credential.provider, &credential.stable_id, true).await;
        }
    }
    (StatusCode::ACCEPTED, Json(serde_json::json!({ "status": "refresh queued" }))).into_response()
}

fn require_admin(state: &CoreState, headers: &HeaderMap) -> Result<(), ProxyError> {
    let provided = extract_bearer(headers).ok_or_else(|| ProxyError::unauthorized("missing admin key"))?;
    let expected = &state.global.load().admin_key_hash;
    let hashed = blake3::hash(provided.as_bytes()).to_hex().to_string();
    if &hashed != expected {
        return Err(ProxyError::unauthorized("invalid admin key"));
    }
    Ok(())
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let value = headers.get("authorization")?.to_str().ok()?;
    value.trim().strip_prefix("Bearer ").map(|s| s.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer abc123".parse().unwrap());
        assert_eq!(extract_bearer(&headers), Some("abc123".to_string()));
    }

    #[test]
    fn missing_authorization_header_yields_none() {
        let headers = HeaderMap::new();
        assert_eq!(extract_bearer(&headers), None);
    }

    #[test]
    fn non_bearer_scheme_yields_none() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Basic abc123".parse().unwrap());
        assert_eq!(extract_bearer(&headers), None);
    }
}
