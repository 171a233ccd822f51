//! Parses an inbound `/v1/chat/completions` body enough to route it: which
//! provider (from the model name prefix or an explicit header) and whether
//! the caller asked for a stream.

use bytes::Bytes;

use keyrelay_protocol::openai::CreateChatCompletionRequestBody;

use crate::error::ProxyError;

pub struct ClassifiedRequest {
    pub provider: String,
    pub model: String,
    pub is_stream: bool,
    pub body: CreateChatCompletionRequestBody,
}

/// `gpt-4o` -> openai, `claude-3-5-sonnet` -> claude, `codex-*` -> codex.
/// Anything else defaults to openai, since that's the wire shape every
/// request already arrives in.
fn provider_for_model(model: &str) -> String {
    if model.starts_with("claude") {
        "claude".to_string()
    } else if model.starts_with("codex") || model.starts_with("gpt-5-codex") {
        "codex".to_string()
    } else {
        "openai".to_string()
    }
}

pub fn classify_chat_completion(body: Bytes) -> Result<ClassifiedRequest, ProxyError> {
    let parsed: CreateChatCompletionRequestBody = serde_json::from_slice(&body)
        .map_err(|err| ProxyError::bad_request(format!("invalid request body: {err}")))?;
    if parsed.model.is_empty() {
        return Err(ProxyError::bad_request("\"model\" is required"));
    }
    let provider = provider_for_model(&parsed.model);
    let is_stream = parsed.stream.unwrap_or(false);
    Ok(ClassifiedRequest {
        provider,
        model: parsed.model.clone(),
        is_stream,
        body: parsed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_by_model_prefix() {
        assert_eq!(provider_for_model("gpt-4o"), "openai");
        assert_eq!(provider_for_model("claude-3-5-sonnet"), "claude");
        assert_eq!(provider_for_model("codex-mini"), "codex");
    }

    #[test]
    fn rejects_missing_model() {
        let body = Bytes::from_static(br#"{"messages":[]}"#);
        assert!(classify_chat_completion(body).is_err());
    }

    #[test]
    fn accepts_valid_body() {
        let body = Bytes::from_static(
            br#"{"model":"gpt-4o","messages":[{"role":"user","content":"hi"}],"stream":true}"#,
        );
        let classified = classify_chat_completion(body).unwrap();
        assert_eq!(classified.provider, "openai");
        assert!(classified.is_stream);
    }
}
