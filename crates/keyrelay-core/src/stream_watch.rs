//! Wraps an already OpenAI-chunk-shaped SSE byte stream so the executor can
//! observe real usage/error information once the stream finishes, instead of
//! treating every streaming response as a blind success the moment the first
//! byte arrives.

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use keyrelay_protocol::openai::CreateChatCompletionStreamResponse;
use keyrelay_protocol::{SseEvent, SseParser};
use keyrelay_provider_core::provider::ByteStream;
use keyrelay_provider_core::Usage;

#[derive(Debug, Clone)]
pub enum StreamOutcome {
    Usage(Usage),
    Error { message: String },
}

/// Re-injects the already-consumed first chunk, then republishes the rest of
/// `upstream` unchanged on a fresh channel while scanning each SSE frame for
/// a terminal `usage` object or an `error` event. The returned `oneshot`
/// fires exactly once, after the upstream channel closes.
pub fn watch_with_first(first: Bytes, mut upstream: ByteStream) -> (ByteStream, oneshot::Receiver<StreamOutcome>) {
    let (tx, rx) = mpsc::channel(16);
    let (outcome_tx, outcome_rx) = oneshot::channel();
    tokio::spawn(async move {
        let mut parser = SseParser::new();
        let mut usage = None;
        let mut error = None;

        inspect_chunk(&first, &mut parser, &mut usage, &mut error);
        if tx.send(first).await.is_err() {
            return;
        }

        while let Some(chunk) = upstream.recv().await {
            inspect_chunk(&chunk, &mut parser, &mut usage, &mut error);
            if tx.send(chunk).await.is_err() {
                return;
            }
        }

        for event in parser.finish() {
            inspect_event(&event, &mut usage, &mut error);
        }

        let outcome = match error {
            Some(message) => StreamOutcome::Error { message },
            None => StreamOutcome::Usage(usage.unwrap_or_default()),
        };
        let _ = outcome_tx.send(outcome);
    });
    (rx, outcome_rx)
}

fn inspect_chunk(chunk: &Bytes, parser: &mut SseParser, usage: &mut Option<Usage>, error: &mut Option<String>) {
    for event in parser.push_bytes(chunk) {
        inspect_event(&event, usage, error);
    }
}

fn inspect_event(event: &SseEvent, usage: &mut Option<Usage>, error: &mut Option<String>) {
    if event.data == "[DONE]" {
        return;
    }
    if event.event.as_deref() == Some("error") {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&event.data) {
            let message = value
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .or_else(|| value.get("message").and_then(|m| m.as_str()))
                .unwrap_or("upstream reported a stream error")
                .to_string();
            *error = Some(message);
        }
        return;
    }
    if let Ok(frame) = serde_json::from_str::<CreateChatCompletionStreamResponse>(&event.data)
        && let Some(u) = frame.usage
    {
        *usage = Some(Usage {
            prompt_tokens: u.prompt_tokens.max(0) as u64,
            completion_tokens: u.completion_tokens.max(0) as u64,
            total_tokens: u.total_tokens.max(0) as u64,
            thinking_tokens: None,
            cache_read_tokens: u.cache_read_input_tokens.map(|v| v.max(0) as u64),
            cache_write_tokens: u.cache_creation_input_tokens.map(|v| v.max(0) as u64),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn extracts_usage_from_the_terminal_chunk() {
        let (upstream_tx, upstream_rx) = mpsc::channel(4);
        let first = Bytes::from_static(
            b"data: {\"id\":\"1\",\"object\":\"chat.completion.chunk\",\"created\":0,\"model\":\"m\",\"choices\":[]}\n\n",
        );
        let done = Bytes::from_static(b"data: [DONE]\n\n");
        let terminal = Bytes::from(
            serde_json::json!({
                "id": "1",
                "object": "chat.completion.chunk",
                "created": 0,
                "model": "m",
                "choices": [],
                "usage": {"prompt_tokens": 3, "completion_tokens": 4, "total_tokens": 7},
            })
            .to_string(),
        );
        let mut frame = Vec::new();
        frame.extend_from_slice(b"data: ");
        frame.extend_from_slice(&terminal);
        frame.extend_from_slice(b"\n\n");

        upstream_tx.send(Bytes::from(frame)).await.unwrap();
        upstream_tx.send(done).await.unwrap();
        drop(upstream_tx);

        let (mut watched, outcome_rx) = watch_with_first(first, upstream_rx);
        while watched.recv().await.is_some() {}
        match outcome_rx.await.unwrap() {
            StreamOutcome::Usage(usage) => {
                assert_eq!(usage.prompt_tokens, 3);
                assert_eq!(usage.completion_tokens, 4);
                assert_eq!(usage.total_tokens, 7);
            }
            StreamOutcome::Error { message } => panic!("unexpected error outcome: {message}"),
        }
    }

    #[tokio::test]
    async fn surfaces_a_mid_stream_error_event() {
        let (upstream_tx, upstream_rx) = mpsc::channel(4);
        let first = Bytes::from_static(b"data: {\"id\":\"1\",\"object\":\"x\",\"created\":0,\"model\":\"m\",\"choices\":[]}\n\n");
        let error_frame = Bytes::from(format!(
            "event: error\ndata: {}\n\n",
            serde_json::json!({"error": {"message": "upstream disconnected", "retryable": true}})
        ));

        upstream_tx.send(error_frame).await.unwrap();
        drop(upstream_tx);

        let (mut watched, outcome_rx) = watch_with_first(first, upstream_rx);
        while watched.recv().await.is_some() {}
        match outcome_rx.await.unwrap() {
            StreamOutcome::Error { message } => assert_eq!(message, "upstream disconnected"),
            StreamOutcome::Usage(_) => panic!("expected an error outcome"),
        }
    }
}
