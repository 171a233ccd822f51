use bytes::Bytes;
use serde_json::{Value, json};

use keyrelay_protocol::openai::stream::{
    ChatCompletionChunkObjectType, ChatCompletionStreamChoice, CreateChatCompletionStreamResponse,
};
use keyrelay_protocol::openai::types::{
    ChatCompletionContent, ChatCompletionFinishReason, ChatCompletionMessageToolCallChunk,
    ChatCompletionMessageToolCallChunkFunction, ChatCompletionRole, ChatCompletionStreamResponseDelta,
};
use keyrelay_protocol::openai::{CompletionUsage, CreateChatCompletionRequestBody};
use keyrelay_protocol::{SseEvent, SseParser};
use keyrelay_provider_core::provider::ByteStream;

const CHUNK_BUFFER: usize = 16;

/// Anthropic Messages API does not share a wire shape with OpenAI chat
/// completions; this builds the native request body from the normalized one.
pub fn request_to_anthropic(request: &CreateChatCompletionRequestBody) -> Value {
    let mut system_parts = Vec::new();
    let mut messages = Vec::new();

    for message in &request.messages {
        let text = match &message.content {
            Some(ChatCompletionContent::Text(text)) => text.clone(),
            Some(ChatCompletionContent::Parts(parts)) => parts
                .iter()
                .filter_map(|part| match part {
                    keyrelay_protocol::openai::types::ChatCompletionContentPart::Text { text } => {
                        Some(text.as_str())
                    }
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
            None => String::new(),
        };

        match message.role {
            ChatCompletionRole::System => system_parts.push(text),
            ChatCompletionRole::User | ChatCompletionRole::Tool => {
                messages.push(json!({ "role": "user", "content": text }));
            }
            ChatCompletionRole::Assistant => {
                messages.push(json!({ "role": "assistant", "content": text }));
            }
        }
    }

    let mut body = json!({
        "model": request.model,
        "messages": messages,
        "max_tokens": request.max_tokens.unwrap_or(4096),
        "stream": request.stream.unwrap_or(false),
    });
    if !system_parts.is_empty() {
        body["system"] = Value::String(system_parts.join("\n\n"));
    }
    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(top_p) = request.top_p {
        body["top_p"] = json!(top_p);
    }
    body
}

enum Frame {
    Chunk(String),
    Error(String),
}

/// Tracks the one piece of state that spans multiple Anthropic SSE events:
/// `message_start` reports `input_tokens` up front, `message_delta` reports
/// `output_tokens` only at the very end, so the combined usage can only be
/// assembled once both have been seen.
#[derive(Default)]
struct ClaudeStreamState {
    input_tokens: i64,
}

/// Consumes a raw Anthropic SSE byte stream and republishes OpenAI-shaped
/// `chat.completion.chunk` SSE frames on a fresh channel.
pub fn spawn_stream_translator(mut upstream: ByteStream, model: String) -> ByteStream {
    let (tx, rx) = tokio::sync::mpsc::channel(CHUNK_BUFFER);
    tokio::spawn(async move {
        let mut parser = SseParser::new();
        let completion_id = format!("chatcmpl-{}", uuid_like());
        let mut index = 0i64;
        let mut state = ClaudeStreamState::default();
        while let Some(chunk) = upstream.recv().await {
            for event in parser.push_bytes(&chunk) {
                if let Some(frame) = translate_event(&event, &completion_id, &model, &mut index, &mut state)
                    && send_frame(&tx, frame).await.is_err()
                {
                    return;
                }
            }
        }
        for event in parser.finish() {
            if let Some(frame) = translate_event(&event, &completion_id, &model, &mut index, &mut state) {
                let _ = send_frame(&tx, frame).await;
            }
        }
        let _ = tx
            .send(Bytes::from(
                CreateChatCompletionStreamResponse::done_event(),
            ))
            .await;
    });
    rx
}

async fn send_frame(
    tx: &tokio::sync::mpsc::Sender<Bytes>,
    frame: Frame,
) -> Result<(), tokio::sync::mpsc::error::SendError<Bytes>> {
    let text = match frame {
        Frame::Chunk(text) => text,
        Frame::Error(text) => text,
    };
    tx.send(Bytes::from(text)).await
}

fn translate_event(
    event: &SseEvent,
    completion_id: &str,
    model: &str,
    index: &mut i64,
    state: &mut ClaudeStreamState,
) -> Option<Frame> {
    if event.event.as_deref() == Some("error") {
        let payload: Value = serde_json::from_str(&event.data).ok()?;
        let message = payload
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
            .unwrap_or("upstream reported a stream error")
            .to_string();
        let retryable = payload
            .get("error")
            .and_then(|e| e.get("type"))
            .and_then(|t| t.as_str())
            .is_some_and(|t| t == "overloaded_error" || t == "api_error");
        return Some(Frame::Error(format!(
            "event: error\ndata: {}\n\n",
            json!({"error": {"message": message, "retryable": retryable}})
        )));
    }

    let event_type = event.event.as_deref()?;
    let payload: Value = serde_json::from_str(&event.data).ok()?;

    let (delta, finish_reason, usage) = match event_type {
        "message_start" => {
            state.input_tokens = payload
                .get("message")
                .and_then(|m| m.get("usage"))
                .and_then(|u| u.get("input_tokens"))
                .and_then(|v| v.as_i64())
                .unwrap_or(0);
            (
                ChatCompletionStreamResponseDelta {
                    role: Some(ChatCompletionRole::Assistant),
                    content: None,
                    tool_calls: None,
                },
                None,
                None,
            )
        }
        "content_block_start" => {
            let block = payload.get("content_block")?;
            if block.get("type").and_then(|t| t.as_str()) != Some("tool_use") {
                return None;
            }
            let tool_index = payload.get("index").and_then(|v| v.as_i64()).unwrap_or(0);
            let id = block.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string();
            let name = block.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string();
            (
                ChatCompletionStreamResponseDelta {
                    role: None,
                    content: None,
                    tool_calls: Some(vec![ChatCompletionMessageToolCallChunk {
                        index: tool_index,
                        id: Some(id),
                        function: Some(ChatCompletionMessageToolCallChunkFunction {
                            name: Some(name),
                            arguments: Some(String::new()),
                        }),
                    }]),
                },
                None,
                None,
            )
        }
        "content_block_delta" => {
            let block_delta = payload.get("delta")?;
            match block_delta.get("type").and_then(|t| t.as_str()) {
                Some("input_json_delta") => {
                    let tool_index = payload.get("index").and_then(|v| v.as_i64()).unwrap_or(0);
                    let partial = block_delta
                        .get("partial_json")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string();
                    (
                        ChatCompletionStreamResponseDelta {
                            role: None,
                            content: None,
                            tool_calls: Some(vec![ChatCompletionMessageToolCallChunk {
                                index: tool_index,
                                id: None,
                                function: Some(ChatCompletionMessageToolCallChunkFunction {
                                    name: None,
                                    arguments: Some(partial),
                                }),
                            }]),
                        },
                        None,
                        None,
                    )
                }
                _ => {
                    let text = block_delta.get("text").and_then(|t| t.as_str())?.to_string();
                    (
                        ChatCompletionStreamResponseDelta {
                            role: None,
                            content: Some(text),
                            tool_calls: None,
                        },
                        None,
                        None,
                    )
                }
            }
        }
        // Signals the end of one content block; nothing to forward since
        // each delta event already carried its own chunk.
        "content_block_stop" => return None,
        "message_delta" => {
            let stop_reason = payload
                .get("delta")
                .and_then(|d| d.get("stop_reason"))
                .and_then(|r| r.as_str());
            let finish = stop_reason.map(map_stop_reason);
            let output_tokens = payload
                .get("usage")
                .and_then(|u| u.get("output_tokens"))
                .and_then(|v| v.as_i64())
                .unwrap_or(0);
            let usage = Some(CompletionUsage {
                prompt_tokens: state.input_tokens,
                completion_tokens: output_tokens,
                total_tokens: state.input_tokens + output_tokens,
                cache_read_input_tokens: None,
                cache_creation_input_tokens: None,
            });
            (
                ChatCompletionStreamResponseDelta {
                    role: None,
                    content: None,
                    tool_calls: None,
                },
                finish,
                usage,
            )
        }
        _ => return None,
    };

    let chunk = CreateChatCompletionStreamResponse {
        id: completion_id.to_string(),
        object: ChatCompletionChunkObjectType::ChatCompletionChunk,
        created: unix_seconds(),
        model: model.to_string(),
        choices: vec![ChatCompletionStreamChoice {
            index: *index,
            delta,
            finish_reason,
        }],
        usage,
    };
    *index += 1;
    Some(Frame::Chunk(chunk.to_sse_event()))
}

fn map_stop_reason(reason: &str) -> ChatCompletionFinishReason {
    match reason {
        "max_tokens" => ChatCompletionFinishReason::Length,
        "tool_use" => ChatCompletionFinishReason::ToolCalls,
        _ => ChatCompletionFinishReason::Stop,
    }
}

fn uuid_like() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{nanos:x}")
}

fn unix_seconds() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_type: &str, data: serde_json::Value) -> SseEvent {
        SseEvent {
            event: Some(event_type.to_string()),
            data: data.to_string(),
        }
    }

    #[test]
    fn translates_a_text_delta() {
        let mut index = 0;
        let mut state = ClaudeStreamState::default();
        let frame = translate_event(
            &event(
                "content_block_delta",
                json!({"index": 0, "delta": {"type": "text_delta", "text": "hi"}}),
            ),
            "chatcmpl-1",
            "claude-3-5-sonnet",
            &mut index,
            &mut state,
        );
        match frame {
            Some(Frame::Chunk(text)) => assert!(text.contains("\"content\":\"hi\"")),
            _ => panic!("expected a chunk frame"),
        }
    }

    #[test]
    fn assembles_a_streamed_tool_call() {
        let mut index = 0;
        let mut state = ClaudeStreamState::default();
        let started = translate_event(
            &event(
                "content_block_start",
                json!({"index": 0, "content_block": {"type": "tool_use", "id": "toolu_1", "name": "lookup"}}),
            ),
            "chatcmpl-1",
            "claude-3-5-sonnet",
            &mut index,
            &mut state,
        );
        assert!(matches!(started, Some(Frame::Chunk(_))));

        let delta = translate_event(
            &event(
                "content_block_delta",
                json!({"index": 0, "delta": {"type": "input_json_delta", "partial_json": "{\"q\":1}"}}),
            ),
            "chatcmpl-1",
            "claude-3-5-sonnet",
            &mut index,
            &mut state,
        );
        match delta {
            Some(Frame::Chunk(text)) => assert!(text.contains("\\\"q\\\":1")),
            _ => panic!("expected a chunk frame"),
        }

        let stop = translate_event(
            &event("content_block_stop", json!({"index": 0})),
            "chatcmpl-1",
            "claude-3-5-sonnet",
            &mut index,
            &mut state,
        );
        assert!(stop.is_none());
    }

    #[test]
    fn message_delta_reports_combined_usage() {
        let mut index = 0;
        let mut state = ClaudeStreamState { input_tokens: 20 };
        let frame = translate_event(
            &event(
                "message_delta",
                json!({"delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 7}}),
            ),
            "chatcmpl-1",
            "claude-3-5-sonnet",
            &mut index,
            &mut state,
        );
        match frame {
            Some(Frame::Chunk(text)) => {
                assert!(text.contains("\"finish_reason\":\"stop\""));
                assert!(text.contains("\"total_tokens\":27"));
            }
            _ => panic!("expected a chunk frame"),
        }
    }

    #[test]
    fn error_event_becomes_a_dedicated_error_frame() {
        let mut index = 0;
        let mut state = ClaudeStreamState::default();
        let frame = translate_event(
            &event("error", json!({"error": {"type": "overloaded_error", "message": "overloaded"}})),
            "chatcmpl-1",
            "claude-3-5-sonnet",
            &mut index,
            &mut state,
        );
        match frame {
            Some(Frame::Error(text)) => {
                assert!(text.starts_with("event: error\n"));
                assert!(text.contains("overloaded"));
                assert!(text.contains("\"retryable\":true"));
            }
            _ => panic!("expected an error frame"),
        }
    }
}
