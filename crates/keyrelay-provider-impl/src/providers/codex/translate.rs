use std::collections::HashMap;

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

/// Codex's Responses endpoint takes an `input` item list rather than an
/// OpenAI `messages` array; this flattens the normalized request into it.
pub fn request_to_responses(request: &CreateChatCompletionRequestBody) -> Value {
    let mut instructions = Vec::new();
    let mut input = Vec::new();

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
            ChatCompletionRole::System => instructions.push(text),
            ChatCompletionRole::User | ChatCompletionRole::Tool => {
                input.push(json!({
                    "type": "message",
                    "role": "user",
                    "content": text,
                }));
            }
            ChatCompletionRole::Assistant => {
                input.push(json!({
                    "type": "message",
                    "role": "assistant",
                    "content": text,
                }));
            }
        }
    }

    json!({
        "model": request.model,
        "input": input,
        "instructions": instructions.join("\n\n"),
        "stream": request.stream.unwrap_or(false),
        "store": false,
    })
}

/// One translated frame: either a regular OpenAI-shaped chunk, or a
/// dedicated `event: error` frame for a mid-stream failure.
enum Frame {
    Chunk(String),
    Error(String),
}

/// Codex streams `response.*` SSE events; this republishes them as OpenAI
/// `chat.completion.chunk` frames on a fresh channel.
pub fn spawn_stream_translator(mut upstream: ByteStream, model: String) -> ByteStream {
    let (tx, rx) = tokio::sync::mpsc::channel(CHUNK_BUFFER);
    tokio::spawn(async move {
        let mut parser = SseParser::new();
        let completion_id = format!("chatcmpl-{}", unique_suffix());
        let mut index = 0i64;
        let mut tool_calls = HashMap::new();
        let mut saw_tool_call = false;
        while let Some(chunk) = upstream.recv().await {
            for event in parser.push_bytes(&chunk) {
                if let Some(frame) = translate_event(
                    &event,
                    &completion_id,
                    &model,
                    &mut index,
                    &mut tool_calls,
                    &mut saw_tool_call,
                ) && send_frame(&tx, frame).await.is_err()
                {
                    return;
                }
            }
        }
        for event in parser.finish() {
            if let Some(frame) = translate_event(
                &event,
                &completion_id,
                &model,
                &mut index,
                &mut tool_calls,
                &mut saw_tool_call,
            ) {
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
    tool_calls: &mut HashMap<String, i64>,
    saw_tool_call: &mut bool,
) -> Option<Frame> {
    if event.event.as_deref() == Some("error") {
        let payload: Value = serde_json::from_str(&event.data).ok()?;
        return Some(Frame::Error(error_event(error_message(&payload))));
    }

    let event_type = event.event.as_deref()?;
    let payload: Value = serde_json::from_str(&event.data).ok()?;

    if event_type == "response.failed" {
        let message = payload
            .get("response")
            .and_then(|r| r.get("error"))
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
            .unwrap_or("response failed")
            .to_string();
        return Some(Frame::Error(error_event(message)));
    }

    let (delta, finish_reason, usage) = match event_type {
        "response.output_text.delta" | "response.content_part.delta" => {
            let text = payload.get("delta").and_then(|d| d.as_str())?.to_string();
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
        "response.created" => (
            ChatCompletionStreamResponseDelta {
                role: Some(ChatCompletionRole::Assistant),
                content: None,
                tool_calls: None,
            },
            None,
            None,
        ),
        "response.output_item.added" => {
            let item = payload.get("item")?;
            if item.get("type").and_then(|t| t.as_str()) != Some("function_call") {
                return None;
            }
            let item_id = item.get("id").and_then(|v| v.as_str())?.to_string();
            let call_id = item
                .get("call_id")
                .and_then(|v| v.as_str())
                .unwrap_or(&item_id)
                .to_string();
            let name = item.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string();
            let tool_index = tool_calls.len() as i64;
            tool_calls.insert(item_id, tool_index);
            *saw_tool_call = true;
            (
                ChatCompletionStreamResponseDelta {
                    role: None,
                    content: None,
                    tool_calls: Some(vec![ChatCompletionMessageToolCallChunk {
                        index: tool_index,
                        id: Some(call_id),
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
        "response.function_call_arguments.delta" => {
            let item_id = payload.get("item_id").and_then(|v| v.as_str())?;
            let tool_index = *tool_calls.get(item_id)?;
            let delta = payload.get("delta").and_then(|d| d.as_str())?.to_string();
            (
                ChatCompletionStreamResponseDelta {
                    role: None,
                    content: None,
                    tool_calls: Some(vec![ChatCompletionMessageToolCallChunk {
                        index: tool_index,
                        id: None,
                        function: Some(ChatCompletionMessageToolCallChunkFunction {
                            name: None,
                            arguments: Some(delta),
                        }),
                    }]),
                },
                None,
                None,
            )
        }
        // The final joined arguments string was already assembled from the
        // deltas above; codex sends this purely as a completion marker.
        "response.function_call_arguments.done" => return None,
        "response.completed" => {
            let status = payload
                .get("response")
                .and_then(|r| r.get("status"))
                .and_then(|s| s.as_str());
            let finish_reason = if *saw_tool_call {
                ChatCompletionFinishReason::ToolCalls
            } else {
                match status {
                    Some("incomplete") => ChatCompletionFinishReason::Length,
                    _ => ChatCompletionFinishReason::Stop,
                }
            };
            let usage = payload
                .get("response")
                .and_then(|r| r.get("usage"))
                .map(|u| CompletionUsage {
                    prompt_tokens: u.get("input_tokens").and_then(|v| v.as_i64()).unwrap_or(0),
                    completion_tokens: u.get("output_tokens").and_then(|v| v.as_i64()).unwrap_or(0),
                    total_tokens: u.get("total_tokens").and_then(|v| v.as_i64()).unwrap_or(0),
                    cache_read_input_tokens: u
                        .get("input_tokens_details")
                        .and_then(|d| d.get("cached_tokens"))
                        .and_then(|v| v.as_i64()),
                    cache_creation_input_tokens: None,
                });
            (
                ChatCompletionStreamResponseDelta {
                    role: None,
                    content: None,
                    tool_calls: None,
                },
                Some(finish_reason),
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

fn error_message(payload: &Value) -> String {
    payload
        .get("message")
        .and_then(|m| m.as_str())
        .or_else(|| payload.get("error").and_then(|e| e.get("message")).and_then(|m| m.as_str()))
        .unwrap_or("upstream reported a stream error")
        .to_string()
}

fn error_event(message: String) -> String {
    format!(
        "event: error\ndata: {}\n\n",
        json!({"error": {"message": message, "retryable": true}})
    )
}

fn unique_suffix() -> String {
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
        let mut tool_calls = HashMap::new();
        let mut saw_tool_call = false;
        let frame = translate_event(
            &event("response.output_text.delta", json!({"delta": "hi"})),
            "chatcmpl-1",
            "gpt-5-codex",
            &mut index,
            &mut tool_calls,
            &mut saw_tool_call,
        );
        match frame {
            Some(Frame::Chunk(text)) => assert!(text.contains("\"content\":\"hi\"")),
            _ => panic!("expected a chunk frame"),
        }
    }

    #[test]
    fn assembles_a_streamed_tool_call() {
        let mut index = 0;
        let mut tool_calls = HashMap::new();
        let mut saw_tool_call = false;
        let added = translate_event(
            &event(
                "response.output_item.added",
                json!({"item": {"id": "item_1", "type": "function_call", "call_id": "call_1", "name": "lookup"}}),
            ),
            "chatcmpl-1",
            "gpt-5-codex",
            &mut index,
            &mut tool_calls,
            &mut saw_tool_call,
        );
        assert!(matches!(added, Some(Frame::Chunk(_))));
        assert!(saw_tool_call);

        let delta = translate_event(
            &event(
                "response.function_call_arguments.delta",
                json!({"item_id": "item_1", "delta": "{\"q\":1}"}),
            ),
            "chatcmpl-1",
            "gpt-5-codex",
            &mut index,
            &mut tool_calls,
            &mut saw_tool_call,
        );
        match delta {
            Some(Frame::Chunk(text)) => assert!(text.contains("\\\"q\\\":1")),
            _ => panic!("expected a chunk frame"),
        }

        let done = translate_event(
            &event("response.function_call_arguments.done", json!({"item_id": "item_1"})),
            "chatcmpl-1",
            "gpt-5-codex",
            &mut index,
            &mut tool_calls,
            &mut saw_tool_call,
        );
        assert!(done.is_none());
    }

    #[test]
    fn completed_reports_usage_and_tool_call_finish_reason() {
        let mut index = 0;
        let mut tool_calls = HashMap::new();
        tool_calls.insert("item_1".to_string(), 0);
        let mut saw_tool_call = true;
        let frame = translate_event(
            &event(
                "response.completed",
                json!({"response": {"status": "completed", "usage": {"input_tokens": 10, "output_tokens": 5, "total_tokens": 15}}}),
            ),
            "chatcmpl-1",
            "gpt-5-codex",
            &mut index,
            &mut tool_calls,
            &mut saw_tool_call,
        );
        match frame {
            Some(Frame::Chunk(text)) => {
                assert!(text.contains("\"finish_reason\":\"tool_calls\""));
                assert!(text.contains("\"total_tokens\":15"));
            }
            _ => panic!("expected a chunk frame"),
        }
    }

    #[test]
    fn error_event_becomes_a_dedicated_error_frame() {
        let mut index = 0;
        let mut tool_calls = HashMap::new();
        let mut saw_tool_call = false;
        let mut frame_event = event("error", json!({"message": "boom"}));
        frame_event.event = Some("error".to_string());
        let frame = translate_event(
            &frame_event,
            "chatcmpl-1",
            "gpt-5-codex",
            &mut index,
            &mut tool_calls,
            &mut saw_tool_call,
        );
        match frame {
            Some(Frame::Error(text)) => {
                assert!(text.starts_with("event: error\n"));
                assert!(text.contains("boom"));
            }
            _ => panic!("expected an error frame"),
        }
    }
}
