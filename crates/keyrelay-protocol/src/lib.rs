//! Wire types for the OpenAI-compatible surface and a Server-Sent Events parser
//! for translating non-OpenAI provider streams.

pub mod openai;
pub mod sse;

pub use sse::{SseEvent, SseParser};
