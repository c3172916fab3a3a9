//! SSE (Server-Sent Events) streaming for token-by-token responses.
//!
//! Converts a channel of GenerationEvents into an SSE stream compatible
//! with the OpenAI streaming format.

use axum::response::sse::Event;
use futures::stream::Stream;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::inference::engine::GenerationEvent;
use crate::server::unix_now;

/// Which OpenAI chunk format to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Chat,
    Completion,
}

/// Streaming chat completion chunk (OpenAI-compatible).
#[derive(Debug, Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Serialize)]
pub struct ChunkChoice {
    pub index: usize,
    pub delta: ChunkDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Streaming text completion chunk.
#[derive(Debug, Serialize)]
pub struct CompletionChunk {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<CompletionChunkChoice>,
}

#[derive(Debug, Serialize)]
pub struct CompletionChunkChoice {
    pub index: usize,
    pub text: String,
    pub finish_reason: Option<String>,
}

/// Convert a generation event receiver into an SSE stream.
pub fn generation_to_sse_stream(
    rx: mpsc::Receiver<GenerationEvent>,
    request_id: String,
    model: String,
    kind: StreamKind,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    let stream = ReceiverStream::new(rx);
    let mut first = true;

    stream
        .map(move |event| {
            let (content, finish_reason) = match event {
                GenerationEvent::Token { text, .. } => (Some(text), None),
                GenerationEvent::Done { finish_reason, .. } => {
                    (None, Some(finish_reason.to_string()))
                }
                GenerationEvent::Error(e) => {
                    (Some(format!("[Error: {e}]")), Some("error".to_string()))
                }
            };

            let data = match kind {
                StreamKind::Chat => {
                    // First chunk includes the role.
                    let role = if first {
                        first = false;
                        Some("assistant".to_string())
                    } else {
                        None
                    };
                    serde_json::to_string(&ChatCompletionChunk {
                        id: format!("chatcmpl-{request_id}"),
                        object: "chat.completion.chunk".to_string(),
                        created: unix_now(),
                        model: model.clone(),
                        choices: vec![ChunkChoice {
                            index: 0,
                            delta: ChunkDelta { role, content },
                            finish_reason,
                        }],
                    })
                }
                StreamKind::Completion => serde_json::to_string(&CompletionChunk {
                    id: format!("cmpl-{request_id}"),
                    object: "text_completion".to_string(),
                    created: unix_now(),
                    model: model.clone(),
                    choices: vec![CompletionChunkChoice {
                        index: 0,
                        text: content.unwrap_or_default(),
                        finish_reason,
                    }],
                }),
            };

            Ok(Event::default().data(data.unwrap_or_default()))
        })
        // Append the [DONE] sentinel after all events.
        .chain(tokio_stream::once(Ok(Event::default().data("[DONE]"))))
}
