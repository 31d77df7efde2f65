//! Gemini `generateContent` responses → OpenAI chat-completion envelopes,
//! for both the one-shot body and the chunked stream.

use dproxy_protocol::gemini::generate_content::{Candidate, GenerateContentResponse};
use dproxy_protocol::gemini::types::{FinishReason as GeminiFinishReason, UsageMetadata};
use dproxy_protocol::openai::chat::{
    AssistantMessage, CHAT_COMPLETION_CHUNK_OBJECT, CHAT_COMPLETION_OBJECT, ChatChoice,
    ChatCompletionChunk, ChatCompletionResponse, ChunkChoice, ChunkDelta, FinishReason,
    FunctionCallChunk, FunctionCallPayload, ToolCall, ToolCallChunk, ToolCallKind, Usage,
};
use rand::Rng;
use rand::distr::Alphanumeric;

pub fn transform_response(
    model: &str,
    response: &GenerateContentResponse,
) -> ChatCompletionResponse {
    let choices = response
        .candidates
        .iter()
        .enumerate()
        .map(|(idx, candidate)| map_candidate(idx as i64, candidate))
        .collect();

    ChatCompletionResponse {
        id: generate_completion_id(),
        object: CHAT_COMPLETION_OBJECT.to_string(),
        created: now_unix(),
        model: model.to_string(),
        choices,
        usage: response.usage_metadata.as_ref().map(map_usage),
        extra: serde_json::Map::new(),
    }
}

fn map_candidate(fallback_index: i64, candidate: &Candidate) -> ChatChoice {
    let mut tool_calls = Vec::new();
    let mut text = String::new();
    let mut reasoning = String::new();

    if let Some(content) = &candidate.content {
        text = content.visible_text();
        reasoning = content.thought_text();
        for part in &content.parts {
            if let Some(call) = &part.function_call {
                tool_calls.push(ToolCall {
                    id: call
                        .id
                        .clone()
                        .unwrap_or_else(|| format!("call_{}", tool_calls.len())),
                    kind: ToolCallKind::Function,
                    function: FunctionCallPayload {
                        name: call.name.clone(),
                        arguments: serialize_arguments(call.args.as_ref()),
                    },
                });
            }
        }
    }

    let content = if tool_calls.is_empty() {
        Some(text)
    } else {
        None
    };

    ChatChoice {
        index: candidate.index.unwrap_or(fallback_index),
        message: AssistantMessage {
            role: "assistant".to_string(),
            content,
            reasoning_content: if reasoning.is_empty() {
                None
            } else {
                Some(reasoning)
            },
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
        },
        finish_reason: candidate.finish_reason.map(map_finish_reason),
    }
}

pub fn map_finish_reason(reason: GeminiFinishReason) -> FinishReason {
    match reason {
        GeminiFinishReason::Stop => FinishReason::Stop,
        GeminiFinishReason::MaxTokens => FinishReason::Length,
        GeminiFinishReason::Safety | GeminiFinishReason::Recitation => FinishReason::ContentFilter,
        GeminiFinishReason::ToolUse => FinishReason::ToolCalls,
        GeminiFinishReason::Other => FinishReason::Stop,
    }
}

fn map_usage(usage: &UsageMetadata) -> Usage {
    let prompt_tokens = usage.prompt_token_count.unwrap_or(0);
    let completion_tokens = usage.candidates_token_count.unwrap_or(0);
    Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens: usage
            .total_token_count
            .unwrap_or(prompt_tokens + completion_tokens),
        extra: serde_json::Map::new(),
    }
}

/// Canonical serialization of the decoded `args` value. Forward transcoding
/// parses the arguments string the same way, so a call that round-trips
/// through both directions keeps a byte-identical arguments string.
fn serialize_arguments(args: Option<&serde_json::Value>) -> String {
    args.and_then(|value| serde_json::to_string(value).ok())
        .unwrap_or_else(|| "{}".to_string())
}

fn generate_completion_id() -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect();
    format!("chatcmpl-{suffix}")
}

fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

/// Per-frame stream transcoder. Each upstream Gemini SSE frame becomes
/// exactly one `chat.completion.chunk`; the first emitted chunk carries
/// `delta.role = "assistant"`.
#[derive(Debug)]
pub struct StreamState {
    id: String,
    model: String,
    created: i64,
    role_sent: bool,
    tool_index: i64,
    finished: bool,
}

impl StreamState {
    pub fn new(model: &str) -> Self {
        Self {
            id: generate_completion_id(),
            model: model.to_string(),
            created: now_unix(),
            role_sent: false,
            tool_index: 0,
            finished: false,
        }
    }

    /// True once a frame carrying a `finishReason` has been seen; the stream
    /// is only considered complete after that.
    pub fn finished(&self) -> bool {
        self.finished
    }

    pub fn transform_frame(&mut self, frame: &GenerateContentResponse) -> ChatCompletionChunk {
        let mut delta = ChunkDelta::default();
        let mut finish_reason = None;

        if let Some(candidate) = frame.candidates.first() {
            if let Some(content) = &candidate.content {
                let text = content.visible_text();
                if !text.is_empty() {
                    delta.content = Some(text);
                }
                let reasoning = content.thought_text();
                if !reasoning.is_empty() {
                    delta.reasoning_content = Some(reasoning);
                }

                let mut chunks = Vec::new();
                for part in &content.parts {
                    if let Some(call) = &part.function_call {
                        let index = self.tool_index;
                        self.tool_index += 1;
                        chunks.push(ToolCallChunk {
                            index,
                            id: Some(
                                call.id.clone().unwrap_or_else(|| format!("call_{index}")),
                            ),
                            kind: Some(ToolCallKind::Function),
                            function: Some(FunctionCallChunk {
                                name: Some(call.name.clone()),
                                arguments: Some(serialize_arguments(call.args.as_ref())),
                            }),
                        });
                    }
                }
                if !chunks.is_empty() {
                    delta.tool_calls = Some(chunks);
                }
            }
            if let Some(reason) = candidate.finish_reason {
                self.finished = true;
                finish_reason = Some(map_finish_reason(reason));
            }
        }

        if !self.role_sent {
            self.role_sent = true;
            delta.role = Some("assistant".to_string());
        }

        ChatCompletionChunk {
            id: self.id.clone(),
            object: CHAT_COMPLETION_CHUNK_OBJECT.to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }
}
