//! Normalization of completed exchanges into the canonical chat-log form
//! (ShareGPT-style turns) plus the stream accumulator that rebuilds a reply
//! from captured SSE frames.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Value, json};
use time::OffsetDateTime;

use crate::auth::AuthScheme;
use dproxy_protocol::sse::{DONE_MARKER, FrameParser};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    System,
    Human,
    Gpt,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Turn {
    pub from: TurnRole,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loss: Option<bool>,
}

impl Turn {
    fn new(from: TurnRole, value: impl Into<String>) -> Self {
        Self {
            from,
            value: value.into(),
            loss: None,
        }
    }

    fn tool(value: impl Into<String>) -> Self {
        Self {
            from: TurnRole::Tool,
            value: value.into(),
            loss: Some(false),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallRecord {
    pub name: String,
    pub arguments: String,
}

/// The persisted form of one interaction.
#[derive(Debug, Clone)]
pub struct InteractionRecord {
    pub conversations: Vec<Turn>,
    pub tools: Value,
    pub tool_calls: Vec<ToolCallRecord>,
    pub model: String,
    pub source_provider: String,
    pub request_auth_scheme: AuthScheme,
    pub created_at: OffsetDateTime,
    pub raw_request: Value,
    pub raw_response: Value,
    pub truncated: bool,
}

#[derive(Debug, Clone)]
pub struct ExchangeContext {
    pub provider: String,
    pub auth_scheme: AuthScheme,
    pub model: String,
}

/// Wire family of the upstream conversation payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireShape {
    OpenAi,
    Anthropic,
    Gemini,
}

impl WireShape {
    pub fn from_scheme(scheme: AuthScheme) -> Self {
        match scheme {
            AuthScheme::OpenAI => WireShape::OpenAi,
            AuthScheme::Anthropic => WireShape::Anthropic,
            AuthScheme::Google => WireShape::Gemini,
        }
    }
}

/// Assistant output extracted from a response body or accumulated over a
/// stream.
#[derive(Debug, Clone, Default)]
pub struct Reply {
    pub text: String,
    pub reasoning: String,
    pub tool_calls: Vec<ToolCallRecord>,
}

impl Reply {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.reasoning.is_empty() && self.tool_calls.is_empty()
    }

    /// Stored turn value. Structured reasoning is folded in as a
    /// `<think>` prefix, matching the archive format downstream tooling
    /// expects.
    fn stored_value(&self) -> String {
        if self.reasoning.is_empty() {
            self.text.clone()
        } else {
            format!("<think>\n{}\n</think>\n\n{}", self.reasoning, self.text)
        }
    }
}

/// Pull the assistant reply out of a one-shot response body.
pub fn reply_from_response(shape: WireShape, response: &Value) -> Reply {
    match shape {
        WireShape::OpenAi => reply_from_openai(response),
        WireShape::Anthropic => reply_from_anthropic(response),
        WireShape::Gemini => reply_from_gemini(response),
    }
}

fn reply_from_openai(response: &Value) -> Reply {
    let mut reply = Reply::default();
    let Some(message) = response
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
    else {
        return reply;
    };

    if let Some(content) = message.get("content") {
        reply.text = collect_text(content);
    }
    if let Some(reasoning) = message.get("reasoning_content") {
        reply.reasoning = collect_text(reasoning);
    }
    if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
        for call in calls {
            if let Some(record) = tool_call_from_openai(call) {
                reply.tool_calls.push(record);
            }
        }
    }
    reply
}

fn reply_from_anthropic(response: &Value) -> Reply {
    let mut reply = Reply::default();
    let Some(blocks) = response.get("content").and_then(Value::as_array) else {
        return reply;
    };
    let mut texts = Vec::new();
    let mut thoughts = Vec::new();
    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    texts.push(text.to_string());
                }
            }
            Some("thinking") => {
                if let Some(text) = block.get("thinking").and_then(Value::as_str) {
                    thoughts.push(text.to_string());
                }
            }
            Some("tool_use") => {
                let name = block
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let arguments = block
                    .get("input")
                    .map(|input| input.to_string())
                    .unwrap_or_else(|| "{}".to_string());
                reply.tool_calls.push(ToolCallRecord { name, arguments });
            }
            _ => {}
        }
    }
    reply.text = texts.join("");
    reply.reasoning = thoughts.join("");
    reply
}

fn reply_from_gemini(response: &Value) -> Reply {
    let mut reply = Reply::default();
    let Some(parts) = response
        .get("candidates")
        .and_then(|candidates| candidates.get(0))
        .and_then(|candidate| candidate.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
    else {
        return reply;
    };

    let mut texts = Vec::new();
    let mut thoughts = Vec::new();
    for part in parts {
        if let Some(call) = part.get("functionCall") {
            let name = call
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let arguments = call
                .get("args")
                .map(|args| args.to_string())
                .unwrap_or_else(|| "{}".to_string());
            reply.tool_calls.push(ToolCallRecord { name, arguments });
            continue;
        }
        let Some(text) = part.get("text").and_then(Value::as_str) else {
            continue;
        };
        if part.get("thought").and_then(Value::as_bool).unwrap_or(false) {
            thoughts.push(text.to_string());
        } else {
            texts.push(text.to_string());
        }
    }
    reply.text = texts.join("\n");
    reply.reasoning = thoughts.join("\n");
    reply
}

fn tool_call_from_openai(call: &Value) -> Option<ToolCallRecord> {
    let function = call.get("function")?;
    let name = function.get("name")?.as_str()?.to_string();
    let arguments = match function.get("arguments") {
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
        None => "{}".to_string(),
    };
    Some(ToolCallRecord { name, arguments })
}

/// Build the persisted record for one completed exchange. `reply` is `None`
/// for non-chat shapes and for upstream errors; the record is then raw-only
/// on the response side.
pub fn canonicalize(
    ctx: &ExchangeContext,
    raw_request: Value,
    raw_response: Value,
    reply: Option<&Reply>,
    truncated: bool,
) -> InteractionRecord {
    let mut conversations = request_turns(&raw_request);
    if !conversations.is_empty()
        && let Some(reply) = reply
        && !reply.is_empty()
    {
        let value = reply.stored_value();
        if !value.is_empty() || reply.tool_calls.is_empty() {
            conversations.push(Turn::new(TurnRole::Gpt, value));
        } else {
            conversations.push(Turn::new(
                TurnRole::Gpt,
                serde_json::to_string(&reply.tool_calls).unwrap_or_default(),
            ));
        }
    }

    let tools = raw_request.get("tools").cloned().unwrap_or_else(|| json!([]));
    let tool_calls = reply.map(|r| r.tool_calls.clone()).unwrap_or_default();

    InteractionRecord {
        conversations,
        tools,
        tool_calls,
        model: ctx.model.clone(),
        source_provider: ctx.provider.clone(),
        request_auth_scheme: ctx.auth_scheme,
        created_at: OffsetDateTime::now_utc(),
        raw_request,
        raw_response,
        truncated,
    }
}

/// Turns derived from the request body. OpenAI/Anthropic `messages` and
/// Gemini `contents` are chat-style; anything else (embeddings, rerank,
/// legacy completions) yields no turns and the record stays raw-only.
fn request_turns(request: &Value) -> Vec<Turn> {
    if let Some(messages) = request.get("messages").and_then(Value::as_array) {
        let mut turns = messages_to_turns(messages);
        if let Some(system) = request.get("system") {
            let text = collect_text(system);
            if !text.is_empty() {
                turns.insert(0, Turn::new(TurnRole::System, text));
            }
        }
        return turns;
    }
    if let Some(contents) = request.get("contents").and_then(Value::as_array) {
        return contents_to_turns(request, contents);
    }
    Vec::new()
}

fn messages_to_turns(messages: &[Value]) -> Vec<Turn> {
    let mut turns = Vec::new();
    for message in messages {
        let role = message.get("role").and_then(Value::as_str).unwrap_or("user");
        let content = message.get("content");
        match role {
            "system" | "developer" => {
                let text = content.map(collect_text).unwrap_or_default();
                if !text.is_empty() {
                    turns.push(Turn::new(TurnRole::System, text));
                }
            }
            "assistant" => {
                let mut value = content.map(collect_text).unwrap_or_default();
                if value.is_empty()
                    && let Some(calls) = message.get("tool_calls")
                {
                    value = calls.to_string();
                }
                if !value.is_empty() {
                    turns.push(Turn::new(TurnRole::Gpt, value));
                }
            }
            "tool" | "function" => {
                let text = content.map(collect_text).unwrap_or_default();
                if !text.is_empty() {
                    turns.push(Turn::tool(text));
                }
            }
            _ => {
                // user message; anthropic packs tool results in here too
                let (text, tool_results) = split_user_content(content);
                if !text.is_empty() {
                    turns.push(Turn::new(TurnRole::Human, text));
                }
                for result in tool_results {
                    turns.push(Turn::tool(result));
                }
            }
        }
    }
    turns
}

fn contents_to_turns(request: &Value, contents: &[Value]) -> Vec<Turn> {
    let mut turns = Vec::new();
    if let Some(instruction) = request
        .get("systemInstruction")
        .or_else(|| request.get("system_instruction"))
    {
        let text = gemini_parts_text(instruction);
        if !text.is_empty() {
            turns.push(Turn::new(TurnRole::System, text));
        }
    }
    for content in contents {
        let role = content.get("role").and_then(Value::as_str).unwrap_or("user");
        match role {
            "model" => {
                let text = gemini_parts_text(content);
                if !text.is_empty() {
                    turns.push(Turn::new(TurnRole::Gpt, text));
                }
            }
            "function" => {
                let value = content
                    .get("parts")
                    .map(|parts| parts.to_string())
                    .unwrap_or_default();
                if !value.is_empty() {
                    turns.push(Turn::tool(value));
                }
            }
            _ => {
                let text = gemini_parts_text(content);
                if !text.is_empty() {
                    turns.push(Turn::new(TurnRole::Human, text));
                }
            }
        }
    }
    turns
}

fn split_user_content(content: Option<&Value>) -> (String, Vec<String>) {
    let Some(content) = content else {
        return (String::new(), Vec::new());
    };
    match content {
        Value::Array(items) => {
            let mut texts = Vec::new();
            let mut tool_results = Vec::new();
            for item in items {
                match item.get("type").and_then(Value::as_str) {
                    Some("tool_result") => {
                        let text = item.get("content").map(collect_text).unwrap_or_default();
                        if !text.is_empty() {
                            tool_results.push(text);
                        }
                    }
                    _ => {
                        let text = collect_text(item);
                        if !text.is_empty() {
                            texts.push(text);
                        }
                    }
                }
            }
            (texts.join("\n"), tool_results)
        }
        other => (collect_text(other), Vec::new()),
    }
}

/// Flatten a content value to text: strings pass through, arrays and objects
/// contribute their `text` fields joined with `\n`.
fn collect_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Array(items) => items
            .iter()
            .map(collect_text)
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Object(map) => map
            .get("text")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_default(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn gemini_parts_text(content: &Value) -> String {
    let Some(parts) = content.get("parts").and_then(Value::as_array) else {
        return String::new();
    };
    parts
        .iter()
        .filter(|part| !part.get("thought").and_then(Value::as_bool).unwrap_or(false))
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Accumulates a relayed SSE body for the recorder: the raw text (capped),
/// the reconstructed assistant reply, and whether the stream reached its
/// terminal marker. Feeding it is independent of forwarding, so a slow or
/// failed capture never affects the bytes going to the client.
#[derive(Debug)]
pub struct StreamCapture {
    shape: WireShape,
    parser: FrameParser,
    raw: String,
    cap: usize,
    truncated: bool,
    reply: Reply,
    open_tool_calls: BTreeMap<i64, (String, String)>,
    completed: bool,
}

pub const DEFAULT_CAPTURE_CAP: usize = 16 * 1024 * 1024;

impl StreamCapture {
    pub fn new(shape: WireShape, cap: usize) -> Self {
        Self {
            shape,
            parser: FrameParser::new(),
            raw: String::new(),
            cap,
            truncated: false,
            reply: Reply::default(),
            open_tool_calls: BTreeMap::new(),
            completed: false,
        }
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) {
        if self.raw.len() < self.cap {
            if let Ok(text) = std::str::from_utf8(chunk) {
                let room = self.cap - self.raw.len();
                if text.len() > room {
                    self.truncated = true;
                    let mut cut = room;
                    while cut > 0 && !text.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    self.raw.push_str(&text[..cut]);
                } else {
                    self.raw.push_str(text);
                }
            }
        } else {
            self.truncated = true;
        }

        for frame in self.parser.push_bytes(chunk) {
            self.consume_frame(&frame.data);
        }
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Completion rule per wire family: OpenAI relays need the `[DONE]`
    /// marker, Anthropic a `message_stop` event, Gemini a frame carrying a
    /// `finishReason`.
    pub fn is_complete(&self) -> bool {
        self.completed
    }

    /// Consume the capture at end of stream.
    pub fn finish(mut self) -> (Reply, String, bool, bool) {
        let tail: Vec<_> = self.parser.finish();
        for frame in tail {
            self.consume_frame(&frame.data);
        }
        for (_, (name, arguments)) in std::mem::take(&mut self.open_tool_calls) {
            if !name.is_empty() {
                self.reply.tool_calls.push(ToolCallRecord {
                    name,
                    arguments: if arguments.is_empty() {
                        "{}".to_string()
                    } else {
                        arguments
                    },
                });
            }
        }
        (self.reply, self.raw, self.truncated, self.completed)
    }

    fn consume_frame(&mut self, data: &str) {
        if data == DONE_MARKER {
            self.completed = true;
            return;
        }
        let Ok(frame) = serde_json::from_str::<Value>(data) else {
            return;
        };
        match self.shape {
            WireShape::OpenAi => self.consume_openai_frame(&frame),
            WireShape::Anthropic => self.consume_anthropic_frame(&frame),
            WireShape::Gemini => self.consume_gemini_frame(&frame),
        }
    }

    fn consume_openai_frame(&mut self, frame: &Value) {
        let Some(delta) = frame
            .get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("delta"))
        else {
            return;
        };
        if let Some(content) = delta.get("content").and_then(Value::as_str) {
            self.reply.text.push_str(content);
        }
        if let Some(reasoning) = delta.get("reasoning_content") {
            let text = collect_text(reasoning);
            self.reply.reasoning.push_str(&text);
        }
        if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
            for call in calls {
                let index = call.get("index").and_then(Value::as_i64).unwrap_or(0);
                let entry = self.open_tool_calls.entry(index).or_default();
                if let Some(function) = call.get("function") {
                    if let Some(name) = function.get("name").and_then(Value::as_str) {
                        entry.0.push_str(name);
                    }
                    if let Some(arguments) = function.get("arguments").and_then(Value::as_str) {
                        entry.1.push_str(arguments);
                    }
                }
            }
        }
    }

    fn consume_anthropic_frame(&mut self, frame: &Value) {
        match frame.get("type").and_then(Value::as_str) {
            Some("message_stop") => self.completed = true,
            Some("content_block_start") => {
                let index = frame.get("index").and_then(Value::as_i64).unwrap_or(0);
                if let Some(block) = frame.get("content_block")
                    && block.get("type").and_then(Value::as_str) == Some("tool_use")
                {
                    let name = block
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    self.open_tool_calls.insert(index, (name, String::new()));
                }
            }
            Some("content_block_delta") => {
                let index = frame.get("index").and_then(Value::as_i64).unwrap_or(0);
                let Some(delta) = frame.get("delta") else {
                    return;
                };
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => {
                        if let Some(text) = delta.get("text").and_then(Value::as_str) {
                            self.reply.text.push_str(text);
                        }
                    }
                    Some("thinking_delta") => {
                        if let Some(text) = delta.get("thinking").and_then(Value::as_str) {
                            self.reply.reasoning.push_str(text);
                        }
                    }
                    Some("input_json_delta") => {
                        if let Some(partial) = delta.get("partial_json").and_then(Value::as_str)
                            && let Some(entry) = self.open_tool_calls.get_mut(&index)
                        {
                            entry.1.push_str(partial);
                        }
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    fn consume_gemini_frame(&mut self, frame: &Value) {
        let partial = reply_from_gemini(frame);
        if !partial.text.is_empty() {
            self.reply.text.push_str(&partial.text);
        }
        if !partial.reasoning.is_empty() {
            self.reply.reasoning.push_str(&partial.reasoning);
        }
        self.reply.tool_calls.extend(partial.tool_calls);
        if frame
            .get("candidates")
            .and_then(|candidates| candidates.get(0))
            .and_then(|candidate| candidate.get("finishReason"))
            .is_some()
        {
            self.completed = true;
        }
    }
}

#[cfg(test)]
pub fn test_record(model: &str) -> InteractionRecord {
    let ctx = ExchangeContext {
        provider: "api.test.example".to_string(),
        auth_scheme: AuthScheme::OpenAI,
        model: model.to_string(),
    };
    canonicalize(
        &ctx,
        json!({"model": model, "messages": [{"role": "user", "content": "hi"}]}),
        json!({"choices": [{"message": {"role": "assistant", "content": "hello"}}]}),
        Some(&Reply {
            text: "hello".to_string(),
            reasoning: String::new(),
            tool_calls: Vec::new(),
        }),
        false,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(scheme: AuthScheme) -> ExchangeContext {
        ExchangeContext {
            provider: "api.deepseek.com".to_string(),
            auth_scheme: scheme,
            model: "deepseek-chat".to_string(),
        }
    }

    #[test]
    fn openai_chat_exchange_produces_human_and_gpt_turns() {
        let request = json!({
            "model": "deepseek-chat",
            "messages": [{"role": "user", "content": "hi"}]
        });
        let response = json!({
            "choices": [{"message": {"role": "assistant", "content": "hello there"}}]
        });
        let reply = reply_from_response(WireShape::OpenAi, &response);
        let record = canonicalize(&ctx(AuthScheme::OpenAI), request, response, Some(&reply), false);

        assert_eq!(
            record.conversations,
            vec![
                Turn::new(TurnRole::Human, "hi"),
                Turn::new(TurnRole::Gpt, "hello there"),
            ]
        );
        assert_eq!(record.source_provider, "api.deepseek.com");
        assert!(record.tool_calls.is_empty());
    }

    #[test]
    fn tool_turns_carry_loss_false() {
        let request = json!({
            "model": "m",
            "messages": [
                {"role": "user", "content": "weather?"},
                {"role": "assistant", "tool_calls": [{"id": "c1", "type": "function",
                    "function": {"name": "get_weather", "arguments": "{}"}}]},
                {"role": "tool", "tool_call_id": "c1", "content": "12C"}
            ]
        });
        let turns = request_turns(&request);
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[1].from, TurnRole::Gpt);
        assert_eq!(turns[2].from, TurnRole::Tool);
        assert_eq!(turns[2].loss, Some(false));
        assert_eq!(turns[2].value, "12C");
    }

    #[test]
    fn reply_tool_calls_are_recorded() {
        let response = json!({
            "choices": [{"message": {
                "role": "assistant",
                "content": null,
                "tool_calls": [{"id": "c", "type": "function",
                    "function": {"name": "lookup", "arguments": "{\"q\":1}"}}]
            }}]
        });
        let reply = reply_from_response(WireShape::OpenAi, &response);
        assert_eq!(
            reply.tool_calls,
            vec![ToolCallRecord {
                name: "lookup".to_string(),
                arguments: "{\"q\":1}".to_string(),
            }]
        );
    }

    #[test]
    fn anthropic_blocks_map_to_canonical_shape() {
        let request = json!({
            "model": "kimi",
            "system": "stay sharp",
            "messages": [
                {"role": "user", "content": [{"type": "text", "text": "hi"}]},
                {"role": "assistant", "content": [{"type": "text", "text": "hello"}]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "t1", "content": "42"}
                ]}
            ]
        });
        let response = json!({
            "content": [
                {"type": "text", "text": "done"},
                {"type": "tool_use", "id": "t2", "name": "calc", "input": {"a": 1}}
            ]
        });
        let reply = reply_from_response(WireShape::Anthropic, &response);
        let record =
            canonicalize(&ctx(AuthScheme::Anthropic), request, response, Some(&reply), false);

        assert_eq!(record.conversations[0], Turn::new(TurnRole::System, "stay sharp"));
        assert_eq!(record.conversations[1].from, TurnRole::Human);
        assert_eq!(record.conversations[3], Turn::tool("42"));
        assert_eq!(record.conversations.last().unwrap().value, "done");
        assert_eq!(record.tool_calls[0].name, "calc");
        assert_eq!(record.tool_calls[0].arguments, "{\"a\":1}");
    }

    #[test]
    fn gemini_contents_map_to_turns() {
        let request = json!({
            "systemInstruction": {"parts": [{"text": "be terse"}]},
            "contents": [
                {"role": "user", "parts": [{"text": "first"}, {"text": "second"}]},
                {"role": "model", "parts": [{"text": "reply"}]}
            ]
        });
        let turns = request_turns(&request);
        assert_eq!(turns[0], Turn::new(TurnRole::System, "be terse"));
        assert_eq!(turns[1], Turn::new(TurnRole::Human, "first\nsecond"));
        assert_eq!(turns[2], Turn::new(TurnRole::Gpt, "reply"));
    }

    #[test]
    fn embeddings_requests_stay_raw_only() {
        let request = json!({"model": "text-embedding-3-small", "input": ["a", "b"]});
        let record = canonicalize(
            &ctx(AuthScheme::OpenAI),
            request.clone(),
            json!({"data": []}),
            None,
            false,
        );
        assert!(record.conversations.is_empty());
        assert_eq!(record.raw_request, request);
    }

    #[test]
    fn reasoning_folds_into_think_prefix() {
        let reply = Reply {
            text: "answer".to_string(),
            reasoning: "step by step".to_string(),
            tool_calls: Vec::new(),
        };
        assert_eq!(
            reply.stored_value(),
            "<think>\nstep by step\n</think>\n\nanswer"
        );
    }

    #[test]
    fn openai_stream_capture_requires_done() {
        let mut capture = StreamCapture::new(WireShape::OpenAi, DEFAULT_CAPTURE_CAP);
        capture.push_chunk(
            b"data: {\"choices\":[{\"delta\":{\"role\":\"assistant\",\"content\":\"hel\"}}]}\n\n",
        );
        capture.push_chunk(b"data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n");
        assert!(!capture.is_complete());
        capture.push_chunk(b"data: [DONE]\n\n");
        assert!(capture.is_complete());

        let (reply, raw, truncated, complete) = capture.finish();
        assert_eq!(reply.text, "hello");
        assert!(raw.contains("[DONE]"));
        assert!(!truncated);
        assert!(complete);
    }

    #[test]
    fn openai_stream_capture_accumulates_tool_calls() {
        let mut capture = StreamCapture::new(WireShape::OpenAi, DEFAULT_CAPTURE_CAP);
        capture.push_chunk(
            b"data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"c\",\"function\":{\"name\":\"f\",\"arguments\":\"{\\\"a\\\":\"}}]}}]}\n\n",
        );
        capture.push_chunk(
            b"data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"1}\"}}]}}]}\n\n",
        );
        capture.push_chunk(b"data: [DONE]\n\n");
        let (reply, _, _, complete) = capture.finish();
        assert!(complete);
        assert_eq!(
            reply.tool_calls,
            vec![ToolCallRecord {
                name: "f".to_string(),
                arguments: "{\"a\":1}".to_string(),
            }]
        );
    }

    #[test]
    fn anthropic_stream_capture_completes_on_message_stop() {
        let mut capture = StreamCapture::new(WireShape::Anthropic, DEFAULT_CAPTURE_CAP);
        capture.push_chunk(
            b"event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"hi\"}}\n\n",
        );
        assert!(!capture.is_complete());
        capture.push_chunk(b"event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n");
        let (reply, _, _, complete) = capture.finish();
        assert_eq!(reply.text, "hi");
        assert!(complete);
    }

    #[test]
    fn gemini_stream_capture_completes_on_finish_reason() {
        let mut capture = StreamCapture::new(WireShape::Gemini, DEFAULT_CAPTURE_CAP);
        capture.push_chunk(
            b"data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"par\"}]}}]}\n\n",
        );
        assert!(!capture.is_complete());
        capture.push_chunk(
            b"data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"tial\"}]},\"finishReason\":\"STOP\"}]}\n\n",
        );
        let (reply, _, _, complete) = capture.finish();
        assert_eq!(reply.text, "partial");
        assert!(complete);
    }

    #[test]
    fn capture_cap_marks_truncated_but_keeps_parsing() {
        let mut capture = StreamCapture::new(WireShape::OpenAi, 16);
        capture.push_chunk(
            b"data: {\"choices\":[{\"delta\":{\"content\":\"abcdefghij\"}}]}\n\n",
        );
        capture.push_chunk(b"data: [DONE]\n\n");
        assert!(capture.truncated());
        let (reply, raw, truncated, complete) = capture.finish();
        assert!(truncated);
        assert!(complete);
        assert_eq!(reply.text, "abcdefghij");
        assert!(raw.len() <= 16);
    }
}
