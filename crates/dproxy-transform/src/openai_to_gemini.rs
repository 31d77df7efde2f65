//! OpenAI chat-completions request → Gemini `generateContent` request.

use dproxy_protocol::gemini::generate_content::GenerateContentRequestBody;
use dproxy_protocol::gemini::types::{
    Blob, Content, ContentRole, FileData, FunctionCall, FunctionDeclaration, FunctionResponse,
    GenerationConfig, Part, Tool,
};
use dproxy_protocol::openai::chat::{
    ChatCompletionRequestBody, ChatMessage, ContentPart, MessageContent, StopSequences, ToolCall,
    ToolDefinition,
};
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct TranscodedRequest {
    /// Upstream path including the model action and, for streams, `?alt=sse`.
    pub path: String,
    pub body: GenerateContentRequestBody,
}

pub fn upstream_path(model: &str, stream: bool) -> String {
    if stream {
        format!("/v1beta/models/{model}:streamGenerateContent?alt=sse")
    } else {
        format!("/v1beta/models/{model}:generateContent")
    }
}

pub fn transform_request(request: &ChatCompletionRequestBody) -> TranscodedRequest {
    let mut system_texts = Vec::new();
    let mut contents = Vec::new();

    for message in &request.messages {
        match message {
            ChatMessage::System { content } | ChatMessage::Developer { content } => {
                let text = content.to_text();
                if !text.is_empty() {
                    system_texts.push(text);
                }
            }
            ChatMessage::User { content } => {
                let parts = map_content_parts(content);
                if !parts.is_empty() {
                    contents.push(Content {
                        role: Some(ContentRole::User),
                        parts,
                    });
                }
            }
            ChatMessage::Assistant {
                content,
                tool_calls,
            } => {
                if let Some(entry) = map_assistant_message(content.as_ref(), tool_calls.as_deref())
                {
                    contents.push(entry);
                }
            }
            ChatMessage::Tool {
                content,
                tool_call_id,
            } => {
                contents.push(map_tool_message(content, tool_call_id.as_deref()));
            }
        }
    }

    let system_instruction = if system_texts.is_empty() {
        None
    } else {
        Some(Content::text(system_texts.join("\n\n")))
    };

    let generation_config = map_generation_config(request);

    TranscodedRequest {
        path: upstream_path(&request.model, request.is_stream()),
        body: GenerateContentRequestBody {
            contents,
            tools: map_tools(request.tools.as_deref()),
            system_instruction,
            generation_config,
            extra: serde_json::Map::new(),
        },
    }
}

fn map_assistant_message(
    content: Option<&MessageContent>,
    tool_calls: Option<&[ToolCall]>,
) -> Option<Content> {
    let mut parts = Vec::new();
    if let Some(content) = content {
        parts.extend(map_content_parts(content));
    }
    if let Some(calls) = tool_calls {
        for call in calls {
            parts.push(Part {
                function_call: Some(FunctionCall {
                    id: Some(call.id.clone()),
                    name: call.function.name.clone(),
                    args: Some(parse_arguments(&call.function.arguments)),
                }),
                ..Part::default()
            });
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(Content {
            role: Some(ContentRole::Model),
            parts,
        })
    }
}

fn map_tool_message(content: &MessageContent, tool_call_id: Option<&str>) -> Content {
    let name = tool_call_id.unwrap_or("tool").to_string();
    Content {
        role: Some(ContentRole::Function),
        parts: vec![Part {
            function_response: Some(FunctionResponse {
                id: tool_call_id.map(str::to_string),
                name,
                response: Value::String(content.to_text()),
            }),
            ..Part::default()
        }],
    }
}

fn map_content_parts(content: &MessageContent) -> Vec<Part> {
    match content {
        MessageContent::Text(text) => {
            if text.is_empty() {
                Vec::new()
            } else {
                vec![Part::text(text.clone())]
            }
        }
        MessageContent::Parts(items) => items
            .iter()
            .filter_map(|item| match item {
                ContentPart::Text { text } => {
                    if text.is_empty() {
                        None
                    } else {
                        Some(Part::text(text.clone()))
                    }
                }
                ContentPart::ImageUrl { image_url } => Some(map_image_url(&image_url.url)),
            })
            .collect(),
    }
}

fn map_image_url(url: &str) -> Part {
    if let Some((mime_type, data)) = parse_data_url(url) {
        return Part {
            inline_data: Some(Blob { mime_type, data }),
            ..Part::default()
        };
    }
    Part {
        file_data: Some(FileData {
            mime_type: None,
            file_uri: url.to_string(),
        }),
        ..Part::default()
    }
}

fn map_tools(tools: Option<&[ToolDefinition]>) -> Option<Vec<Tool>> {
    let tools = tools?;
    let declarations: Vec<FunctionDeclaration> = tools
        .iter()
        .map(|tool| {
            let ToolDefinition::Function { function } = tool;
            FunctionDeclaration {
                name: function.name.clone(),
                description: function.description.clone(),
                parameters: function.parameters.clone(),
            }
        })
        .collect();
    if declarations.is_empty() {
        return None;
    }
    Some(vec![Tool {
        function_declarations: Some(declarations),
    }])
}

fn map_generation_config(request: &ChatCompletionRequestBody) -> Option<GenerationConfig> {
    let stop_sequences = request.stop.as_ref().map(|stop| match stop {
        StopSequences::Single(value) => vec![value.clone()],
        StopSequences::Many(values) => values.clone(),
    });

    let config = GenerationConfig {
        temperature: request.temperature,
        top_p: request.top_p,
        max_output_tokens: request.max_tokens,
        stop_sequences,
        extra: serde_json::Map::new(),
    };
    if config.is_empty() { None } else { Some(config) }
}

/// Tool-call arguments are a JSON string on the OpenAI side; Gemini wants the
/// decoded value. A string that fails to parse is carried as a JSON string.
fn parse_arguments(arguments: &str) -> Value {
    serde_json::from_str(arguments).unwrap_or_else(|_| Value::String(arguments.to_string()))
}

fn parse_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let (mime, encoding) = meta.split_once(';')?;
    if encoding != "base64" {
        return None;
    }
    Some((mime.to_string(), data.to_string()))
}
