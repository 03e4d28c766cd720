use serde_json::Value;

use super::anthropic::{AnthropicTool, ContentBlock, MessageContent, MessagesRequest};
use super::openai_chat::{
    function_type, ChatMessage, ChatRequest, ChatStreamOptions, ChatTool, ChatToolCall,
    ChatToolCallFunction, ChatToolFunction,
};
use super::schema::sanitize_schema;
use crate::config::{FeaturesConfig, UpstreamConfig};

/// Tool names that are never forwarded to the backend.
pub const EXCLUDED_TOOLS: &[&str] = &["BatchTool"];

const DEFAULT_TEMPERATURE: f64 = 1.0;

/// An outbound chat request plus the backend model it targets.
#[derive(Debug, Clone, PartialEq)]
pub struct TranslatedRequest {
    pub body: ChatRequest,
    pub model: String,
}

/// Translate an Anthropic Messages request into an `OpenAI` chat request.
///
/// Never fails: content shapes that are not understood contribute nothing.
#[must_use]
pub fn translate_request(
    request: &MessagesRequest,
    upstream: &UpstreamConfig,
    features: &FeaturesConfig,
) -> TranslatedRequest {
    let model = if request.wants_reasoning() {
        upstream.reasoning_model.clone()
    } else {
        upstream.completion_model.clone()
    };

    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    if let Some(system) = request.system.as_ref() {
        for entry in system_entries(system) {
            if !entry.is_empty() {
                messages.push(ChatMessage {
                    role: "system".to_string(),
                    content: Some(entry),
                    ..Default::default()
                });
            }
        }
    }
    for message in &request.messages {
        push_message(&mut messages, message.role.as_str(), message.content.as_ref());
    }

    let tools = translate_tools(request.tools.as_deref().unwrap_or_default());
    let stream = request.wants_stream();

    tracing::debug!(
        model = %model,
        messages = messages.len(),
        tools = tools.len(),
        stream,
        "translated request"
    );

    TranslatedRequest {
        body: ChatRequest {
            model: model.clone(),
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            stream,
            stream_options: (stream && features.stream_include_usage).then_some(
                ChatStreamOptions {
                    include_usage: true,
                },
            ),
            tools: (!tools.is_empty()).then_some(tools),
        },
        model,
    }
}

fn push_message(out: &mut Vec<ChatMessage>, role: &str, content: Option<&MessageContent>) {
    // Only string content carries text; block lists contribute tool calls.
    let text = match content {
        Some(MessageContent::Text(text)) if !text.is_empty() => Some(text.clone()),
        _ => None,
    };
    let blocks = content.map(MessageContent::blocks).unwrap_or_default();

    let tool_calls: Vec<ChatToolCall> = blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::ToolUse { id, name, input } => Some(ChatToolCall {
                id: id.clone(),
                type_: function_type(),
                function: ChatToolCallFunction {
                    name: name.clone(),
                    arguments: stringify_input(input),
                },
            }),
            _ => None,
        })
        .collect();

    if text.is_some() || !tool_calls.is_empty() {
        out.push(ChatMessage {
            role: role.to_string(),
            content: text,
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            tool_call_id: None,
        });
    }

    for block in blocks {
        if let ContentBlock::ToolResult {
            tool_use_id,
            text,
            content,
        } = block
        {
            let result = text
                .clone()
                .or_else(|| content.as_ref().and_then(normalize_content))
                .unwrap_or_default();
            out.push(ChatMessage {
                role: "tool".to_string(),
                content: Some(result),
                tool_calls: None,
                tool_call_id: Some(tool_use_id.clone()),
            });
        }
    }
}

fn stringify_input(input: &Value) -> String {
    if input.is_null() {
        "{}".to_string()
    } else {
        input.to_string()
    }
}

fn translate_tools(tools: &[AnthropicTool]) -> Vec<ChatTool> {
    tools
        .iter()
        .filter(|tool| !EXCLUDED_TOOLS.contains(&tool.name.as_str()))
        .map(|tool| ChatTool {
            type_: function_type(),
            function: ChatToolFunction {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: sanitize_schema(&tool.input_schema),
            },
        })
        .collect()
}

/// One entry per system prompt element, before empty entries are dropped.
fn system_entries(system: &MessageContent) -> Vec<String> {
    match system {
        MessageContent::Text(text) => vec![text.clone()],
        MessageContent::Blocks(blocks) => blocks
            .iter()
            .filter_map(|block| block.plain_text().map(str::to_string))
            .collect(),
        MessageContent::Other(Value::Array(items)) => items
            .iter()
            .filter_map(|item| {
                item.get("text")
                    .or_else(|| item.get("content"))
                    .and_then(normalize_value)
            })
            .collect(),
        MessageContent::Other(_) => Vec::new(),
    }
}

/// Flatten content to text.
///
/// A string is kept as-is. A list joins the non-empty `text` (or `content`)
/// of its items with single spaces. Anything else has no text.
#[must_use]
pub fn normalize_content(content: &MessageContent) -> Option<String> {
    match content {
        MessageContent::Text(text) => Some(text.clone()),
        MessageContent::Blocks(blocks) => Some(join_non_empty(
            blocks.iter().filter_map(ContentBlock::plain_text),
        )),
        MessageContent::Other(value) => normalize_value(value),
    }
}

fn normalize_value(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Array(items) => Some(join_non_empty(items.iter().filter_map(|item| {
            item.get("text")
                .and_then(Value::as_str)
                .or_else(|| item.get("content").and_then(Value::as_str))
        }))),
        _ => None,
    }
}

fn join_non_empty<'a>(parts: impl Iterator<Item = &'a str>) -> String {
    let mut out = String::new();
    for part in parts.filter(|part| !part.is_empty()) {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(part);
    }
    out
}
