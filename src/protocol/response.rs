use super::anthropic::{MessagesResponse, ResponseBlock, Usage};
use super::mapping::{anthropic_message_id, openai_finish_to_anthropic, openai_usage_to_anthropic};
use super::openai_chat::{error_message, ChatMessage, ChatResponse};
use crate::error::ProxyError;
use crate::observability::token_counter::{count_words, estimate_input_tokens};

/// Translate a complete `OpenAI` chat response into an Anthropic message.
///
/// `outbound` is the message list that was sent; it only feeds the usage
/// estimate when the backend reports no usage. `fallback_model` names the
/// response when the backend omits its model.
///
/// # Errors
///
/// Returns [`ProxyError::Backend`] when the body carries an `error` field, and
/// [`ProxyError::Translation`] when there is no choice or a tool call's
/// arguments are not valid JSON.
pub fn translate_response(
    response: &ChatResponse,
    outbound: &[ChatMessage],
    fallback_model: &str,
) -> Result<MessagesResponse, ProxyError> {
    if let Some(error) = response.error.as_ref() {
        return Err(ProxyError::Backend(error_message(error)));
    }

    let choice = response
        .choices
        .first()
        .ok_or_else(|| ProxyError::Translation("no choices in backend response".to_string()))?;
    let message = &choice.message;
    let text = message.content.clone().unwrap_or_default();

    let tool_calls = message.tool_calls.as_deref().unwrap_or_default();
    let mut content = Vec::with_capacity(1 + tool_calls.len());
    for call in tool_calls {
        let input = parse_arguments(&call.function.arguments).map_err(|e| {
            ProxyError::Translation(format!(
                "invalid arguments for tool call '{}': {e}",
                call.function.name
            ))
        })?;
        content.push(ResponseBlock::ToolUse {
            id: call.id.clone(),
            name: call.function.name.clone(),
            input,
        });
    }

    let usage = match response.usage.as_ref() {
        Some(usage) => openai_usage_to_anthropic(usage),
        None => Usage {
            input_tokens: estimate_input_tokens(outbound),
            output_tokens: count_words(&text),
        },
    };
    content.insert(0, ResponseBlock::Text { text });

    let mut out = MessagesResponse::empty(
        anthropic_message_id(response.id.as_deref()),
        response
            .model
            .clone()
            .unwrap_or_else(|| fallback_model.to_string()),
    );
    out.content = content;
    out.stop_reason = Some(openai_finish_to_anthropic(choice.finish_reason.as_deref()));
    out.usage = usage;
    Ok(out)
}

fn parse_arguments(arguments: &str) -> Result<serde_json::Value, serde_json::Error> {
    // Some backends send "" for tools that take no parameters.
    if arguments.trim().is_empty() {
        return Ok(serde_json::Value::Object(serde_json::Map::new()));
    }
    serde_json::from_str(arguments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::anthropic::StopReason;
    use serde_json::json;

    fn parse(value: serde_json::Value) -> ChatResponse {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_hi_scenario() {
        let response = parse(json!({
            "id":"chatcmpl-42",
            "model":"backend-model",
            "choices":[{"index":0,"message":{"role":"assistant","content":"Hi"},"finish_reason":"stop"}],
            "usage":{"prompt_tokens":9,"completion_tokens":1,"total_tokens":10}
        }));
        let out = translate_response(&response, &[], "configured").unwrap();
        assert_eq!(out.id, "msg-42");
        assert_eq!(out.model, "backend-model");
        assert_eq!(out.content, vec![ResponseBlock::Text { text: "Hi".into() }]);
        assert_eq!(out.stop_reason, Some(StopReason::EndTurn));
        assert_eq!(
            out.usage,
            Usage {
                input_tokens: 9,
                output_tokens: 1
            }
        );
    }

    #[test]
    fn test_tool_calls_follow_text_block() {
        let response = parse(json!({
            "id":"chatcmpl-7",
            "choices":[{
                "message":{
                    "role":"assistant",
                    "content":null,
                    "tool_calls":[
                        {"id":"call_1","type":"function","function":{"name":"get_weather","arguments":"{\"location\":\"NY\"}"}},
                        {"id":"call_2","type":"function","function":{"name":"now","arguments":""}}
                    ]
                },
                "finish_reason":"tool_calls"
            }]
        }));
        let out = translate_response(&response, &[], "configured").unwrap();
        assert_eq!(out.model, "configured");
        assert_eq!(out.stop_reason, Some(StopReason::ToolUse));
        assert_eq!(
            out.content,
            vec![
                ResponseBlock::Text {
                    text: String::new()
                },
                ResponseBlock::ToolUse {
                    id: "call_1".into(),
                    name: "get_weather".into(),
                    input: json!({"location":"NY"}),
                },
                ResponseBlock::ToolUse {
                    id: "call_2".into(),
                    name: "now".into(),
                    input: json!({}),
                },
            ]
        );
    }

    #[test]
    fn test_invalid_arguments_are_fatal() {
        let response = parse(json!({
            "choices":[{"message":{"tool_calls":[
                {"id":"call_1","function":{"name":"f","arguments":"{not json"}}
            ]}}]
        }));
        let err = translate_response(&response, &[], "m").unwrap_err();
        assert!(matches!(err, ProxyError::Translation(_)));
    }

    #[test]
    fn test_error_field_is_backend_error() {
        let response = parse(json!({"error":{"message":"No endpoints found","code":404}}));
        let err = translate_response(&response, &[], "m").unwrap_err();
        assert!(matches!(&err, ProxyError::Backend(msg) if msg == "No endpoints found"));
    }

    #[test]
    fn test_no_choices_is_translation_error() {
        let err = translate_response(&parse(json!({"choices":[]})), &[], "m").unwrap_err();
        assert!(matches!(err, ProxyError::Translation(_)));
    }

    #[test]
    fn test_length_maps_to_max_tokens_and_unknown_to_end_turn() {
        let out = translate_response(
            &parse(json!({"choices":[{"message":{"content":"cut"},"finish_reason":"length"}]})),
            &[],
            "m",
        )
        .unwrap();
        assert_eq!(out.stop_reason, Some(StopReason::MaxTokens));

        let out = translate_response(
            &parse(json!({"choices":[{"message":{"content":"x"},"finish_reason":"content_filter"}]})),
            &[],
            "m",
        )
        .unwrap();
        assert_eq!(out.stop_reason, Some(StopReason::EndTurn));
    }

    #[test]
    fn test_usage_falls_back_to_word_counts() {
        let outbound = vec![
            ChatMessage {
                role: "system".into(),
                content: Some("be nice".into()),
                ..Default::default()
            },
            ChatMessage {
                role: "user".into(),
                content: Some("Hello there friend".into()),
                ..Default::default()
            },
        ];
        let response = parse(json!({
            "id":"gen-1",
            "choices":[{"message":{"content":"Hi, how are you?"},"finish_reason":"stop"}]
        }));
        let out = translate_response(&response, &outbound, "m").unwrap();
        assert!(out.id.starts_with("msg_"));
        assert_eq!(
            out.usage,
            Usage {
                input_tokens: 5,
                output_tokens: 4
            }
        );
    }
}
