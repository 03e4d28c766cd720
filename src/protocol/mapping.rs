use super::anthropic::{StopReason, Usage};
use super::openai_chat::ChatUsage;
use crate::util::random_message_id;

// ---------------------------------------------------------------------------
// Stop reason mappings
// ---------------------------------------------------------------------------

/// Map an `OpenAI` `finish_reason` onto an Anthropic `stop_reason`.
///
/// Unknown and missing reasons fall back to `end_turn`.
#[must_use]
pub fn openai_finish_to_anthropic(finish_reason: Option<&str>) -> StopReason {
    match finish_reason {
        Some("tool_calls") => StopReason::ToolUse,
        Some("length") => StopReason::MaxTokens,
        _ => StopReason::EndTurn,
    }
}

/// Stop reason reported at the end of a stream.
#[must_use]
pub fn stream_stop_reason(tool_call_seen: bool) -> StopReason {
    if tool_call_seen {
        StopReason::ToolUse
    } else {
        StopReason::EndTurn
    }
}

// ---------------------------------------------------------------------------
// Id mappings
// ---------------------------------------------------------------------------

/// Reuse a `chatcmpl…` backend id as `msg…`; otherwise mint a fresh one.
#[must_use]
pub fn anthropic_message_id(backend_id: Option<&str>) -> String {
    match backend_id {
        Some(id) if id.contains("chatcmpl") => id.replacen("chatcmpl", "msg", 1),
        _ => random_message_id(),
    }
}

// ---------------------------------------------------------------------------
// Usage mappings
// ---------------------------------------------------------------------------

#[must_use]
pub fn openai_usage_to_anthropic(usage: &ChatUsage) -> Usage {
    Usage {
        input_tokens: usage.prompt_tokens,
        output_tokens: usage.completion_tokens,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
