use crate::protocol::anthropic::Usage;
use crate::protocol::openai_chat::ChatMessage;
use std::time::Duration;
use tracing::info;

/// Whitespace word count used when the backend reports no usage.
///
/// This is a rough stand-in for a tokenizer and undercounts real token usage
/// for most models.
#[must_use]
pub fn count_words(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

/// Estimate input tokens as the word count of every outbound message's content.
#[must_use]
pub fn estimate_input_tokens(messages: &[ChatMessage]) -> u64 {
    messages
        .iter()
        .filter_map(|message| message.content.as_deref())
        .map(count_words)
        .sum()
}

/// Log token usage for a completed request at INFO level.
pub fn log_request_usage(model: &str, usage: &Usage, duration: Duration, stream: bool) {
    info!(
        model = model,
        stream = stream,
        input_tokens = usage.input_tokens,
        output_tokens = usage.output_tokens,
        total_tokens = usage.input_tokens + usage.output_tokens,
        duration_seconds = duration.as_secs_f64(),
        "request completed"
    );
}
