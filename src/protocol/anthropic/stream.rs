use serde::{Deserialize, Serialize};

use super::{MessagesResponse, ResponseBlock, StopReason};
use crate::error::ProxyError;
use crate::stream::sse::anthropic_sse_frame;

/// Anthropic SSE stream event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart {
        message: MessagesResponse,
    },
    Ping,
    ContentBlockStart {
        index: u32,
        content_block: ResponseBlock,
    },
    ContentBlockDelta {
        index: u32,
        delta: BlockDelta,
    },
    ContentBlockStop {
        index: u32,
    },
    MessageDelta {
        delta: MessageDeltaBody,
        usage: DeltaUsage,
    },
    MessageStop,
    Error {
        error: ErrorBody,
    },
}

/// Delta variants for content block deltas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockDelta {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    InputJsonDelta { partial_json: String },
}

/// Message delta body (`stop_reason` etc).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDeltaBody {
    pub stop_reason: Option<StopReason>,
    pub stop_sequence: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaUsage {
    pub output_tokens: u64,
}

/// Error body in stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub type_: String,
    pub message: String,
}

impl StreamEvent {
    /// Terminal error event sent when a stream fails after it has started.
    #[must_use]
    pub fn api_error(message: impl Into<String>) -> Self {
        StreamEvent::Error {
            error: ErrorBody {
                type_: "api_error".to_string(),
                message: message.into(),
            },
        }
    }

    /// SSE `event:` name; always equal to the payload's `type` tag.
    #[must_use]
    pub fn event_name(&self) -> &'static str {
        match self {
            StreamEvent::MessageStart { .. } => "message_start",
            StreamEvent::Ping => "ping",
            StreamEvent::ContentBlockStart { .. } => "content_block_start",
            StreamEvent::ContentBlockDelta { .. } => "content_block_delta",
            StreamEvent::ContentBlockStop { .. } => "content_block_stop",
            StreamEvent::MessageDelta { .. } => "message_delta",
            StreamEvent::MessageStop => "message_stop",
            StreamEvent::Error { .. } => "error",
        }
    }

    /// Encode as one `event: <name>\ndata: <json>\n\n` frame.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Internal`] if the payload cannot be serialized.
    pub fn to_sse_frame(&self) -> Result<String, ProxyError> {
        let json = serde_json::to_string(self)
            .map_err(|e| ProxyError::Internal(format!("Failed to encode stream event: {e}")))?;
        Ok(anthropic_sse_frame(self.event_name(), &json))
    }
}
