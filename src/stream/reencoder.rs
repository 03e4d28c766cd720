use std::collections::BTreeMap;
use std::pin::Pin;
use std::time::Instant;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use smallvec::SmallVec;
use tracing::{debug, warn};

use super::sse::LineDecoder;
use crate::error::ProxyError;
use crate::observability::token_counter::{count_words, log_request_usage};
use crate::protocol::anthropic::stream::{
    BlockDelta, DeltaUsage, MessageDeltaBody, StreamEvent,
};
use crate::protocol::anthropic::{MessagesResponse, ResponseBlock, Usage};
use crate::protocol::mapping::stream_stop_reason;
use crate::protocol::openai_chat::{error_message, ChatDelta, ChatStreamChunk, ChatUsage};
use crate::util::{next_call_id, random_message_id, sse_data_payload};

const DONE_SENTINEL: &str = "[DONE]";
const TEXT_BLOCK_INDEX: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing sent to the client yet.
    Idle,
    /// `message_start` sent.
    Open,
    /// `message_stop` sent; further input is ignored.
    Done,
}

/// Per-request bookkeeping for one reencoded stream.
#[derive(Debug, Default)]
pub struct StreamingState {
    pub accumulated_content: String,
    pub accumulated_reasoning: String,
    /// Last usage object the backend reported.
    pub usage: Option<ChatUsage>,
    /// Shared by content and reasoning text: both write to block 0.
    pub text_block_open: bool,
    pub tool_call_seen: bool,
    /// Longest cumulative argument string seen per tool call index.
    pub tool_args_by_index: BTreeMap<u32, String>,
    pub message_id: String,
}

impl StreamingState {
    /// Output tokens: backend count when reported, else a word count.
    #[must_use]
    pub fn output_tokens(&self) -> u64 {
        match self.usage {
            Some(usage) => usage.completion_tokens,
            None => {
                count_words(&self.accumulated_content) + count_words(&self.accumulated_reasoning)
            }
        }
    }
}

/// Turns backend `data:` lines into Anthropic stream events.
///
/// Output is deferred until the first frame with a choice, so failures that
/// happen before any content can still be reported as a plain JSON error.
#[derive(Debug)]
pub struct StreamReencoder {
    state: StreamingState,
    phase: Phase,
    model: String,
}

impl StreamReencoder {
    #[must_use]
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            state: StreamingState {
                message_id: random_message_id(),
                ..StreamingState::default()
            },
            phase: Phase::Idle,
            model: model.into(),
        }
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.phase != Phase::Idle
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    #[must_use]
    pub fn state(&self) -> &StreamingState {
        &self.state
    }

    /// Process one backend line, appending the resulting events to `out`.
    ///
    /// Lines that are not `data:` lines are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::MalformedFrame`] when the payload is not valid
    /// JSON and [`ProxyError::Backend`] when it carries an `error` field.
    pub fn push_line(&mut self, line: &str, out: &mut Vec<StreamEvent>) -> Result<(), ProxyError> {
        if self.is_done() {
            return Ok(());
        }
        let Some(payload) = sse_data_payload(line) else {
            return Ok(());
        };
        if payload == DONE_SENTINEL {
            self.finish(out);
            return Ok(());
        }
        if payload.is_empty() {
            return Ok(());
        }

        let chunk: ChatStreamChunk = serde_json::from_str(payload)
            .map_err(|e| ProxyError::MalformedFrame(format!("{e}: {payload}")))?;
        self.push_chunk(chunk, out)
    }

    fn push_chunk(
        &mut self,
        chunk: ChatStreamChunk,
        out: &mut Vec<StreamEvent>,
    ) -> Result<(), ProxyError> {
        if let Some(error) = chunk.error.as_ref() {
            return Err(ProxyError::Backend(error_message(error)));
        }
        if let Some(usage) = chunk.usage {
            self.state.usage = Some(usage);
        }
        let Some(choice) = chunk.choices.into_iter().next() else {
            return Ok(());
        };

        self.open(out);
        self.push_delta(choice.delta, out);
        Ok(())
    }

    fn push_delta(&mut self, delta: ChatDelta, out: &mut Vec<StreamEvent>) {
        for call in delta.tool_calls.iter().flatten() {
            self.state.tool_call_seen = true;
            let function = call.function.as_ref();
            if !self.state.tool_args_by_index.contains_key(&call.index) {
                self.state.tool_args_by_index.insert(call.index, String::new());
                out.push(StreamEvent::ContentBlockStart {
                    index: call.index,
                    content_block: ResponseBlock::ToolUse {
                        id: call.id.clone().unwrap_or_else(next_call_id),
                        name: function
                            .and_then(|f| f.name.clone())
                            .unwrap_or_default(),
                        input: serde_json::Value::Object(serde_json::Map::new()),
                    },
                });
            }

            let fragment = function
                .and_then(|f| f.arguments.as_deref())
                .unwrap_or_default();
            let Some(previous) = self.state.tool_args_by_index.get_mut(&call.index) else {
                continue;
            };
            let previous_len = previous.len();
            // Backends differ: some resend the whole argument string each time,
            // others only the new piece. A resent value that is not longer than
            // the stored one adds nothing.
            if fragment.starts_with(previous.as_str()) {
                if fragment.len() > previous_len {
                    previous.clear();
                    previous.push_str(fragment);
                }
            } else if !previous.starts_with(fragment) {
                previous.push_str(fragment);
            }
            if previous.len() > previous_len {
                out.push(StreamEvent::ContentBlockDelta {
                    index: call.index,
                    delta: BlockDelta::InputJsonDelta {
                        partial_json: previous[previous_len..].to_string(),
                    },
                });
            }
        }

        if let Some(text) = delta.content.as_deref().filter(|text| !text.is_empty()) {
            self.open_text_block(out);
            self.state.accumulated_content.push_str(text);
            out.push(StreamEvent::ContentBlockDelta {
                index: TEXT_BLOCK_INDEX,
                delta: BlockDelta::TextDelta {
                    text: text.to_string(),
                },
            });
        }

        if let Some(thinking) = delta.reasoning_text().filter(|text| !text.is_empty()) {
            // Open question: reasoning reuses the content block's flag and index,
            // so a backend interleaving both writes two payload kinds to block 0.
            // Tool indices share the same numbering, and `finish` only stops
            // block 0 when no tool call was seen, so text followed by tools
            // leaves block 0 open (or restarts it for a tool at index 0).
            self.open_text_block(out);
            self.state.accumulated_reasoning.push_str(thinking);
            out.push(StreamEvent::ContentBlockDelta {
                index: TEXT_BLOCK_INDEX,
                delta: BlockDelta::ThinkingDelta {
                    thinking: thinking.to_string(),
                },
            });
        }
    }

    fn open(&mut self, out: &mut Vec<StreamEvent>) {
        if self.phase != Phase::Idle {
            return;
        }
        self.phase = Phase::Open;
        out.push(StreamEvent::MessageStart {
            message: MessagesResponse::empty(self.state.message_id.clone(), self.model.clone()),
        });
        out.push(StreamEvent::Ping);
    }

    fn open_text_block(&mut self, out: &mut Vec<StreamEvent>) {
        if self.state.text_block_open {
            return;
        }
        self.state.text_block_open = true;
        out.push(StreamEvent::ContentBlockStart {
            index: TEXT_BLOCK_INDEX,
            content_block: ResponseBlock::Text {
                text: String::new(),
            },
        });
    }

    fn finish(&mut self, out: &mut Vec<StreamEvent>) {
        self.open(out);
        if self.state.tool_args_by_index.is_empty() {
            if self.state.text_block_open {
                out.push(StreamEvent::ContentBlockStop {
                    index: TEXT_BLOCK_INDEX,
                });
            }
        } else {
            out.extend(
                self.state
                    .tool_args_by_index
                    .keys()
                    .map(|&index| StreamEvent::ContentBlockStop { index }),
            );
        }
        out.push(StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(stream_stop_reason(self.state.tool_call_seen)),
                stop_sequence: None,
            },
            usage: DeltaUsage {
                output_tokens: self.state.output_tokens(),
            },
        });
        out.push(StreamEvent::MessageStop);
        self.phase = Phase::Done;
    }

    /// Signal end of input.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::StreamAbort`] when the backend never sent `[DONE]`.
    pub fn end_of_input(&self) -> Result<(), ProxyError> {
        if self.is_done() {
            Ok(())
        } else {
            Err(ProxyError::StreamAbort(
                "backend closed the stream before [DONE]".to_string(),
            ))
        }
    }

    fn final_usage(&self) -> Usage {
        Usage {
            input_tokens: self.state.usage.map_or(0, |usage| usage.prompt_tokens),
            output_tokens: self.state.output_tokens(),
        }
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

struct PendingBytes {
    chunks: SmallVec<[Bytes; 8]>,
    head: usize,
}

impl PendingBytes {
    #[inline]
    fn with_capacity(capacity: usize) -> Self {
        let mut chunks = SmallVec::new();
        chunks.reserve(capacity);
        Self { chunks, head: 0 }
    }

    #[inline]
    fn pop_front(&mut self) -> Option<Bytes> {
        if self.head >= self.chunks.len() {
            return None;
        }
        let chunk = std::mem::take(&mut self.chunks[self.head]);
        self.head += 1;
        if self.head == self.chunks.len() {
            self.chunks.clear();
            self.head = 0;
        }
        Some(chunk)
    }

    #[inline]
    fn push(&mut self, chunk: Bytes) {
        self.chunks.push(chunk);
    }
}

type ByteStream<E> = Pin<Box<dyn Stream<Item = Result<Bytes, E>> + Send>>;

struct ReencodeDriver<E> {
    body: ByteStream<E>,
    decoder: LineDecoder,
    reencoder: StreamReencoder,
    lines: Vec<String>,
    events: Vec<StreamEvent>,
    pending: PendingBytes,
    failure: Option<ProxyError>,
    finished: bool,
    started_at: Instant,
}

impl<E: std::fmt::Display> ReencodeDriver<E> {
    async fn next_item(&mut self) -> Option<Result<Bytes, ProxyError>> {
        loop {
            if let Some(chunk) = self.pending.pop_front() {
                return Some(Ok(chunk));
            }
            if let Some(err) = self.failure.take() {
                return Some(Err(err));
            }
            if self.finished {
                return None;
            }

            match self.body.next().await {
                Some(Ok(bytes)) => {
                    self.decoder.feed_into(&bytes, &mut self.lines);
                    self.process_lines();
                }
                Some(Err(e)) => {
                    self.fail(ProxyError::Transport(format!(
                        "failed to read backend stream: {e}"
                    )));
                }
                None => {
                    if let Some(line) = self.decoder.finish() {
                        self.lines.push(line);
                    }
                    self.process_lines();
                    if !self.finished {
                        if let Err(err) = self.reencoder.end_of_input() {
                            self.fail(err);
                        }
                    }
                }
            }
        }
    }

    fn process_lines(&mut self) {
        let mut result = Ok(());
        for line in self.lines.drain(..) {
            result = self.reencoder.push_line(&line, &mut self.events);
            if result.is_err() || self.reencoder.is_done() {
                break;
            }
        }
        let result = result.and(self.flush_events());

        if let Err(err) = result {
            self.fail(err);
        } else if self.reencoder.is_done() {
            self.finished = true;
            log_request_usage(
                &self.reencoder.model,
                &self.reencoder.final_usage(),
                self.started_at.elapsed(),
                true,
            );
        }
    }

    fn flush_events(&mut self) -> Result<(), ProxyError> {
        for event in self.events.drain(..) {
            let frame = event.to_sse_frame()?;
            self.pending.push(Bytes::from(frame));
        }
        Ok(())
    }

    fn fail(&mut self, err: ProxyError) {
        self.finished = true;
        if !self.reencoder.is_started() {
            debug!(error = %err, "stream failed before message_start");
            self.failure = Some(err);
            return;
        }
        warn!(
            message_id = %self.reencoder.state().message_id,
            error = %err,
            "aborting stream after message_start"
        );
        if let Ok(frame) = StreamEvent::api_error(err.to_string()).to_sse_frame() {
            self.pending.push(Bytes::from(frame));
        }
    }
}

/// Reencode a backend SSE body into Anthropic SSE frames, one frame per item.
///
/// A failure before `message_start` is yielded as a single `Err` item so the
/// caller can still answer with a JSON error. After that point failures end
/// the stream with an `error` event instead. Dropping the returned stream
/// drops the backend body.
pub fn reencode_stream<S, E>(
    byte_stream: S,
    model: impl Into<String>,
) -> impl Stream<Item = Result<Bytes, ProxyError>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let driver = ReencodeDriver {
        body: Box::pin(byte_stream),
        decoder: LineDecoder::new(),
        reencoder: StreamReencoder::new(model),
        lines: Vec::with_capacity(8),
        events: Vec::with_capacity(8),
        pending: PendingBytes::with_capacity(8),
        failure: None,
        finished: false,
        started_at: Instant::now(),
    };
    futures_util::stream::unfold(driver, |mut driver| async move {
        let item = driver.next_item().await?;
        Some((item, driver))
    })
}
