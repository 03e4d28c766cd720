//! SSE line splitting for backend bodies and frame encoding for client output.
//!
//! The backend framing is line oriented: every `data:` line is one payload, so
//! the decoder only has to cut the byte stream on `\n` while tolerating chunk
//! boundaries that fall anywhere, including inside a multi-byte character.
use bytes::BytesMut;
use memchr::memchr_iter;

/// Incremental newline splitter over raw body chunks.
///
/// A partial trailing line stays buffered until its newline arrives or
/// [`LineDecoder::finish`] flushes it at end of stream.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: BytesMut,
}

impl LineDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Feed one chunk and append every completed line to `out`.
    ///
    /// Lines are decoded lossily and stripped of a trailing `\r`.
    pub fn feed_into(&mut self, chunk: &[u8], out: &mut Vec<String>) {
        if self.buffer.is_empty() {
            let consumed = split_lines(chunk, out);
            self.buffer.extend_from_slice(&chunk[consumed..]);
            return;
        }
        self.buffer.extend_from_slice(chunk);
        let consumed = split_lines(&self.buffer, out);
        if consumed > 0 {
            let _ = self.buffer.split_to(consumed);
        }
    }

    /// Feed one chunk and return the completed lines.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut out = Vec::new();
        self.feed_into(chunk, &mut out);
        out
    }

    /// Flush the buffered partial line, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = self.buffer.split().freeze();
        Some(decode_line(&rest))
    }
}

fn split_lines(bytes: &[u8], out: &mut Vec<String>) -> usize {
    let mut start = 0;
    for pos in memchr_iter(b'\n', bytes) {
        out.push(decode_line(&bytes[start..pos]));
        start = pos + 1;
    }
    start
}

#[inline]
fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Format an Anthropic-style SSE frame with an event type.
#[must_use]
pub fn anthropic_sse_frame(event_type: &str, json: &str) -> String {
    let mut out = String::with_capacity(18 + event_type.len() + json.len());
    out.push_str("event: ");
    out.push_str(event_type);
    out.push('\n');
    out.push_str("data: ");
    out.push_str(json);
    out.push_str("\n\n");
    out
}
