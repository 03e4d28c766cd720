use std::sync::atomic::{AtomicU64, Ordering};

static CALL_ID_COUNTER: AtomicU64 = AtomicU64::new(1);
const HEX: &[u8; 16] = b"0123456789abcdef";
const MESSAGE_ID_RANDOM_LEN: usize = 24;

/// Fallback id for a streamed tool call the backend sent without one.
#[inline]
pub(crate) fn next_call_id() -> String {
    let id = CALL_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut out = String::with_capacity(21);
    out.push_str("call_");
    push_u64_hex_16(&mut out, id);
    out
}

/// Fresh `msg_` id for responses whose backend id cannot be reused.
pub(crate) fn random_message_id() -> String {
    let mut out = String::with_capacity(4 + MESSAGE_ID_RANDOM_LEN);
    out.push_str("msg_");
    for _ in 0..MESSAGE_ID_RANDOM_LEN {
        out.push(fastrand::alphanumeric());
    }
    out
}

/// Payload of a backend `data:` line, trimmed. Other lines yield `None`.
#[inline]
pub(crate) fn sse_data_payload(line: &str) -> Option<&str> {
    line.trim_start()
        .strip_prefix("data:")
        .map(str::trim)
}

#[inline]
fn push_u64_hex_16(out: &mut String, mut value: u64) {
    let mut buf = [b'0'; 16];
    let mut idx = 16;
    while idx > 0 {
        idx -= 1;
        let nibble = usize::try_from(value & 0x0f).unwrap_or(0);
        buf[idx] = HEX[nibble];
        value >>= 4;
    }
    for byte in buf {
        out.push(char::from(byte));
    }
}
