pub mod reencoder;
pub mod sse;

pub use reencoder::{reencode_stream, Phase, StreamReencoder, StreamingState};
pub use sse::{anthropic_sse_frame, LineDecoder};
