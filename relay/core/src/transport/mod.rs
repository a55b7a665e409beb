//! Transport Layer
//!
//! Client-facing SSE plumbing, independent of stream policy.
//!
//! # Components
//!
//! - [`frame`]: SSE wire format (`event:`/`data:` frames, comments, decoding)
//! - [`traits`]: the [`SseTransport`] write/end contract
//! - [`channel`]: channel-backed transport feeding an HTTP response body
//! - [`heartbeat`]: heartbeat comments until the first chunk is written

pub mod channel;
pub mod frame;
pub mod heartbeat;
pub mod traits;

pub use channel::ChannelTransport;
pub use frame::{decode_frames, encode_comment, encode_event, SseFrame, SseFrameDecoder, SSE_HEADERS};
pub use heartbeat::{HeartbeatConfig, HeartbeatTask};
pub use traits::{ConnectionId, SseTransport, TransportError};
