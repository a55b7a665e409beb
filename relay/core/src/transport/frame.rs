//! SSE Frame Protocol
//!
//! Wire format for outbound server-sent events.
//!
//! # Frame Format
//!
//! ```text
//! event: <type>\n
//! data: <single-line JSON>\n
//! \n
//! ```
//!
//! Heartbeats and other comments are `:<text>\n\n` and carry no event.
//!
//! # Security
//!
//! - Maximum payload size is enforced before a frame is built
//! - Event names and comments cannot smuggle line breaks into the stream

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;

use super::TransportError;

/// Maximum JSON payload per frame (1 MB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// SSE response headers
pub const SSE_HEADERS: [(&str, &str); 4] = [
    ("content-type", "text/event-stream; charset=utf-8"),
    ("cache-control", "no-cache, no-transform"),
    ("connection", "keep-alive"),
    ("x-accel-buffering", "no"),
];

fn valid_event_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(['\n', '\r', ':'])
}

/// Encode a named event with a JSON payload
///
/// # Errors
///
/// Returns `TransportError::InvalidEvent` for an empty or multi-line name,
/// `TransportError::Serialization` if the payload does not serialize, and
/// `TransportError::FrameTooLarge` past [`MAX_FRAME_SIZE`].
pub fn encode_event<T: Serialize + ?Sized>(event: &str, payload: &T) -> Result<Bytes, TransportError> {
    if !valid_event_name(event) {
        return Err(TransportError::InvalidEvent(event.to_string()));
    }
    let json =
        serde_json::to_string(payload).map_err(|e| TransportError::Serialization(e.to_string()))?;
    if json.len() > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: json.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let mut buf = String::with_capacity(event.len() + json.len() + 16);
    buf.push_str("event: ");
    buf.push_str(event);
    buf.push_str("\ndata: ");
    buf.push_str(&json);
    buf.push_str("\n\n");
    Ok(Bytes::from(buf))
}

/// Encode a comment frame; line breaks are replaced by spaces
#[must_use]
pub fn encode_comment(comment: &str) -> Bytes {
    let flat: String = comment
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();
    Bytes::from(format!(":{flat}\n\n"))
}

// ============================================================================
// Decoding
// ============================================================================

/// One parsed SSE frame
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SseFrame {
    /// `event:` field, if present
    pub event: Option<String>,
    /// Joined `data:` lines
    pub data: String,
    /// Comment text, for comment-only frames
    pub comment: Option<String>,
}

impl SseFrame {
    /// Whether this is a comment-only frame
    #[must_use]
    pub fn is_comment(&self) -> bool {
        self.event.is_none() && self.data.is_empty() && self.comment.is_some()
    }

    /// Parse `data` as JSON
    ///
    /// # Errors
    ///
    /// Returns the JSON error when `data` is not valid JSON.
    pub fn json(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_str(&self.data)
    }
}

/// Incremental decoder for an SSE byte stream
///
/// Used by clients and tests to split a response body back into frames.
#[derive(Debug, Default)]
pub struct SseFrameDecoder {
    buffer: String,
}

impl SseFrameDecoder {
    /// Create an empty decoder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.push_str(&String::from_utf8_lossy(data));
    }

    /// Pop the next complete frame
    pub fn next_frame(&mut self) -> Option<SseFrame> {
        let end = self.buffer.find("\n\n")?;
        let block: String = self.buffer.drain(..end + 2).collect();
        Some(parse_block(block.trim_end_matches('\n')))
    }

    /// Drain every complete frame
    pub fn drain_frames(&mut self) -> Vec<SseFrame> {
        std::iter::from_fn(|| self.next_frame()).collect()
    }

    /// Bytes waiting for a frame terminator
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

fn parse_block(block: &str) -> SseFrame {
    let mut frame = SseFrame::default();
    let mut data_lines: Vec<&str> = Vec::new();
    for line in block.lines() {
        if let Some(comment) = line.strip_prefix(':') {
            frame.comment = Some(comment.to_string());
        } else if let Some(event) = line.strip_prefix("event:") {
            frame.event = Some(event.trim_start().to_string());
        } else if let Some(data) = line.strip_prefix("data:") {
            data_lines.push(data.strip_prefix(' ').unwrap_or(data));
        }
    }
    frame.data = data_lines.join("\n");
    frame
}

/// Decode a whole body into frames
#[must_use]
pub fn decode_frames(body: &[u8]) -> Vec<SseFrame> {
    let mut decoder = SseFrameDecoder::new();
    decoder.push(body);
    decoder.drain_frames()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_encode_event_format() {
        let bytes = encode_event("chunk", &json!({"index": 0, "text": "He"})).unwrap();
        assert_eq!(
            std::str::from_utf8(&bytes).unwrap(),
            "event: chunk\ndata: {\"index\":0,\"text\":\"He\"}\n\n"
        );
    }

    #[test]
    fn test_encode_event_rejects_bad_names() {
        assert!(matches!(
            encode_event("", &json!({})),
            Err(TransportError::InvalidEvent(_))
        ));
        assert!(matches!(
            encode_event("a\nb", &json!({})),
            Err(TransportError::InvalidEvent(_))
        ));
    }

    #[test]
    fn test_encode_event_too_large() {
        let big = "x".repeat(MAX_FRAME_SIZE + 1);
        assert!(matches!(
            encode_event("chunk", &json!({ "text": big })),
            Err(TransportError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_encode_comment() {
        assert_eq!(&encode_comment("heartbeat")[..], b":heartbeat\n\n");
        assert_eq!(&encode_comment("a\nb")[..], b":a b\n\n");
    }

    #[test]
    fn test_decoder_handles_split_input() {
        let mut decoder = SseFrameDecoder::new();
        let frame = encode_event("control", &json!({"name": "done"})).unwrap();
        let comment = encode_comment("heartbeat");

        decoder.push(&comment[..3]);
        assert!(decoder.next_frame().is_none());
        decoder.push(&comment[3..]);
        decoder.push(&frame[..10]);

        let first = decoder.next_frame().unwrap();
        assert!(first.is_comment());
        assert_eq!(first.comment.as_deref(), Some("heartbeat"));
        assert!(decoder.next_frame().is_none());

        decoder.push(&frame[10..]);
        let second = decoder.next_frame().unwrap();
        assert_eq!(second.event.as_deref(), Some("control"));
        assert_eq!(second.json().unwrap(), json!({"name": "done"}));
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_decode_frames() {
        let mut body = Vec::new();
        body.extend_from_slice(&encode_event("chunk", &json!({"text": "a"})).unwrap());
        body.extend_from_slice(&encode_event("chunk", &json!({"text": "b"})).unwrap());
        let frames = decode_frames(&body);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].json().unwrap()["text"], "b");
    }
}
