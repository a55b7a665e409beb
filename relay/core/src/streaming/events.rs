//! Upstream provider events
//!
//! Providers push [`ProviderEvent`]s into a channel. The enum is closed, so
//! the forwarder handles every variant exhaustively. Loosely shaped JSON from
//! a provider is converted once, at the boundary, by
//! [`ProviderEvent::from_json`].

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

/// Name carried by a `control` event
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlSignal {
    /// Upstream accepted the prompt
    PromptReady,
    /// Upstream finished
    Done,
    /// Free-form metadata for the client
    Meta,
    /// A memory record was persisted
    MemorySaved,
    /// Upstream asks for the apology fallback
    GuardFallbackTrigger,
    /// Anything else, ignored apart from correlation capture
    Other(String),
}

impl ControlSignal {
    /// Parse a control name
    #[must_use]
    pub fn parse(name: &str) -> Self {
        match name.trim() {
            "prompt_ready" => Self::PromptReady,
            "done" => Self::Done,
            "meta" => Self::Meta,
            "memory_saved" => Self::MemorySaved,
            "guard_fallback_trigger" => Self::GuardFallbackTrigger,
            other => Self::Other(other.to_string()),
        }
    }

    /// Control name
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::PromptReady => "prompt_ready",
            Self::Done => "done",
            Self::Meta => "meta",
            Self::MemorySaved => "memory_saved",
            Self::GuardFallbackTrigger => "guard_fallback_trigger",
            Self::Other(name) => name,
        }
    }
}

/// One event from the generation provider
#[derive(Clone, Debug, PartialEq)]
pub enum ProviderEvent {
    /// Control signal with optional metadata
    Control {
        /// Which signal
        name: ControlSignal,
        /// Attached metadata
        meta: Option<Map<String, Value>>,
        /// Attached latency marks
        timings: Option<Map<String, Value>>,
    },
    /// Provider-flagged first token; only used while nothing was emitted
    FirstToken {
        /// Token text
        text: String,
    },
    /// Text chunk, optionally with an explicit index
    Chunk {
        /// Chunk text
        text: String,
        /// Provider-assigned index
        index: Option<u64>,
    },
    /// Incremental text
    Delta {
        /// Delta text
        text: String,
    },
    /// Single token
    Token {
        /// Token text
        text: String,
    },
    /// Upstream finished
    Done {
        /// Terminal metadata (`finishReason`, usage, `interaction_id`, ...)
        meta: Option<Map<String, Value>>,
        /// Latency marks
        timings: Option<Map<String, Value>>,
    },
    /// Upstream failed
    Error {
        /// Error description
        message: String,
    },
    /// Unrecognised payload; text is extracted best effort
    Unknown(Value),
}

impl ProviderEvent {
    /// Shorthand for a control event without metadata
    #[must_use]
    pub fn control(name: ControlSignal) -> Self {
        Self::Control {
            name,
            meta: None,
            timings: None,
        }
    }

    /// Shorthand for a control event with metadata
    #[must_use]
    pub fn control_with_meta(name: ControlSignal, meta: Value) -> Self {
        Self::Control {
            name,
            meta: meta.as_object().cloned(),
            timings: None,
        }
    }

    /// Shorthand for a delta
    #[must_use]
    pub fn delta(text: impl Into<String>) -> Self {
        Self::Delta { text: text.into() }
    }

    /// Shorthand for a done event with a finish reason
    #[must_use]
    pub fn done_with_reason(reason: &str) -> Self {
        let mut meta = Map::new();
        meta.insert("finishReason".to_string(), Value::String(reason.to_string()));
        Self::Done {
            meta: Some(meta),
            timings: None,
        }
    }

    /// Shorthand for an error
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Convert a loosely shaped JSON event
    ///
    /// Dispatches on `type`; anything unrecognised becomes [`Self::Unknown`].
    #[must_use]
    pub fn from_json(value: Value) -> Self {
        let Some(obj) = value.as_object() else {
            return Self::Unknown(value);
        };
        let kind = obj
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let meta = || obj.get("meta").and_then(Value::as_object).cloned();
        let timings = || obj.get("timings").and_then(Value::as_object).cloned();
        let text = || extract_event_text(&value);

        match kind.as_str() {
            "control" => {
                let name = obj.get("name").and_then(Value::as_str).unwrap_or_default();
                Self::Control {
                    name: ControlSignal::parse(name),
                    meta: meta(),
                    timings: timings(),
                }
            }
            "first_token" => match text() {
                Some(text) => Self::FirstToken { text },
                None => Self::Unknown(value),
            },
            "chunk" => match text() {
                Some(text) => Self::Chunk {
                    text,
                    index: obj.get("index").and_then(Value::as_u64),
                },
                None => Self::Unknown(value),
            },
            "delta" => match text() {
                Some(text) => Self::Delta { text },
                None => Self::Unknown(value),
            },
            "token" => match text() {
                Some(text) => Self::Token { text },
                None => Self::Unknown(value),
            },
            "done" => Self::Done {
                meta: meta(),
                timings: timings(),
            },
            "error" => {
                let message = obj
                    .get("error")
                    .and_then(|e| e.get("message").or(Some(e)))
                    .and_then(Value::as_str)
                    .or_else(|| obj.get("message").and_then(Value::as_str))
                    .unwrap_or("unknown_error")
                    .to_string();
                Self::Error { message }
            }
            _ => Self::Unknown(value),
        }
    }

    /// Short label for logs
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Control { .. } => "control",
            Self::FirstToken { .. } => "first_token",
            Self::Chunk { .. } => "chunk",
            Self::Delta { .. } => "delta",
            Self::Token { .. } => "token",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
            Self::Unknown(_) => "unknown",
        }
    }
}

// ============================================================================
// Text helpers
// ============================================================================

/// Whether a chunk is a provider keepalive artifact rather than content
#[must_use]
pub fn is_keepalive_artifact(text: &str) -> bool {
    text.trim().eq_ignore_ascii_case("ok")
}

const FENCE_PATTERN: &str = r"(?is)```(?:json)?.*?```";
const CONTROL_CHAR_PATTERN: &str = r"[\x00-\x08\x0B\x0C\x0E-\x1F\x7F]";

// Both patterns are constants covered by `test_patterns_compile`.
fn fence_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(FENCE_PATTERN).expect("fence pattern is a valid regex"))
}

fn control_char_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(CONTROL_CHAR_PATTERN).expect("control pattern is a valid regex"))
}

/// Strip fenced JSON blocks, a trailing JSON object and control characters
#[must_use]
pub fn sanitize_output(input: &str) -> String {
    let without_fences = fence_regex().replace_all(input, "");
    let without_trailer = strip_trailing_json(&without_fences);
    control_char_regex()
        .replace_all(without_trailer, "")
        .into_owned()
}

fn strip_trailing_json(text: &str) -> &str {
    let trimmed = text.trim_end();
    if !trimmed.ends_with('}') {
        return text;
    }
    for (pos, _) in trimmed.match_indices('{') {
        if let Ok(Value::Object(_)) = serde_json::from_str::<Value>(&trimmed[pos..]) {
            return &text[..pos];
        }
    }
    text
}

const LOOSE_TEXT_KEYS: &[&str] = &[
    "text",
    "content",
    "output_text",
    "outputText",
    "output",
    "answer",
    "reply",
    "speech",
    "message",
    "delta",
];

const LOOSE_TEXT_PATHS: &[(&str, &str)] = &[
    ("response", "text"),
    ("response", "content"),
    ("response", "message"),
    ("result", "text"),
    ("result", "content"),
    ("result", "message"),
    ("payload", "text"),
    ("payload", "content"),
    ("payload", "message"),
];

/// Recursively search a payload for the first non-blank string
#[must_use]
pub fn extract_text_loose(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Array(items) => items.iter().find_map(extract_text_loose),
        Value::Object(obj) => LOOSE_TEXT_KEYS
            .iter()
            .find_map(|k| obj.get(*k).and_then(extract_text_loose))
            .or_else(|| {
                LOOSE_TEXT_PATHS.iter().find_map(|(outer, inner)| {
                    obj.get(*outer)
                        .and_then(|o| o.get(*inner))
                        .and_then(extract_text_loose)
                })
            })
            .or_else(|| {
                obj.get("choices")
                    .and_then(Value::as_array)
                    .and_then(|choices| {
                        choices.iter().find_map(|c| {
                            ["delta", "message", "text", "content"]
                                .iter()
                                .find_map(|k| c.get(*k).and_then(extract_text_loose))
                        })
                    })
            }),
        _ => None,
    }
}

/// Extract the text of an upstream event
///
/// Direct string fields are returned untrimmed with `\r\n` normalised;
/// nested shapes fall back to [`extract_text_loose`].
#[must_use]
pub fn extract_event_text(event: &Value) -> Option<String> {
    let normalize = |s: &str| s.replace("\r\n", "\n");

    let obj = match event {
        Value::String(s) => return (!s.is_empty()).then(|| normalize(s)),
        Value::Object(obj) => obj,
        _ => return None,
    };

    let mut candidates: Vec<&Value> = Vec::new();
    if let Some(delta) = obj.get("delta") {
        candidates.push(delta);
        if let Some(inner) = delta.as_object() {
            candidates.extend(["content", "text", "value"].iter().filter_map(|k| inner.get(*k)));
        }
    }
    candidates.extend(
        ["content", "text", "message", "output", "output_text", "response", "value"]
            .iter()
            .filter_map(|k| obj.get(*k)),
    );

    for candidate in candidates {
        match candidate {
            Value::String(s) if !s.is_empty() => return Some(normalize(s)),
            Value::String(_) | Value::Null => {}
            Value::Array(parts) if parts.iter().all(Value::is_string) && !parts.is_empty() => {
                let joined: String = parts.iter().filter_map(Value::as_str).collect();
                if !joined.is_empty() {
                    return Some(normalize(&joined));
                }
            }
            other => {
                if let Some(text) = extract_text_loose(other) {
                    return Some(text);
                }
            }
        }
    }
    extract_text_loose(event)
}
