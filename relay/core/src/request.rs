//! Inbound request parsing
//!
//! Pulls the prompt, the idempotency key and the caller identity out of a
//! request's headers and JSON body. Several spellings are accepted for each
//! field; the first non-blank one wins.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RelayError;

/// Header names checked for the client message id, in order
pub const CLIENT_MESSAGE_ID_HEADERS: [&str; 2] = ["x-relay-client-message-id", "x-client-message-id"];

/// Body fields checked for the client message id, in order
pub const CLIENT_MESSAGE_ID_FIELDS: [&str; 4] =
    ["clientMessageId", "client_message_id", "messageId", "message_id"];

const USER_HEADER: &str = "x-relay-user-id";
const GUEST_HEADER: &str = "x-relay-guest-id";
const SESSION_HEADER: &str = "x-relay-session-id";
const ORIGIN_HEADER: &str = "x-relay-origin";

/// Who is asking
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestIdentity {
    /// Authenticated user
    pub user_id: Option<String>,
    /// Anonymous guest
    pub guest_id: Option<String>,
    /// Client session
    pub session_id: Option<String>,
}

impl RequestIdentity {
    /// Namespace for client-message keys
    ///
    /// `user:` beats `guest:` beats `session:`.
    #[must_use]
    pub fn key(&self) -> Option<String> {
        if let Some(id) = &self.user_id {
            return Some(format!("user:{id}"));
        }
        if let Some(id) = &self.guest_id {
            return Some(format!("guest:{id}"));
        }
        self.session_id.as_ref().map(|id| format!("session:{id}"))
    }
}

/// A parsed streaming request
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StreamRequest {
    /// Prompt text
    pub prompt: String,
    /// Caller-supplied idempotency key
    pub client_message_id: Option<String>,
    /// Caller identity
    pub identity: RequestIdentity,
    /// Diagnostic origin
    pub origin: Option<String>,
    /// Model override
    pub model: Option<String>,
    /// System prompt
    pub system: Option<String>,
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// Token limit
    pub max_tokens: Option<u32>,
}

impl StreamRequest {
    /// Request for `prompt` with nothing else set
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    /// Set the client message id
    #[must_use]
    pub fn with_client_message_id(mut self, id: impl Into<String>) -> Self {
        self.client_message_id = non_blank(Some(id.into()));
        self
    }

    /// Set the caller identity
    #[must_use]
    pub fn with_identity(mut self, identity: RequestIdentity) -> Self {
        self.identity = identity;
        self
    }

    /// Set the origin
    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = non_blank(Some(origin.into()));
        self
    }

    /// Parse from a header lookup and a JSON body
    ///
    /// # Errors
    ///
    /// [`RelayError::InvalidRequest`] when the body is not an object or
    /// carries no prompt.
    pub fn from_parts<F>(header: F, body: &Value) -> Result<Self, RelayError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let Some(obj) = body.as_object() else {
            return Err(RelayError::InvalidRequest("body must be a JSON object".into()));
        };
        let field = |name: &str| non_blank(obj.get(name).and_then(Value::as_str).map(str::to_string));
        let messages = obj.get("messages").and_then(Value::as_array);

        let prompt = field("prompt")
            .or_else(|| field("text"))
            .or_else(|| messages.and_then(|m| last_user_message(m)))
            .ok_or_else(|| RelayError::InvalidRequest("missing prompt".into()))?;

        let client_message_id = CLIENT_MESSAGE_ID_HEADERS
            .iter()
            .find_map(|h| non_blank(header(h)))
            .or_else(|| CLIENT_MESSAGE_ID_FIELDS.iter().find_map(|f| field(f)))
            .or_else(|| messages.and_then(|m| last_message_id(m)));

        let identity = RequestIdentity {
            user_id: non_blank(header(USER_HEADER)),
            guest_id: non_blank(header(GUEST_HEADER)),
            session_id: non_blank(header(SESSION_HEADER)),
        };

        #[allow(clippy::cast_possible_truncation)]
        let temperature = obj.get("temperature").and_then(Value::as_f64).map(|t| t as f32);

        Ok(Self {
            prompt,
            client_message_id,
            identity,
            origin: non_blank(header(ORIGIN_HEADER)).or_else(|| field("origin")),
            model: field("model"),
            system: field("system"),
            temperature,
            max_tokens: obj
                .get("max_tokens")
                .and_then(Value::as_u64)
                .and_then(|n| u32::try_from(n).ok()),
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn last_user_message(messages: &[Value]) -> Option<String> {
    messages
        .iter()
        .rev()
        .find(|m| m.get("role").and_then(Value::as_str) == Some("user"))
        .and_then(|m| m.get("content").and_then(Value::as_str))
        .and_then(|c| non_blank(Some(c.to_string())))
}

fn last_message_id(messages: &[Value]) -> Option<String> {
    let last = messages.last()?;
    match last.get("id")? {
        Value::String(s) => non_blank(Some(s.clone())),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::HashMap;

    fn headers(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_header_id_wins_over_body() {
        let request = StreamRequest::from_parts(
            headers(&[("x-client-message-id", "hdr-1")]),
            &json!({"prompt": "Hello", "clientMessageId": "body-1"}),
        )
        .unwrap();
        assert_eq!(request.client_message_id.as_deref(), Some("hdr-1"));
        assert_eq!(request.prompt, "Hello");
    }

    #[test]
    fn test_body_id_spellings() {
        for field in CLIENT_MESSAGE_ID_FIELDS {
            let mut body = json!({"prompt": "hi"});
            body[field] = json!("m-7");
            let request = StreamRequest::from_parts(headers(&[]), &body).unwrap();
            assert_eq!(request.client_message_id.as_deref(), Some("m-7"), "{field}");
        }
    }

    #[test]
    fn test_messages_fallback() {
        let request = StreamRequest::from_parts(
            headers(&[]),
            &json!({"messages": [
                {"role": "user", "content": "first", "id": 1},
                {"role": "assistant", "content": "reply", "id": 2},
                {"role": "user", "content": "second", "id": "m-3"}
            ]}),
        )
        .unwrap();
        assert_eq!(request.prompt, "second");
        assert_eq!(request.client_message_id.as_deref(), Some("m-3"));
    }

    #[test]
    fn test_blank_id_is_absent() {
        let request = StreamRequest::from_parts(
            headers(&[("x-relay-client-message-id", "  ")]),
            &json!({"prompt": "hi", "message_id": ""}),
        )
        .unwrap();
        assert!(request.client_message_id.is_none());
    }

    #[test]
    fn test_missing_prompt_rejected() {
        let err = StreamRequest::from_parts(headers(&[]), &json!({"prompt": "   "})).unwrap_err();
        assert!(matches!(err, RelayError::InvalidRequest(_)));
        let err = StreamRequest::from_parts(headers(&[]), &json!("hi")).unwrap_err();
        assert!(matches!(err, RelayError::InvalidRequest(_)));
    }

    #[test]
    fn test_identity_key_precedence() {
        let request = StreamRequest::from_parts(
            headers(&[("x-relay-guest-id", "g1"), ("x-relay-session-id", "s1")]),
            &json!({"prompt": "hi"}),
        )
        .unwrap();
        assert_eq!(request.identity.key().as_deref(), Some("guest:g1"));

        let identity = RequestIdentity {
            user_id: Some("u1".into()),
            guest_id: Some("g1".into()),
            session_id: None,
        };
        assert_eq!(identity.key().as_deref(), Some("user:u1"));
        assert_eq!(RequestIdentity::default().key(), None);
    }

    #[test]
    fn test_optional_generation_fields() {
        let request = StreamRequest::from_parts(
            headers(&[("x-relay-origin", "web")]),
            &json!({"prompt": "hi", "model": "m", "system": "sys", "temperature": 0.5, "max_tokens": 32}),
        )
        .unwrap();
        assert_eq!(request.origin.as_deref(), Some("web"));
        assert_eq!(request.model.as_deref(), Some("m"));
        assert_eq!(request.system.as_deref(), Some("sys"));
        assert_eq!(request.max_tokens, Some(32));
        assert!(request.temperature.is_some());
    }
}
