//! Wire representation of the messages that flow through a chain.
//!
//! A message is an arbitrary JSON document. Steps receive the current value by
//! ownership and hand back the next one; nothing links a value to the versions
//! that came before it.

/// Opaque payload passed from step to step.
pub type Message = serde_json::Value;

#[derive(Debug, thiserror::Error)]
#[error("Malformed payload: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

impl DecodeError {
    pub fn reason(&self) -> String {
        self.0.to_string()
    }
}

/// Decodes one delivery body into a [`Message`].
pub fn decode(payload: &[u8]) -> Result<Message, DecodeError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Serializes a message for publishing.
pub fn encode(message: &Message) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(message)
}

/// Lossy, length-capped preview of a payload for log lines.
pub fn excerpt(payload: &[u8], max_chars: usize) -> String {
    let text = String::from_utf8_lossy(payload);
    let mut preview: String = text.chars().take(max_chars).collect();
    if text.chars().count() > max_chars {
        preview.push('…');
    }
    preview
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_object() {
        let message = decode(br#"{"title":"t","body":"b"}"#).unwrap();
        assert_eq!(message, json!({"title": "t", "body": "b"}));
    }

    #[test]
    fn test_decode_rejects_malformed_payload() {
        let err = decode(b"{not json").unwrap_err();
        assert!(err.to_string().starts_with("Malformed payload"));
    }

    #[test]
    fn test_decode_rejects_empty_payload() {
        assert!(decode(b"").is_err());
    }

    #[test]
    fn test_excerpt_truncates_long_payloads() {
        assert_eq!(excerpt(b"abcdef", 3), "abc…");
        assert_eq!(excerpt(b"abc", 3), "abc");
    }

    #[test]
    fn test_excerpt_tolerates_invalid_utf8() {
        let preview = excerpt(&[0xff, b'a', b'b'], 10);
        assert!(preview.ends_with("ab"));
    }
}
