//! Wire format shared by every transport implementation.
//!
//! A message crosses the wire as a bincode-framed [`Envelope`] (every
//! variable-length field carries its own length prefix) whose body is the
//! serde_json encoding of the payload. The content tags let a consumer
//! reject envelopes produced by something that is not this crate.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

pub const CONTENT_TYPE: &str = "application/x-conveyor";
pub const CONTENT_ENCODING: &str = "json";

/// Transport frame: correlation id, content tags, optional reply queue and
/// the encoded payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub content_type: String,
    pub content_encoding: String,
    pub reply_to: Option<String>,
    pub body: Vec<u8>,
}

impl Envelope {
    /// Whether this envelope carries a payload we know how to decode.
    pub fn understood(&self) -> bool {
        self.content_type == CONTENT_TYPE && self.content_encoding == CONTENT_ENCODING
    }
}

/// Encode a payload into envelope-body bytes.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// Decode envelope-body bytes into a typed payload.
pub fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(body)?)
}

/// Serialize an envelope into its wire frame.
pub fn frame(envelope: &Envelope) -> Result<Vec<u8>> {
    Ok(bincode::serialize(envelope)?)
}

/// Deserialize a wire frame back into an envelope.
pub fn unframe(bytes: &[u8]) -> Result<Envelope> {
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn envelope_round_trip() {
        let envelope = Envelope {
            id: Uuid::new_v4(),
            content_type: CONTENT_TYPE.to_string(),
            content_encoding: CONTENT_ENCODING.to_string(),
            reply_to: Some("replies".to_string()),
            body: encode(&json!({"a": 1})).unwrap(),
        };

        let bytes = frame(&envelope).unwrap();
        let back = unframe(&bytes).unwrap();
        assert_eq!(envelope, back);
        assert_eq!(
            decode::<serde_json::Value>(&back.body).unwrap(),
            json!({"a": 1})
        );
    }

    #[test]
    fn foreign_content_is_not_understood() {
        let envelope = Envelope {
            id: Uuid::new_v4(),
            content_type: "text/plain".to_string(),
            content_encoding: CONTENT_ENCODING.to_string(),
            reply_to: None,
            body: b"hello".to_vec(),
        };
        assert!(!envelope.understood());
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let envelope = Envelope {
            id: Uuid::new_v4(),
            content_type: CONTENT_TYPE.to_string(),
            content_encoding: CONTENT_ENCODING.to_string(),
            reply_to: None,
            body: vec![1, 2, 3],
        };
        let mut bytes = frame(&envelope).unwrap();
        bytes.truncate(bytes.len() / 2);
        assert!(unframe(&bytes).is_err());
    }
}
