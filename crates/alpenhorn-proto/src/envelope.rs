//! Typed JSON envelopes for the coordinator websocket.
//!
//! Every message on the coordinator channel is an `{"id": ..., "message":
//! ...}` object. The id selects the handler; the message is the
//! handler-specific payload, left unparsed until the handler opens it so a
//! malformed payload for one id cannot poison dispatch of the others.

use serde::{Deserialize, Serialize};

use crate::errors::WireError;

/// A typed message envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    /// Message id, e.g. `"newround"` or `"onion"`.
    pub id: String,

    /// JSON-encoded payload for the handler selected by `id`.
    pub message: serde_json::Value,
}

impl Envelope {
    /// Wrap a payload under the given message id.
    pub fn new(id: &str, message: &impl Serialize) -> Result<Self, WireError> {
        let message = serde_json::to_value(message)
            .map_err(|e| WireError::MalformedMessage(e.to_string()))?;
        Ok(Self { id: id.to_string(), message })
    }

    /// Parse the payload as `T`.
    pub fn open<T: for<'de> Deserialize<'de>>(&self) -> Result<T, WireError> {
        serde_json::from_value(self.message.clone())
            .map_err(|e| WireError::MalformedMessage(e.to_string()))
    }

    /// Encode the envelope for the wire.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        serde_json::to_vec(self).map_err(|e| WireError::MalformedMessage(e.to_string()))
    }

    /// Decode an envelope received from the wire.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        serde_json::from_slice(bytes).map_err(|e| WireError::MalformedMessage(e.to_string()))
    }
}
