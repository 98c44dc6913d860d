//! Opaque payload encoding
//!
//! Workflow inputs, activity arguments and results cross the storage
//! boundary as JSON strings. The engine never inspects them beyond
//! encode/decode at the edges; storage backends treat them as opaque.

use serde::{de::DeserializeOwned, Serialize};

/// The encoded unit payload (timer completions, daily-workflow inputs)
pub const NULL: &str = "null";

/// Error type for payload encoding and decoding
///
/// Codec failures are fatal for the affected workflow: they indicate a
/// type mismatch between the stored payload and the registered types.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Failed to encode a value
    #[error("encode error: {0}")]
    Encode(#[source] serde_json::Error),

    /// Failed to decode a stored payload
    #[error("decode error: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Encode a value to its opaque stored form
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<String, CodecError> {
    serde_json::to_string(value).map_err(CodecError::Encode)
}

/// Decode a stored payload back into a value
pub fn decode<T: DeserializeOwned>(raw: &str) -> Result<T, CodecError> {
    serde_json::from_str(raw).map_err(CodecError::Decode)
}
