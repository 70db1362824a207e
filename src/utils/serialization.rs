// src/utils/serialization.rs
//! Serialization utilities for backend payloads.
//!
//! Provides:
//! - JSON encoding/decoding with typed [`DecodeError`] classification
//! - A serde adapter that carries opaque byte strings as base64 text

use crate::error::DecodeError;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Serializes a value to a JSON string.
///
/// # Errors
/// Returns [`DecodeError::Malformed`] if the value cannot be represented as
/// JSON (e.g. a map with non-string keys).
pub fn encode<T: Serialize + ?Sized>(data: &T) -> Result<String, DecodeError> {
    serde_json::to_string(data).map_err(|e| DecodeError::Malformed(e.to_string()))
}

/// Deserializes a value from a JSON string.
///
/// Nesting depth is not limited, so anything [`encode`] produced decodes back.
/// Deep payloads grow the stack on demand instead of overflowing it.
///
/// # Arguments
/// * `data` - JSON text received from a backend
///
/// # Errors
/// - [`DecodeError::UnknownVariant`] when an enum tag is not one the client knows
/// - [`DecodeError::Malformed`] for any other syntax or schema mismatch,
///   including trailing characters after the value
pub fn decode<T: DeserializeOwned>(data: &str) -> Result<T, DecodeError> {
    let mut json = serde_json::Deserializer::from_str(data);
    json.disable_recursion_limit();
    let value = T::deserialize(serde_stacker::Deserializer::new(&mut json)).map_err(classify)?;
    json.end().map_err(classify)?;
    Ok(value)
}

fn classify(err: serde_json::Error) -> DecodeError {
    let message = err.to_string();
    if err.is_data() && message.starts_with("unknown variant") {
        DecodeError::UnknownVariant(message)
    } else {
        DecodeError::Malformed(message)
    }
}

/// Serde adapter for `Vec<u8>` fields encoded as standard base64 strings.
///
/// Use with `#[serde(with = "crate::utils::serialization::base64_bytes")]`.
pub mod base64_bytes {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::decode(encoded.as_bytes())
            .map_err(|e| D::Error::custom(format!("Base64 decoding failed: {}", e)))
    }
}
