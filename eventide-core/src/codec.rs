//! Serialization of event payloads and snapshot state.
//!
//! Stores only ever see bytes plus a recorded type tag. A [`Codec`] turns
//! domain values into those bytes and back; [`JsonCodec`] is the default.

use serde::{Serialize, de::DeserializeOwned};

/// Serialization strategy used for event payloads and snapshot state.
pub trait Codec: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// # Errors
    ///
    /// Returns a codec-specific error if the value cannot be encoded.
    fn serialize<T>(&self, value: &T) -> Result<Vec<u8>, Self::Error>
    where
        T: Serialize;

    /// # Errors
    ///
    /// Returns a codec-specific error if the bytes do not decode as `T`.
    fn deserialize<T>(&self, data: &[u8]) -> Result<T, Self::Error>
    where
        T: DeserializeOwned;
}

/// JSON codec backed by `serde_json`.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    type Error = serde_json::Error;

    fn serialize<T>(&self, value: &T) -> Result<Vec<u8>, Self::Error>
    where
        T: Serialize,
    {
        serde_json::to_vec(value)
    }

    fn deserialize<T>(&self, data: &[u8]) -> Result<T, Self::Error>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(data)
    }
}
