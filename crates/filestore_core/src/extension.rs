//! Transaction extension metadata.
//!
//! Each transaction record carries an opaque extension block next to the
//! user name and description. The engine hands the block to an
//! [`ExtensionCodec`] when building undo log descriptors; a block that fails
//! to decode is ignored there rather than failing the listing.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Decoded extension metadata, keyed by name.
pub type ExtensionMap = BTreeMap<String, ExtensionValue>;

/// A single extension metadata value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExtensionValue {
    /// No value.
    Null,
    /// Boolean flag.
    Bool(bool),
    /// Signed integer.
    Integer(i64),
    /// Floating point number.
    Float(f64),
    /// UTF-8 text.
    Text(String),
}

impl From<&str> for ExtensionValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ExtensionValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for ExtensionValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<bool> for ExtensionValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Converts extension metadata to and from its on-disk bytes.
pub trait ExtensionCodec: Send + Sync {
    /// Encodes a map. An empty map must encode to zero bytes.
    ///
    /// # Errors
    ///
    /// Returns an extension error if the map cannot be encoded or does not
    /// fit the 2-byte length field.
    fn encode(&self, extension: &ExtensionMap) -> CoreResult<Vec<u8>>;

    /// Decodes bytes produced by [`Self::encode`].
    ///
    /// # Errors
    ///
    /// Returns an extension error if the bytes are not a valid map.
    fn decode(&self, bytes: &[u8]) -> CoreResult<ExtensionMap>;
}

/// CBOR extension codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct CborExtensionCodec;

impl ExtensionCodec for CborExtensionCodec {
    fn encode(&self, extension: &ExtensionMap) -> CoreResult<Vec<u8>> {
        if extension.is_empty() {
            return Ok(Vec::new());
        }
        let mut buf = Vec::new();
        ciborium::ser::into_writer(extension, &mut buf)
            .map_err(|e| CoreError::extension(e.to_string()))?;
        if buf.len() > usize::from(u16::MAX) {
            return Err(CoreError::extension(format!(
                "encoded extension is {} bytes, limit is {}",
                buf.len(),
                u16::MAX
            )));
        }
        Ok(buf)
    }

    fn decode(&self, bytes: &[u8]) -> CoreResult<ExtensionMap> {
        if bytes.is_empty() {
            return Ok(ExtensionMap::new());
        }
        ciborium::de::from_reader(bytes).map_err(|e| CoreError::extension(e.to_string()))
    }
}
