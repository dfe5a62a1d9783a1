use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{KeelError, Result};

/// Identifier of a logical content: the hex-encoded output of the
/// repository hash function over the plaintext.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(String);

impl ContentId {
    pub fn from_hash(hash: &[u8]) -> Self {
        ContentId(hex::encode(hash))
    }

    /// Parse a ContentId from its hex form.
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        if hex_str.is_empty() || hex_str.len() % 2 != 0 {
            return Err(KeelError::Other(format!("invalid content id '{hex_str}'")));
        }
        hex::decode(hex_str)
            .map_err(|e| KeelError::Other(format!("invalid content id '{hex_str}': {e}")))?;
        Ok(ContentId(hex_str.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Raw hash bytes, used as AEAD associated data.
    pub fn hash_bytes(&self) -> Vec<u8> {
        hex::decode(&self.0).unwrap_or_default()
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = &self.0[..self.0.len().min(16)];
        write!(f, "ContentId({short})")
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
