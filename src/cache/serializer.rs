//! Serializer Module
//!
//! JSON wire encoding with gzip compression above a size threshold.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CacheError, Result};

/// Prefix marking a gzip-compressed payload. JSON text never starts with NUL.
pub const COMPRESSION_MARKER: &[u8] = b"\0gz";

/// Encodes values for both tiers.
#[derive(Debug, Clone, Copy)]
pub struct Serializer {
    compression_threshold: usize,
}

impl Serializer {
    pub fn new(compression_threshold: usize) -> Self {
        Self {
            compression_threshold,
        }
    }

    /// Encodes `value` as JSON, compressing when the encoding exceeds the threshold.
    pub fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        let encoded = serde_json::to_vec(value)?;
        if encoded.len() <= self.compression_threshold {
            return Ok(encoded);
        }

        let mut encoder = GzEncoder::new(COMPRESSION_MARKER.to_vec(), Compression::fast());
        encoder
            .write_all(&encoded)
            .map_err(|e| CacheError::Serialization(format!("compression failed: {e}")))?;
        encoder
            .finish()
            .map_err(|e| CacheError::Serialization(format!("compression failed: {e}")))
    }

    /// Reverses `serialize`. Malformed input yields `CacheError::Serialization`.
    pub fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match bytes.strip_prefix(COMPRESSION_MARKER) {
            Some(compressed) => {
                let mut decoded = Vec::new();
                GzDecoder::new(compressed)
                    .read_to_end(&mut decoded)
                    .map_err(|e| CacheError::Serialization(format!("decompression failed: {e}")))?;
                Ok(serde_json::from_slice(&decoded)?)
            }
            None => Ok(serde_json::from_slice(bytes)?),
        }
    }

    pub fn is_compressed(bytes: &[u8]) -> bool {
        bytes.starts_with(COMPRESSION_MARKER)
    }
}

impl Default for Serializer {
    fn default() -> Self {
        Self::new(1024)
    }
}
