//! Integrity codec: CRC32 checksums and binary-safe text embedding.
//!
//! Envelopes travel as UTF-8 text, so raw audio bytes are embedded with
//! standard (padded) base64. Checksums are always taken over the raw bytes,
//! never over their encoded form.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Errors raised while decoding embedded binary data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntegrityError {
    #[error("malformed binary-safe encoding: {0}")]
    MalformedEncoding(String),
}

/// Standard CRC-32 (IEEE) of `data`.
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Encode raw bytes for embedding in a text envelope.
pub fn encode_binary_safe(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decode bytes previously produced by [`encode_binary_safe`].
pub fn decode_binary_safe(text: &str) -> Result<Vec<u8>, IntegrityError> {
    STANDARD
        .decode(text)
        .map_err(|e| IntegrityError::MalformedEncoding(e.to_string()))
}

/// Encoded length of `raw_len` bytes: 4 output bytes per 3 input bytes, rounded up.
pub const fn encoded_len(raw_len: usize) -> usize {
    raw_len.div_ceil(3) * 4
}
