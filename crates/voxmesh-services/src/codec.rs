//! Voice codec boundary: compress PCM before sending, restore it on receipt.
//!
//! The transport protocol treats the compressed bytes as opaque. Quality is
//! picked by name; [`ZstdCodec`] maps names to zstd levels through
//! [`AudioConfig`].
//!
//! Payloads are plain zstd frames over raw PCM. Nodes that compress with zlib
//! behind a `rate,channels,width` header speak the same envelopes but their
//! voice data does not decode here, and ours does not decode there.

use voxmesh_core::config::AudioConfig;

/// Upper bound on restored PCM. Anything larger is treated as corrupt.
pub const MAX_PCM_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("compression failed: {0}")]
    Compress(std::io::Error),

    #[error("decompression failed: {0}")]
    Decompress(std::io::Error),

    #[error("input of {0} bytes exceeds the limit of {max} bytes", max = MAX_PCM_BYTES)]
    TooLarge(usize),
}

/// Deterministic compress/decompress pair for voice payloads.
pub trait VoiceCodec: Send + Sync {
    fn compress(&self, pcm: &[u8], quality: &str) -> Result<Vec<u8>, CodecError>;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
}

pub struct ZstdCodec {
    audio: AudioConfig,
}

impl ZstdCodec {
    pub fn new(audio: AudioConfig) -> Self {
        Self { audio }
    }
}

impl Default for ZstdCodec {
    fn default() -> Self {
        Self::new(AudioConfig::default())
    }
}

impl VoiceCodec for ZstdCodec {
    fn compress(&self, pcm: &[u8], quality: &str) -> Result<Vec<u8>, CodecError> {
        if pcm.len() > MAX_PCM_BYTES {
            return Err(CodecError::TooLarge(pcm.len()));
        }
        let level = self.audio.level(quality);
        let compressed = zstd::encode_all(pcm, level).map_err(CodecError::Compress)?;
        tracing::debug!(
            quality,
            level,
            raw = pcm.len(),
            compressed = compressed.len(),
            "compressed voice"
        );
        Ok(compressed)
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        zstd::bulk::decompress(data, MAX_PCM_BYTES).map_err(CodecError::Decompress)
    }
}
