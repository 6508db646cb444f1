//! voxmesh wire format: the envelopes exchanged on the private app port.
//!
//! Every packet carries exactly one envelope: a compact JSON record whose
//! first field is the `type` tag. Binary payloads are base64-embedded and
//! protected by a CRC32 over the raw (pre-encoding) bytes. Field names are
//! the protocol; renaming any of them breaks interop with deployed nodes.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::integrity::{crc32, decode_binary_safe, encode_binary_safe};

// ── Type tags ────────────────────────────────────────────────────────────────

pub const TYPE_VOICE_CHUNK: &str = "voice_chunk";
pub const TYPE_ACK: &str = "ack";
pub const TYPE_TEST: &str = "test";
pub const TYPE_COMPLETE_VOICE: &str = "complete_voice";

// ── Envelopes ────────────────────────────────────────────────────────────────

/// One fragment of a multi-chunk message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEnvelope {
    /// Shared by every chunk of one logical message.
    pub chunk_id: String,
    /// 1-based position within the message.
    pub chunk_num: u32,
    /// Declared chunk count. Only chunk #1's value is trusted by receivers.
    pub total_chunks: u32,
    /// CRC32 of the raw chunk bytes.
    pub crc32: u32,
    /// base64 of the raw chunk bytes.
    pub data: String,
}

/// Unicast acknowledgement of one received chunk. Fire-and-forget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckEnvelope {
    pub ack_id: String,
    pub chunk_num: u32,
}

/// Connectivity probe carrying free text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestEnvelope {
    pub test: String,
}

/// A voice payload small enough for a single packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteVoiceEnvelope {
    /// CRC32 of the raw compressed voice bytes.
    pub crc32: u32,
    /// base64 of the raw compressed voice bytes.
    pub voice_data: String,
    /// Sender-side capture time, `%Y%m%d_%H%M%S`.
    pub timestamp: String,
}

/// Any envelope that can appear on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    #[serde(rename = "voice_chunk")]
    VoiceChunk(ChunkEnvelope),
    #[serde(rename = "ack")]
    Ack(AckEnvelope),
    #[serde(rename = "test")]
    Test(TestEnvelope),
    #[serde(rename = "complete_voice")]
    CompleteVoice(CompleteVoiceEnvelope),
}

impl ChunkEnvelope {
    /// Wrap raw chunk bytes. The CRC is taken before encoding.
    pub fn new(chunk_id: impl Into<String>, chunk_num: u32, total_chunks: u32, raw: &[u8]) -> Self {
        Self {
            chunk_id: chunk_id.into(),
            chunk_num,
            total_chunks,
            crc32: crc32(raw),
            data: encode_binary_safe(raw),
        }
    }

    /// Parse bytes that must hold a `voice_chunk` envelope.
    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        match Envelope::parse(data)? {
            Envelope::VoiceChunk(chunk) => Ok(chunk),
            other => Err(WireError::UnexpectedType {
                expected: TYPE_VOICE_CHUNK,
                actual: other.kind(),
            }),
        }
    }
}

impl AckEnvelope {
    pub fn new(ack_id: impl Into<String>, chunk_num: u32) -> Self {
        Self {
            ack_id: ack_id.into(),
            chunk_num,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        match Envelope::parse(data)? {
            Envelope::Ack(ack) => Ok(ack),
            other => Err(WireError::UnexpectedType {
                expected: TYPE_ACK,
                actual: other.kind(),
            }),
        }
    }
}

impl TestEnvelope {
    pub fn new(text: impl Into<String>) -> Self {
        Self { test: text.into() }
    }

    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        match Envelope::parse(data)? {
            Envelope::Test(test) => Ok(test),
            other => Err(WireError::UnexpectedType {
                expected: TYPE_TEST,
                actual: other.kind(),
            }),
        }
    }
}

impl CompleteVoiceEnvelope {
    /// Wrap a whole compressed voice payload. The CRC is taken before encoding.
    pub fn new(raw: &[u8], timestamp: impl Into<String>) -> Self {
        Self {
            crc32: crc32(raw),
            voice_data: encode_binary_safe(raw),
            timestamp: timestamp.into(),
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        match Envelope::parse(data)? {
            Envelope::CompleteVoice(voice) => Ok(voice),
            other => Err(WireError::UnexpectedType {
                expected: TYPE_COMPLETE_VOICE,
                actual: other.kind(),
            }),
        }
    }
}

impl From<ChunkEnvelope> for Envelope {
    fn from(e: ChunkEnvelope) -> Self {
        Envelope::VoiceChunk(e)
    }
}

impl From<AckEnvelope> for Envelope {
    fn from(e: AckEnvelope) -> Self {
        Envelope::Ack(e)
    }
}

impl From<TestEnvelope> for Envelope {
    fn from(e: TestEnvelope) -> Self {
        Envelope::Test(e)
    }
}

impl From<CompleteVoiceEnvelope> for Envelope {
    fn from(e: CompleteVoiceEnvelope) -> Self {
        Envelope::CompleteVoice(e)
    }
}

impl Envelope {
    /// The `type` tag this envelope carries on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::VoiceChunk(_) => TYPE_VOICE_CHUNK,
            Envelope::Ack(_) => TYPE_ACK,
            Envelope::Test(_) => TYPE_TEST,
            Envelope::CompleteVoice(_) => TYPE_COMPLETE_VOICE,
        }
    }

    /// Serialize to the immutable byte string handed to the transport.
    pub fn encode(&self) -> Result<Bytes, WireError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| WireError::Encode(e.to_string()))
    }

    /// Parse a received payload.
    ///
    /// The tag is inspected before the record shape so that a missing or
    /// unknown `type` is reported as such rather than as a generic decode
    /// failure. No side effects; the caller decides whether to log.
    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        let text = std::str::from_utf8(data)?;
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| WireError::Malformed(e.to_string()))?;

        let tag = match value.get("type") {
            Some(serde_json::Value::String(tag)) => tag.as_str(),
            Some(_) => return Err(WireError::Malformed("`type` is not a string".into())),
            None => return Err(WireError::MissingType),
        };
        if ![TYPE_VOICE_CHUNK, TYPE_ACK, TYPE_TEST, TYPE_COMPLETE_VOICE].contains(&tag) {
            return Err(WireError::UnknownType(tag.to_string()));
        }

        serde_json::from_value(value).map_err(|e| WireError::Malformed(e.to_string()))
    }
}

// ── Verification ─────────────────────────────────────────────────────────────

/// Decode a chunk's payload and check it against the declared CRC.
///
/// Returns the raw bytes only when the checksum matches. A mismatch is an
/// expected outcome on a lossy link and is reported as `None`, never as an
/// error.
pub fn verify_chunk(chunk: &ChunkEnvelope) -> Option<Bytes> {
    let raw = match decode_binary_safe(&chunk.data) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!(
                chunk_id = %chunk.chunk_id,
                chunk_num = chunk.chunk_num,
                error = %e,
                "chunk payload is not valid base64"
            );
            return None;
        }
    };

    let calculated = crc32(&raw);
    if calculated != chunk.crc32 {
        tracing::warn!(
            chunk_id = %chunk.chunk_id,
            chunk_num = chunk.chunk_num,
            total_chunks = chunk.total_chunks,
            expected = chunk.crc32,
            calculated,
            "chunk CRC mismatch"
        );
        return None;
    }
    Some(Bytes::from(raw))
}

/// Same contract as [`verify_chunk`] for the single-packet variant.
pub fn verify_complete(voice: &CompleteVoiceEnvelope) -> Option<Bytes> {
    let raw = match decode_binary_safe(&voice.voice_data) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!(error = %e, "complete voice payload is not valid base64");
            return None;
        }
    };

    let calculated = crc32(&raw);
    if calculated != voice.crc32 {
        tracing::warn!(
            expected = voice.crc32,
            calculated,
            "complete voice CRC mismatch"
        );
        return None;
    }
    Some(Bytes::from(raw))
}

/// Fresh identifier for a multi-chunk message: 8 lowercase hex characters.
pub fn generate_chunk_id() -> String {
    hex::encode(rand::random::<[u8; 4]>())
}

// ── Constants ────────────────────────────────────────────────────────────────

/// Default private application port on the mesh.
pub const DEFAULT_APP_PORT: u32 = 256;

/// Destination alias meaning "every node in range".
pub const BROADCAST_ADDR: &str = "^all";

// ── Errors ───────────────────────────────────────────────────────────────────

/// Reasons an inbound payload could not be turned into an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("envelope has no `type` tag")]
    MissingType,

    #[error("unknown envelope type: {0:?}")]
    UnknownType(String),

    #[error("expected a {expected} envelope, got {actual}")]
    UnexpectedType {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("failed to encode envelope: {0}")]
    Encode(String),
}
