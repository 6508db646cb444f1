//! Chunk splitter: size-aware fragmentation of a payload.
//!
//! The wire budget bounds the *encoded envelope*, not the raw payload.
//! Framing overhead is measured by encoding a sample chunk envelope with an
//! empty payload, so the arithmetic follows the envelope if its fields
//! change. The remaining room is converted from base64 characters back to
//! raw bytes in whole 4-character groups.

use bytes::Bytes;

use crate::integrity::encoded_len;
use crate::wire::{ChunkEnvelope, Envelope, WireError};

/// A chunk that can carry this many raw bytes or fewer is not worth sending.
pub const MIN_USABLE_RAW: usize = 3;

/// Width of identifiers produced by `wire::generate_chunk_id`.
const SAMPLE_CHUNK_ID: &str = "00000000";

/// Errors raised while planning a split.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SplitError {
    #[error("wire budget of {budget} bytes leaves {usable} raw bytes per chunk after {overhead} bytes of framing")]
    BudgetTooSmall {
        budget: usize,
        overhead: usize,
        usable: usize,
    },

    #[error("{0} chunks exceed the chunk counter range")]
    TooManyChunks(usize),

    #[error(transparent)]
    Envelope(#[from] WireError),
}

/// Encoded size of a chunk envelope with an empty payload whose counters are
/// as wide as `total_chunks`. The CRC field is sized for its widest value.
pub fn chunk_overhead(total_chunks: u32) -> Result<usize, WireError> {
    let mut sample = ChunkEnvelope::new(SAMPLE_CHUNK_ID, total_chunks, total_chunks, b"");
    sample.crc32 = u32::MAX;
    Ok(Envelope::from(sample).encode()?.len())
}

/// Largest raw chunk whose envelope fits in `budget` when the message has
/// `total_chunks` chunks.
pub fn max_raw_per_chunk(budget: usize, total_chunks: u32) -> Result<usize, SplitError> {
    let overhead = chunk_overhead(total_chunks)?;
    let encoded_room = budget.saturating_sub(overhead);
    let usable = (encoded_room / 4) * 3;
    debug_assert!(encoded_len(usable) <= encoded_room);

    if usable <= MIN_USABLE_RAW {
        return Err(SplitError::BudgetTooSmall {
            budget,
            overhead,
            usable,
        });
    }
    Ok(usable)
}

/// Chunk size and count for a payload of `data_len` bytes.
///
/// The counter width depends on the chunk count and vice versa, so the
/// estimate is refined until the digit count stops growing.
pub fn plan(data_len: usize, budget: usize) -> Result<(usize, usize), SplitError> {
    let mut assumed_total: u32 = 1;
    loop {
        let per_chunk = max_raw_per_chunk(budget, assumed_total)?;
        let total = data_len.div_ceil(per_chunk);
        let total_u32 = u32::try_from(total).map_err(|_| SplitError::TooManyChunks(total))?;
        if digits(total_u32) <= digits(assumed_total) {
            return Ok((per_chunk, total));
        }
        assumed_total = total_u32;
    }
}

/// Split `data` into non-empty, contiguous slices that each fit `budget`
/// once wrapped in a chunk envelope. Empty input yields no chunks.
pub fn split(data: &Bytes, budget: usize) -> Result<Vec<Bytes>, SplitError> {
    let (per_chunk, total) = plan(data.len(), budget)?;

    let chunks: Vec<Bytes> = (0..total)
        .map(|i| {
            let start = i * per_chunk;
            let end = (start + per_chunk).min(data.len());
            data.slice(start..end)
        })
        .collect();

    tracing::debug!(
        bytes = data.len(),
        budget,
        per_chunk,
        chunks = chunks.len(),
        "payload split"
    );
    Ok(chunks)
}

fn digits(n: u32) -> u32 {
    n.checked_ilog10().unwrap_or(0) + 1
}
