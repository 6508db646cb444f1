//! Reassembly engine: receiver side of chunked voice transfers.
//!
//! Partial transfers live in one table keyed by `chunk_id`, guarded by a
//! single mutex; every mutation goes through [`ReassemblyEngine::on_chunk_received`]
//! or [`ReassemblyEngine::sweep_timeouts`]. A transfer can only be opened by
//! its first chunk, because chunk #1 carries the authoritative chunk count.
//! Completed entries are removed from the table before their chunks are
//! concatenated.

use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use voxmesh_core::wire::{verify_chunk, AckEnvelope, ChunkEnvelope, Envelope};

use crate::transport::{Destination, MeshTransport, PeerId};

/// A fully reassembled, CRC-verified payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassembledVoice {
    pub chunk_id: String,
    pub from: PeerId,
    pub chunks: u32,
    pub data: Bytes,
}

/// A partial transfer discarded by the timeout sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbandonedTransfer {
    pub chunk_id: String,
    pub from: PeerId,
    pub received: usize,
    pub total: u32,
}

/// What happened to one inbound chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Structurally invalid; dropped.
    Malformed(String),
    /// Payload failed its CRC or base64 check; dropped.
    CrcMismatch,
    /// Non-first chunk of a transfer we have not seen open; dropped.
    BeforeFirst,
    /// Already stored; ignored.
    Duplicate,
    Stored { received: usize, total: u32 },
    Completed(ReassembledVoice),
    /// All chunks counted but some index in `1..=total` was absent.
    ReassemblyFailed { chunk_id: String, missing: Vec<u32> },
}

struct ReassemblyState {
    total: u32,
    received: BTreeMap<u32, Bytes>,
    from: PeerId,
    last_update: Instant,
}

pub struct ReassemblyEngine {
    table: Mutex<HashMap<String, ReassemblyState>>,
    transport: Arc<dyn MeshTransport>,
    app_port: u32,
    receive_timeout: Duration,
}

impl ReassemblyEngine {
    pub fn new(transport: Arc<dyn MeshTransport>, app_port: u32, receive_timeout: Duration) -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            transport,
            app_port,
            receive_timeout,
        }
    }

    /// Number of transfers currently being reassembled.
    pub async fn in_progress(&self) -> usize {
        self.table.lock().await.len()
    }

    /// `(received, total)` for a tracked transfer.
    pub async fn progress(&self, chunk_id: &str) -> Option<(usize, u32)> {
        self.table
            .lock()
            .await
            .get(chunk_id)
            .map(|s| (s.received.len(), s.total))
    }

    /// Process one inbound chunk envelope from `from`.
    pub async fn on_chunk_received(&self, chunk: &ChunkEnvelope, from: &PeerId) -> ChunkOutcome {
        if let Err(reason) = validate(chunk) {
            tracing::warn!(%from, chunk_id = %chunk.chunk_id, reason, "invalid chunk");
            return ChunkOutcome::Malformed(reason.to_string());
        }
        let chunk_id = chunk.chunk_id.as_str();
        let chunk_num = chunk.chunk_num;
        tracing::debug!(%from, chunk_id, chunk_num, total_chunks = chunk.total_chunks, "processing chunk");

        let Some(raw) = verify_chunk(chunk) else {
            tracing::warn!(%from, chunk_id, chunk_num, "chunk CRC error");
            return ChunkOutcome::CrcMismatch;
        };

        self.send_ack(chunk_id, chunk_num, from).await;

        let finished = {
            let mut table = self.table.lock().await;

            if !table.contains_key(chunk_id) {
                if chunk_num != 1 {
                    tracing::warn!(%from, chunk_id, chunk_num, "received chunk before chunk 1, discarding");
                    return ChunkOutcome::BeforeFirst;
                }
                tracing::info!(%from, chunk_id, total_chunks = chunk.total_chunks, "started receiving message");
            }
            let state = table
                .entry(chunk_id.to_string())
                .or_insert_with(|| ReassemblyState {
                    total: chunk.total_chunks,
                    received: BTreeMap::new(),
                    from: from.clone(),
                    last_update: Instant::now(),
                });

            if state.received.contains_key(&chunk_num) {
                tracing::debug!(chunk_id, chunk_num, "duplicate chunk, ignoring");
                return ChunkOutcome::Duplicate;
            }
            state.received.insert(chunk_num, raw);
            state.last_update = Instant::now();

            let received = state.received.len();
            let total = state.total;
            tracing::debug!(chunk_id, chunk_num, received, total, "stored chunk");

            if received < total as usize {
                return ChunkOutcome::Stored { received, total };
            }
            // Complete: take the entry out and concatenate outside the lock.
            table.remove(chunk_id)
        };

        match finished {
            Some(state) => reassemble(chunk_id, state),
            // The entry was inserted above under the same lock.
            None => ChunkOutcome::Malformed("transfer missing at completion".into()),
        }
    }

    /// Discard transfers idle for longer than the receive timeout.
    pub async fn sweep_timeouts(&self, now: Instant) -> Vec<AbandonedTransfer> {
        let mut table = self.table.lock().await;
        let mut abandoned = Vec::new();

        table.retain(|chunk_id, state| {
            let idle = now.saturating_duration_since(state.last_update);
            if idle <= self.receive_timeout {
                return true;
            }
            tracing::warn!(
                chunk_id = %chunk_id,
                from = %state.from,
                received = state.received.len(),
                total = state.total,
                idle_secs = idle.as_secs(),
                "message timed out, discarding"
            );
            abandoned.push(AbandonedTransfer {
                chunk_id: chunk_id.clone(),
                from: state.from.clone(),
                received: state.received.len(),
                total: state.total,
            });
            false
        });
        abandoned
    }

    async fn send_ack(&self, chunk_id: &str, chunk_num: u32, to: &PeerId) {
        let payload = match Envelope::from(AckEnvelope::new(chunk_id, chunk_num)).encode() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(chunk_id, chunk_num, error = %e, "failed to encode ack");
                return;
            }
        };
        let destination = Destination::Peer(to.clone());
        match self.transport.send(payload, &destination, self.app_port, false).await {
            Ok(()) => tracing::debug!(chunk_id, chunk_num, %to, "sent ack"),
            Err(e) => tracing::warn!(chunk_id, chunk_num, %to, error = %e, "failed to send ack"),
        }
    }
}

fn validate(chunk: &ChunkEnvelope) -> Result<(), &'static str> {
    if chunk.chunk_id.is_empty() {
        return Err("empty chunk_id");
    }
    if chunk.chunk_num == 0 {
        return Err("chunk_num must start at 1");
    }
    if chunk.total_chunks == 0 {
        return Err("total_chunks must be at least 1");
    }
    Ok(())
}

fn reassemble(chunk_id: &str, state: ReassemblyState) -> ChunkOutcome {
    let received = state.received.len();
    if received > state.total as usize {
        tracing::warn!(chunk_id, received, total = state.total, "received more chunks than expected");
    }

    let missing: Vec<u32> = (1..=state.total)
        .filter(|n| !state.received.contains_key(n))
        .collect();
    if !missing.is_empty() {
        tracing::error!(chunk_id, ?missing, "reassembly failed, missing chunks");
        return ChunkOutcome::ReassemblyFailed {
            chunk_id: chunk_id.to_string(),
            missing,
        };
    }

    let mut data = BytesMut::new();
    for (_, part) in state.received.range(1..=state.total) {
        data.extend_from_slice(part);
    }
    tracing::info!(chunk_id, from = %state.from, chunks = state.total, bytes = data.len(), "reassembled message");

    ChunkOutcome::Completed(ReassembledVoice {
        chunk_id: chunk_id.to_string(),
        from: state.from,
        chunks: state.total,
        data: data.freeze(),
    })
}
