//! Inbound routing: turns raw packets from the transport into events.
//!
//! Packets on other application ports are ignored. Chunk envelopes go to the
//! reassembly engine; everything the application cares about leaves through
//! an unbounded channel of [`InboundEvent`]s, so the consumer never shares
//! state with the receive path.

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;

use voxmesh_core::wire::{verify_complete, Envelope};

use crate::reassembly::{AbandonedTransfer, ChunkOutcome, ReassemblyEngine};
use crate::timestamp;
use crate::transport::PeerId;

/// A voice payload ready for decompression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedVoice {
    pub from: PeerId,
    /// Compressed voice bytes, CRC-verified.
    pub data: Bytes,
    /// Sender's capture time for single packets, local completion time for
    /// chunked transfers.
    pub timestamp: String,
    /// Set when the payload was reassembled from chunks.
    pub chunk_id: Option<String>,
}

impl ReceivedVoice {
    pub fn is_chunked(&self) -> bool {
        self.chunk_id.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Voice(ReceivedVoice),
    Test {
        from: PeerId,
        text: String,
    },
    Ack {
        from: PeerId,
        ack_id: String,
        chunk_num: u32,
    },
    /// A chunk or single-packet voice payload failed its integrity check.
    CrcError {
        from: PeerId,
        chunk_id: Option<String>,
        chunk_num: Option<u32>,
    },
    TransferFailed {
        chunk_id: String,
        missing: Vec<u32>,
    },
    TransferAbandoned(AbandonedTransfer),
}

pub struct InboundRouter {
    app_port: u32,
    reassembly: Arc<ReassemblyEngine>,
    events: mpsc::UnboundedSender<InboundEvent>,
}

impl InboundRouter {
    pub fn new(
        app_port: u32,
        reassembly: Arc<ReassemblyEngine>,
    ) -> (Self, mpsc::UnboundedReceiver<InboundEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                app_port,
                reassembly,
                events,
            },
            rx,
        )
    }

    /// Handle one packet delivered by the transport.
    pub async fn on_packet(&self, port: u32, payload: &[u8], from: &PeerId) {
        if port != self.app_port {
            tracing::trace!(port, %from, "packet on foreign port, ignoring");
            return;
        }

        let envelope = match Envelope::parse(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(%from, bytes = payload.len(), error = %e, "unparseable packet");
                return;
            }
        };
        tracing::debug!(%from, kind = envelope.kind(), "received envelope");

        match envelope {
            Envelope::VoiceChunk(chunk) => {
                let outcome = self.reassembly.on_chunk_received(&chunk, from).await;
                self.on_chunk_outcome(outcome, &chunk.chunk_id, chunk.chunk_num, from);
            }
            Envelope::CompleteVoice(voice) => match verify_complete(&voice) {
                Some(data) => {
                    tracing::info!(%from, bytes = data.len(), timestamp = %voice.timestamp, "received complete voice message");
                    self.emit(InboundEvent::Voice(ReceivedVoice {
                        from: from.clone(),
                        data,
                        timestamp: voice.timestamp,
                        chunk_id: None,
                    }));
                }
                None => self.emit(InboundEvent::CrcError {
                    from: from.clone(),
                    chunk_id: None,
                    chunk_num: None,
                }),
            },
            Envelope::Test(test) => {
                tracing::info!(%from, text = %test.test, "received test message");
                self.emit(InboundEvent::Test {
                    from: from.clone(),
                    text: test.test,
                });
            }
            Envelope::Ack(ack) => {
                tracing::info!(%from, ack_id = %ack.ack_id, chunk_num = ack.chunk_num, "received ack");
                self.emit(InboundEvent::Ack {
                    from: from.clone(),
                    ack_id: ack.ack_id,
                    chunk_num: ack.chunk_num,
                });
            }
        }
    }

    /// Run one timeout sweep and report what was abandoned.
    pub async fn sweep(&self, now: Instant) -> usize {
        let abandoned = self.reassembly.sweep_timeouts(now).await;
        let count = abandoned.len();
        for transfer in abandoned {
            self.emit(InboundEvent::TransferAbandoned(transfer));
        }
        count
    }

    fn on_chunk_outcome(&self, outcome: ChunkOutcome, chunk_id: &str, chunk_num: u32, from: &PeerId) {
        match outcome {
            ChunkOutcome::Completed(voice) => self.emit(InboundEvent::Voice(ReceivedVoice {
                from: voice.from,
                data: voice.data,
                timestamp: timestamp::now(),
                chunk_id: Some(voice.chunk_id),
            })),
            ChunkOutcome::CrcMismatch => self.emit(InboundEvent::CrcError {
                from: from.clone(),
                chunk_id: Some(chunk_id.to_string()),
                chunk_num: Some(chunk_num),
            }),
            ChunkOutcome::ReassemblyFailed { chunk_id, missing } => {
                self.emit(InboundEvent::TransferFailed { chunk_id, missing })
            }
            ChunkOutcome::Malformed(_)
            | ChunkOutcome::BeforeFirst
            | ChunkOutcome::Duplicate
            | ChunkOutcome::Stored { .. } => {}
        }
    }

    fn emit(&self, event: InboundEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("inbound event receiver dropped");
        }
    }
}
