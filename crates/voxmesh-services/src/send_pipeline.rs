//! Send pipeline: one logical outbound message at a time.
//!
//! A chunked send walks `Splitting → SendingChunk(n) → Waiting(n) → …` and
//! ends in `Completed` or `Aborted`. Each chunk is retried a bounded number
//! of times on transmit failure; once a chunk is given up on, the rest of the
//! message is never sent, since the receiver could not complete it anyway.
//!
//! A single-flight guard (mutex plus "sending" flag) keeps single-packet and
//! chunked sends from interleaving. Waiting for the guard is bounded; a
//! caller that cannot get it in time gets [`SendError::Busy`].

use bytes::Bytes;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, MutexGuard};

use voxmesh_core::config::{Pacing, VoxmeshConfig};
use voxmesh_core::splitter::{self, SplitError};
use voxmesh_core::wire::{
    generate_chunk_id, ChunkEnvelope, CompleteVoiceEnvelope, Envelope, TestEnvelope, WireError,
};

use crate::timestamp;
use crate::transport::{Destination, MeshTransport, TransmitError};

/// Guard wait for single-packet sends.
pub const SINGLE_LOCK_WAIT: Duration = Duration::from_secs(1);
/// Guard wait for chunked sends.
pub const CHUNKED_LOCK_WAIT: Duration = Duration::from_secs(5);

/// Tunables for the pipeline, normally derived from [`VoxmeshConfig`].
#[derive(Debug, Clone)]
pub struct SendSettings {
    pub app_port: u32,
    /// Retries after the first failed attempt of a chunk.
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub pacing: Pacing,
    pub single_lock_wait: Duration,
    pub chunked_lock_wait: Duration,
}

impl SendSettings {
    pub fn from_config(config: &VoxmeshConfig) -> Self {
        Self {
            app_port: config.network.app_port,
            retry_count: config.chunking.retry_count,
            retry_delay: config.chunking.retry_delay(),
            pacing: config.chunking.pacing(),
            single_lock_wait: SINGLE_LOCK_WAIT,
            chunked_lock_wait: CHUNKED_LOCK_WAIT,
        }
    }
}

impl Default for SendSettings {
    fn default() -> Self {
        Self::from_config(&VoxmeshConfig::default())
    }
}

/// Where the pipeline is in the current (or last) send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    Idle,
    Splitting,
    SendingChunk(u32),
    Waiting(u32),
    Completed,
    Aborted,
}

/// What a successful send did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendReport {
    /// Empty input; nothing was transmitted.
    NothingToSend,
    SinglePacket { bytes: usize },
    Chunked {
        chunk_id: String,
        chunks: u32,
        bytes: usize,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("another send is in progress")]
    Busy,

    #[error(transparent)]
    Split(#[from] SplitError),

    #[error(transparent)]
    Envelope(#[from] WireError),

    #[error("transmit failed: {0}")]
    Transmit(#[source] TransmitError),

    #[error("chunk {chunk_num}/{total_chunks} failed after {attempts} attempts: {source}")]
    ChunkFailed {
        chunk_num: u32,
        total_chunks: u32,
        attempts: u32,
        #[source]
        source: TransmitError,
    },

    #[error("send pipeline is closed")]
    Closed,
}

pub struct SendPipeline {
    transport: Arc<dyn MeshTransport>,
    settings: SendSettings,
    guard: Mutex<()>,
    sending: AtomicBool,
    state: watch::Sender<SendState>,
    closed: watch::Sender<bool>,
}

/// Holds the single-flight guard; clears the sending flag on every exit path.
struct InFlight<'a> {
    _lock: MutexGuard<'a, ()>,
    sending: &'a AtomicBool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.sending.store(false, Ordering::SeqCst);
    }
}

impl SendPipeline {
    pub fn new(transport: Arc<dyn MeshTransport>, settings: SendSettings) -> Self {
        Self {
            transport,
            settings,
            guard: Mutex::new(()),
            sending: AtomicBool::new(false),
            state: watch::Sender::new(SendState::Idle),
            closed: watch::Sender::new(false),
        }
    }

    /// True while a send holds the guard.
    pub fn is_sending(&self) -> bool {
        self.sending.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SendState {
        *self.state.borrow()
    }

    /// Abort any in-flight send and refuse new ones.
    pub fn close(&self) {
        if !self.closed.send_replace(true) {
            tracing::info!("send pipeline closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    // ── Public sends ──────────────────────────────────────────────────────────

    /// Send a compressed voice payload, as one packet when the complete
    /// envelope fits `budget` and as chunks otherwise.
    pub async fn send_voice(
        &self,
        data: Bytes,
        destination: &Destination,
        budget: usize,
    ) -> Result<SendReport, SendError> {
        let captured = timestamp::now();
        let encoded = Envelope::from(CompleteVoiceEnvelope::new(&data, captured.as_str()))
            .encode()?
            .len();
        if encoded <= budget {
            tracing::debug!(bytes = data.len(), encoded, budget, "voice fits one packet");
            self.send_complete_voice(&data, &captured, destination).await
        } else {
            tracing::debug!(bytes = data.len(), encoded, budget, "voice needs chunking");
            self.send_chunked(data, destination, budget).await
        }
    }

    /// Send a voice payload small enough for one packet.
    pub async fn send_complete_voice(
        &self,
        data: &[u8],
        timestamp: &str,
        destination: &Destination,
    ) -> Result<SendReport, SendError> {
        let payload = Envelope::from(CompleteVoiceEnvelope::new(data, timestamp)).encode()?;
        self.send_single(payload, destination, "complete voice message").await
    }

    /// Send a connectivity probe.
    pub async fn send_test(
        &self,
        text: &str,
        destination: &Destination,
    ) -> Result<SendReport, SendError> {
        let payload = Envelope::from(TestEnvelope::new(text)).encode()?;
        self.send_single(payload, destination, "test message").await
    }

    /// Split `data` to fit `budget` and send every chunk in order.
    pub async fn send_chunked(
        &self,
        data: Bytes,
        destination: &Destination,
        budget: usize,
    ) -> Result<SendReport, SendError> {
        let _in_flight = self.acquire(self.settings.chunked_lock_wait).await?;
        let started = Instant::now();

        self.set_state(SendState::Splitting);
        let chunks = match splitter::split(&data, budget) {
            Ok(chunks) => chunks,
            Err(e) => {
                tracing::error!(budget, bytes = data.len(), error = %e, "cannot split message");
                self.set_state(SendState::Aborted);
                return Err(e.into());
            }
        };
        if chunks.is_empty() {
            tracing::warn!("no chunks generated, nothing to send");
            self.set_state(SendState::Completed);
            return Ok(SendReport::NothingToSend);
        }

        let chunk_id = generate_chunk_id();
        // `split` already checked the count fits the counter range.
        let total = chunks.len() as u32;
        tracing::info!(%chunk_id, total_chunks = total, bytes = data.len(), budget, %destination, "sending chunked message");

        for (i, raw) in chunks.iter().enumerate() {
            let chunk_num = i as u32 + 1;
            let payload = Envelope::from(ChunkEnvelope::new(&chunk_id, chunk_num, total, raw))
                .encode()
                .inspect_err(|_| self.set_state(SendState::Aborted))?;

            if let Err(e) = self
                .transmit_chunk(&payload, destination, &chunk_id, chunk_num, total)
                .await
            {
                self.set_state(SendState::Aborted);
                match &e {
                    SendError::Closed => {
                        tracing::warn!(%chunk_id, chunk_num, total_chunks = total, "chunked send aborted by close")
                    }
                    _ => {
                        tracing::error!(%chunk_id, chunk_num, total_chunks = total, error = %e, "aborting message")
                    }
                }
                return Err(e);
            }

            if chunk_num < total {
                let delay = self.settings.pacing.delay(payload.len());
                self.set_state(SendState::Waiting(chunk_num));
                tracing::debug!(%chunk_id, chunk_num, delay_ms = delay.as_millis() as u64, "pacing before next chunk");
                if let Err(e) = self.pause(delay).await {
                    self.set_state(SendState::Aborted);
                    tracing::warn!(%chunk_id, chunk_num, total_chunks = total, "chunked send aborted by close");
                    return Err(e);
                }
            }
        }

        self.set_state(SendState::Completed);
        tracing::info!(
            %chunk_id,
            total_chunks = total,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "all chunks sent"
        );
        Ok(SendReport::Chunked {
            chunk_id,
            chunks: total,
            bytes: data.len(),
        })
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    /// One transmit attempt with an immediate result.
    async fn send_single(
        &self,
        payload: Bytes,
        destination: &Destination,
        description: &'static str,
    ) -> Result<SendReport, SendError> {
        let _in_flight = self.acquire(self.settings.single_lock_wait).await?;
        let bytes = payload.len();
        tracing::info!(bytes, %destination, "sending {description}");

        let result = self
            .cancellable(self.transport.send(payload, destination, self.settings.app_port, true))
            .await?;
        match result {
            Ok(()) => {
                tracing::debug!("{description} accepted by transport");
                Ok(SendReport::SinglePacket { bytes })
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to send {description}");
                Err(SendError::Transmit(e))
            }
        }
    }

    /// Transmit one chunk, retrying the same bytes on failure.
    async fn transmit_chunk(
        &self,
        payload: &Bytes,
        destination: &Destination,
        chunk_id: &str,
        chunk_num: u32,
        total: u32,
    ) -> Result<(), SendError> {
        let mut attempt: u32 = 1;
        loop {
            self.set_state(SendState::SendingChunk(chunk_num));
            tracing::debug!(chunk_id, chunk_num, total_chunks = total, attempt, "sending chunk");

            let result = self
                .cancellable(self.transport.send(
                    payload.clone(),
                    destination,
                    self.settings.app_port,
                    true,
                ))
                .await?;

            match result {
                Ok(()) => return Ok(()),
                Err(e) if attempt > self.settings.retry_count => {
                    return Err(SendError::ChunkFailed {
                        chunk_num,
                        total_chunks: total,
                        attempts: attempt,
                        source: e,
                    });
                }
                Err(e) => {
                    tracing::warn!(chunk_id, chunk_num, attempt, error = %e, "chunk transmit failed, retrying");
                    self.pause(self.settings.retry_delay).await?;
                    attempt += 1;
                }
            }
        }
    }

    async fn acquire(&self, wait: Duration) -> Result<InFlight<'_>, SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        let lock = match tokio::time::timeout(wait, self.guard.lock()).await {
            Ok(lock) => lock,
            Err(_) => {
                tracing::warn!(wait_ms = wait.as_millis() as u64, "could not acquire send guard");
                return Err(SendError::Busy);
            }
        };
        // Closed while we were queued behind another send.
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        self.sending.store(true, Ordering::SeqCst);
        Ok(InFlight {
            _lock: lock,
            sending: &self.sending,
        })
    }

    async fn pause(&self, delay: Duration) -> Result<(), SendError> {
        self.cancellable(tokio::time::sleep(delay)).await
    }

    /// Run `fut` unless the pipeline is closed first.
    async fn cancellable<F: Future>(&self, fut: F) -> Result<F::Output, SendError> {
        let closed = wait_closed(self.closed.subscribe());
        tokio::select! {
            biased;
            _ = closed => Err(SendError::Closed),
            out = fut => Ok(out),
        }
    }

    fn set_state(&self, state: SendState) {
        self.state.send_replace(state);
    }
}

async fn wait_closed(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            // Sender lives as long as the pipeline.
            std::future::pending::<()>().await;
        }
    }
}
