//! Inbox: consumes inbound events and stores received voice messages.

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use voxmesh_services::{timestamp, InboundEvent, ReceivedVoice, VoiceCodec};

/// Give up on a name after this many taken suffixes.
const MAX_NAME_SUFFIX: u32 = 1000;

pub struct Inbox {
    dir: PathBuf,
    codec: Arc<dyn VoiceCodec>,
}

impl Inbox {
    pub fn new(dir: PathBuf, codec: Arc<dyn VoiceCodec>) -> Result<Self> {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create inbox {}", dir.display()))?;
        Ok(Self { dir, codec })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Decompress and write one voice message. Returns the file path.
    ///
    /// Never overwrites: a name already on disk gets a `-N` suffix.
    pub fn store(&self, voice: &ReceivedVoice) -> Result<PathBuf> {
        let pcm = self
            .codec
            .decompress(&voice.data)
            .with_context(|| format!("failed to decompress voice from {}", voice.from))?;

        let stem = file_stem(voice);
        for n in 0..MAX_NAME_SUFFIX {
            let path = match n {
                0 => self.dir.join(format!("{stem}.pcm")),
                n => self.dir.join(format!("{stem}-{n}.pcm")),
            };
            let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(e).with_context(|| format!("failed to create {}", path.display()))
                }
            };
            file.write_all(&pcm)
                .with_context(|| format!("failed to write {}", path.display()))?;
            tracing::info!(from = %voice.from, path = %path.display(), bytes = pcm.len(), "saved voice message");
            return Ok(path);
        }
        anyhow::bail!("no free file name for {stem} in {}", self.dir.display())
    }
}

/// `rec_<peer>_<timestamp>[_chunked]`, with the peer id made path-safe.
///
/// The timestamp arrives from the sender; anything not shaped like
/// `YYYYMMDD_HHMMSS` is replaced with the local receive time.
pub fn file_stem(voice: &ReceivedVoice) -> String {
    let peer: String = voice
        .from
        .as_str()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let stamp = if timestamp::is_well_formed(&voice.timestamp) {
        voice.timestamp.clone()
    } else {
        tracing::warn!(from = %voice.from, timestamp = ?voice.timestamp, "malformed sender timestamp, using receive time");
        timestamp::now()
    };
    let suffix = if voice.is_chunked() { "_chunked" } else { "" };
    format!("rec_{peer}_{stamp}{suffix}")
}

pub async fn inbox_loop(
    inbox: Inbox,
    mut events: mpsc::UnboundedReceiver<InboundEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let inbox = Arc::new(inbox);
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("inbox shutting down");
                return;
            }

            event = events.recv() => {
                let Some(event) = event else {
                    tracing::info!("inbound channel closed, inbox exiting");
                    return;
                };
                handle(&inbox, event).await;
            }
        }
    }
}

async fn handle(inbox: &Arc<Inbox>, event: InboundEvent) {
    match event {
        InboundEvent::Voice(voice) => {
            // Decompression and file I/O stay off the runtime workers.
            let inbox = inbox.clone();
            match tokio::task::spawn_blocking(move || inbox.store(&voice)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "failed to store voice message"),
                Err(e) => tracing::error!(error = %e, "inbox writer task failed"),
            }
        }
        InboundEvent::Test { from, text } => {
            tracing::info!(%from, %text, "test message");
        }
        InboundEvent::Ack { from, ack_id, chunk_num } => {
            tracing::debug!(%from, %ack_id, chunk_num, "chunk acknowledged");
        }
        InboundEvent::CrcError { from, chunk_id, chunk_num } => {
            tracing::warn!(%from, ?chunk_id, ?chunk_num, "integrity check failed");
        }
        InboundEvent::TransferFailed { chunk_id, missing } => {
            tracing::error!(%chunk_id, ?missing, "reassembly failed");
        }
        InboundEvent::TransferAbandoned(t) => {
            tracing::warn!(chunk_id = %t.chunk_id, from = %t.from, received = t.received, total = t.total, "transfer abandoned");
        }
    }
}
