//! voxmesh-core: wire format, integrity primitives, and chunk planning.
//! All other voxmesh crates depend on this one.

pub mod config;
pub mod integrity;
pub mod splitter;
pub mod wire;

#[cfg(test)]
mod proptests;

pub use config::VoxmeshConfig;
pub use splitter::SplitError;
pub use wire::{
    AckEnvelope, ChunkEnvelope, CompleteVoiceEnvelope, Envelope, TestEnvelope, WireError,
};
