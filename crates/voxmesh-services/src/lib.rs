//! voxmesh-services holds the stateful halves of the voice transport: the send
//! pipeline, the reassembly engine, inbound routing, and the transport and
//! codec boundaries they run against.

pub mod codec;
pub mod inbound;
pub mod reassembly;
pub mod send_pipeline;
pub mod timestamp;
pub mod transport;
pub mod udp;

pub use codec::{CodecError, VoiceCodec, ZstdCodec};
pub use inbound::{InboundEvent, InboundRouter, ReceivedVoice};
pub use reassembly::{AbandonedTransfer, ChunkOutcome, ReassembledVoice, ReassemblyEngine};
pub use send_pipeline::{SendError, SendPipeline, SendReport, SendSettings, SendState};
pub use transport::{Destination, MeshTransport, PeerId, TransmitError};
pub use udp::UdpMeshTransport;
