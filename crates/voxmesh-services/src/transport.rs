//! Transport boundary: the radio (or its stand-in) seen from the protocol.
//!
//! The protocol only needs to hand bytes to a destination on a numbered
//! application port. Everything below that line lives behind
//! [`MeshTransport`].

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;

use voxmesh_core::wire::BROADCAST_ADDR;

/// Opaque identifier of a mesh node, as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Where a packet should go.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Destination {
    /// Every node in range.
    #[default]
    Broadcast,
    /// A single node.
    Peer(PeerId),
}

impl Destination {
    /// `^all` is the broadcast alias; anything else names a peer.
    pub fn parse(s: &str) -> Self {
        if s == BROADCAST_ADDR {
            Destination::Broadcast
        } else {
            Destination::Peer(PeerId::new(s))
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Broadcast => f.write_str(BROADCAST_ADDR),
            Destination::Peer(id) => write!(f, "{id}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransmitError {
    #[error("cannot route to {0}")]
    UnknownDestination(String),

    #[error("no peers to broadcast to")]
    NoPeers,

    #[error("transport rejected packet: {0}")]
    Rejected(String),

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outbound half of the mesh radio.
///
/// `send` reports whether the packet was accepted for transmission, not
/// whether it arrived. Implementations must be safe to call from several
/// tasks; the send pipeline serialises its own traffic, but acks are sent
/// from the receive path concurrently.
#[async_trait]
pub trait MeshTransport: Send + Sync {
    async fn send(
        &self,
        payload: Bytes,
        destination: &Destination,
        port: u32,
        want_ack: bool,
    ) -> Result<(), TransmitError>;
}
