//! UDP mesh adapter: stands in for the radio driver.
//!
//! Each datagram is `[app_port: u32 BE][payload]`. A broadcast fans out to
//! every configured peer; a peer destination is a socket address. The
//! sender's socket address is its peer id on receipt, so acks find their
//! way back without any node table.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use crate::inbound::InboundRouter;
use crate::transport::{Destination, MeshTransport, PeerId, TransmitError};

/// Port prefix length.
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest payload a LoRa mesh packet carries; bigger sends are refused the
/// way the radio would refuse them.
pub const DEFAULT_MAX_PAYLOAD: usize = 237;

pub fn frame(port: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.put_u32(port);
    buf.put_slice(payload);
    buf.freeze()
}

pub fn unframe(datagram: &[u8]) -> Option<(u32, &[u8])> {
    let header: [u8; FRAME_HEADER_LEN] = datagram.get(..FRAME_HEADER_LEN)?.try_into().ok()?;
    Some((u32::from_be_bytes(header), &datagram[FRAME_HEADER_LEN..]))
}

pub struct UdpMeshTransport {
    socket: Arc<UdpSocket>,
    peers: Vec<SocketAddr>,
    max_payload: usize,
}

impl UdpMeshTransport {
    /// Bind `bind_addr`, giving up after `connect_timeout`.
    pub async fn bind(
        bind_addr: &str,
        peers: &[String],
        connect_timeout: Duration,
    ) -> io::Result<Self> {
        let peers = peers
            .iter()
            .map(|p| {
                p.parse::<SocketAddr>().map_err(|e| {
                    io::Error::new(io::ErrorKind::InvalidInput, format!("peer {p:?}: {e}"))
                })
            })
            .collect::<io::Result<Vec<_>>>()?;

        let socket = match tokio::time::timeout(connect_timeout, UdpSocket::bind(bind_addr)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("binding {bind_addr} took longer than {}s", connect_timeout.as_secs()),
                ))
            }
        };
        tracing::info!(addr = %socket.local_addr()?, peers = peers.len(), "mesh adapter bound");

        Ok(Self {
            socket: Arc::new(socket),
            peers,
            max_payload: DEFAULT_MAX_PAYLOAD,
        })
    }

    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    pub fn add_peer(&mut self, peer: SocketAddr) {
        if !self.peers.contains(&peer) {
            self.peers.push(peer);
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Feed every received datagram to `router` until shutdown.
    pub async fn receive_loop(
        &self,
        router: Arc<InboundRouter>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> io::Result<()> {
        let mut buf = vec![0u8; 65536];
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("receive loop shutting down");
                    return Ok(());
                }

                result = self.socket.recv_from(&mut buf) => {
                    let (len, addr) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "recv_from failed");
                            continue;
                        }
                    };
                    let Some((port, payload)) = unframe(&buf[..len]) else {
                        tracing::trace!(%addr, len, "datagram too short, discarding");
                        continue;
                    };
                    router.on_packet(port, payload, &PeerId::new(addr.to_string())).await;
                }
            }
        }
    }

    async fn send_to(&self, datagram: &[u8], addr: SocketAddr) -> Result<(), TransmitError> {
        let sent = self.socket.send_to(datagram, addr).await?;
        if sent != datagram.len() {
            return Err(TransmitError::Rejected(format!(
                "short send to {addr}: {sent}/{} bytes",
                datagram.len()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl MeshTransport for UdpMeshTransport {
    async fn send(
        &self,
        payload: Bytes,
        destination: &Destination,
        port: u32,
        want_ack: bool,
    ) -> Result<(), TransmitError> {
        if payload.len() > self.max_payload {
            return Err(TransmitError::Rejected(format!(
                "payload of {} bytes exceeds {} byte limit",
                payload.len(),
                self.max_payload
            )));
        }
        let datagram = frame(port, &payload);
        tracing::trace!(%destination, port, want_ack, bytes = payload.len(), "udp send");

        match destination {
            Destination::Peer(id) => {
                let addr: SocketAddr = id
                    .as_str()
                    .parse()
                    .map_err(|_| TransmitError::UnknownDestination(id.to_string()))?;
                self.send_to(&datagram, addr).await
            }
            Destination::Broadcast => {
                if self.peers.is_empty() {
                    return Err(TransmitError::NoPeers);
                }
                let mut delivered = 0;
                let mut last_err = None;
                for &addr in &self.peers {
                    match self.send_to(&datagram, addr).await {
                        Ok(()) => delivered += 1,
                        Err(e) => {
                            tracing::warn!(%addr, error = %e, "broadcast send to peer failed");
                            last_err = Some(e);
                        }
                    }
                }
                match last_err {
                    Some(e) if delivered == 0 => Err(e),
                    _ => Ok(()),
                }
            }
        }
    }
}
