//! voxmesh integration test harness.
//!
//! Each test brings up two nodes on loopback UDP, wired as each other's only
//! peer, and drives real traffic between them through the send pipeline,
//! the UDP adapter, inbound routing, and reassembly.
//!
//!   cargo test --test integration
//!
//! Nodes bind ephemeral ports, so tests can run in parallel.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};

use voxmesh_core::config::Pacing;
use voxmesh_services::{
    InboundEvent, InboundRouter, ReassemblyEngine, SendPipeline, SendSettings, UdpMeshTransport,
};

mod failures;
mod voice;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const APP_PORT: u32 = 256;
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(60);
const EVENT_WAIT: Duration = Duration::from_secs(5);

/// Retry and pacing shrunk so chunked sends finish in milliseconds.
pub fn fast_settings() -> SendSettings {
    SendSettings {
        app_port: APP_PORT,
        retry_count: 2,
        retry_delay: Duration::from_millis(10),
        pacing: Pacing {
            base: Duration::from_millis(2),
            bytes_per_sec: 1_000_000.0,
            max: Duration::from_millis(20),
        },
        ..SendSettings::default()
    }
}

pub struct Node {
    pub transport: Arc<UdpMeshTransport>,
    pub pipeline: Arc<SendPipeline>,
    pub engine: Arc<ReassemblyEngine>,
    pub router: Arc<InboundRouter>,
    pub events: mpsc::UnboundedReceiver<InboundEvent>,
    shutdown: broadcast::Sender<()>,
}

impl Node {
    fn start(transport: UdpMeshTransport) -> Self {
        let transport = Arc::new(transport);
        let engine = Arc::new(ReassemblyEngine::new(transport.clone(), APP_PORT, RECEIVE_TIMEOUT));
        let (router, events) = InboundRouter::new(APP_PORT, engine.clone());
        let router = Arc::new(router);
        let pipeline = Arc::new(SendPipeline::new(transport.clone(), fast_settings()));
        let (shutdown, _) = broadcast::channel(1);

        {
            let transport = transport.clone();
            let router = router.clone();
            let shutdown = shutdown.subscribe();
            tokio::spawn(async move { transport.receive_loop(router, shutdown).await });
        }

        Self {
            transport,
            pipeline,
            engine,
            router,
            events,
            shutdown,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.transport
            .local_addr()
            .unwrap_or_else(|e| panic!("node has no local address: {e}"))
    }

    /// Next inbound event, failing the test if none arrives in time.
    pub async fn next_event(&mut self) -> Result<InboundEvent> {
        tokio::time::timeout(EVENT_WAIT, self.events.recv())
            .await
            .context("timed out waiting for inbound event")?
            .context("inbound channel closed")
    }

    /// Drain events until one matches `pred`, skipping the rest.
    pub async fn wait_for(&mut self, pred: impl Fn(&InboundEvent) -> bool) -> Result<InboundEvent> {
        loop {
            let event = self.next_event().await?;
            if pred(&event) {
                return Ok(event);
            }
        }
    }

    /// Events that arrive within `window`.
    pub async fn collect_for(&mut self, window: Duration) -> Vec<InboundEvent> {
        let mut out = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, self.events.recv()).await {
            out.push(event);
        }
        out
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.pipeline.close();
        let _ = self.shutdown.send(());
    }
}

/// Two nodes, each the other's broadcast peer.
pub async fn pair() -> Result<(Node, Node)> {
    let mut a = UdpMeshTransport::bind("127.0.0.1:0", &[], Duration::from_secs(1)).await?;
    let mut b = UdpMeshTransport::bind("127.0.0.1:0", &[], Duration::from_secs(1)).await?;
    let (addr_a, addr_b) = (a.local_addr()?, b.local_addr()?);
    a.add_peer(addr_b);
    b.add_peer(addr_a);
    Ok((Node::start(a), Node::start(b)))
}

/// A bare socket for injecting hand-built datagrams.
pub async fn raw_socket() -> Result<UdpSocket> {
    Ok(UdpSocket::bind("127.0.0.1:0").await?)
}

/// Deterministic stand-in for recorded PCM: a tone under enough noise that
/// zstd cannot squeeze it into a single packet.
pub fn pcm(len: usize) -> Vec<u8> {
    let mut noise: u32 = 0x2545_f491;
    (0..len)
        .map(|i| {
            noise ^= noise << 13;
            noise ^= noise >> 17;
            noise ^= noise << 5;
            let tone = (i as f64 / 9.0).sin() * 80.0 + 128.0;
            (tone as i32 + (noise % 40) as i32 - 20).clamp(0, 255) as u8
        })
        .collect()
}

#[tokio::test]
async fn test_pair_comes_up() {
    let (a, b) = pair().await.unwrap();
    assert_ne!(a.addr(), b.addr());
    assert!(!a.pipeline.is_sending());
    assert_eq!(b.engine.in_progress().await, 0);
}
