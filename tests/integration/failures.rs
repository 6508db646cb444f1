use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;

use voxmesh_core::wire::{ChunkEnvelope, Envelope, TestEnvelope};
use voxmesh_services::udp::{frame, unframe};
use voxmesh_services::{Destination, InboundEvent, SendError};

use crate::*;

async fn inject(socket: &UdpSocket, to: std::net::SocketAddr, port: u32, envelope: Envelope) {
    let payload = envelope.encode().unwrap();
    socket.send_to(&frame(port, &payload), to).await.unwrap();
}

/// Next ack datagram delivered to a raw socket.
async fn recv_ack(socket: &UdpSocket) -> Envelope {
    let mut buf = [0u8; 512];
    let (len, _) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for ack")
        .unwrap();
    let (port, payload) = unframe(&buf[..len]).unwrap();
    assert_eq!(port, APP_PORT);
    Envelope::parse(payload).unwrap()
}

/// Acks leave before the chunk is stored, so poll for the table to catch up.
async fn settle(node: &Node, chunk_id: &str, expected: Option<(usize, u32)>) {
    for _ in 0..500 {
        if node.engine.progress(chunk_id).await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("transfer {chunk_id} never reached {expected:?}");
}

#[tokio::test]
async fn test_tampered_chunk_reports_crc_error() {
    let (_a, mut b) = pair().await.unwrap();
    let raw = raw_socket().await.unwrap();

    let mut chunk = ChunkEnvelope::new("deadbeef", 1, 2, b"first half");
    chunk.crc32 ^= 1;
    inject(&raw, b.addr(), APP_PORT, chunk.into()).await;

    let event = b.next_event().await.unwrap();
    assert!(matches!(
        event,
        InboundEvent::CrcError { chunk_id: Some(ref id), chunk_num: Some(1), .. } if id == "deadbeef"
    ));
    assert_eq!(b.engine.in_progress().await, 0);
}

#[tokio::test]
async fn test_chunk_before_first_is_dropped_until_resent() {
    let (_a, mut b) = pair().await.unwrap();
    let raw = raw_socket().await.unwrap();

    inject(&raw, b.addr(), APP_PORT, ChunkEnvelope::new("0ddba11a", 2, 2, b" world").into()).await;
    // Acked even though it cannot be stored yet.
    assert!(matches!(recv_ack(&raw).await, Envelope::Ack(ack) if ack.chunk_num == 2));
    assert_eq!(b.engine.in_progress().await, 0);

    inject(&raw, b.addr(), APP_PORT, ChunkEnvelope::new("0ddba11a", 1, 2, b"hello").into()).await;
    recv_ack(&raw).await;
    settle(&b, "0ddba11a", Some((1, 2))).await;

    inject(&raw, b.addr(), APP_PORT, ChunkEnvelope::new("0ddba11a", 2, 2, b" world").into()).await;
    let InboundEvent::Voice(voice) = b.next_event().await.unwrap() else {
        panic!("expected reassembled voice");
    };
    assert_eq!(voice.data, Bytes::from_static(b"hello world"));
    assert_eq!(voice.from.as_str(), raw.local_addr().unwrap().to_string());
}

#[tokio::test]
async fn test_foreign_port_and_garbage_are_ignored() {
    let (_a, mut b) = pair().await.unwrap();
    let raw = raw_socket().await.unwrap();

    inject(&raw, b.addr(), APP_PORT + 1, TestEnvelope::new("wrong port").into()).await;
    raw.send_to(&frame(APP_PORT, b"{not json"), b.addr()).await.unwrap();
    raw.send_to(b"\x00\x01", b.addr()).await.unwrap();
    inject(&raw, b.addr(), APP_PORT, TestEnvelope::new("right port").into()).await;

    let event = b.next_event().await.unwrap();
    assert!(matches!(event, InboundEvent::Test { ref text, .. } if text == "right port"));
}

#[tokio::test]
async fn test_closed_pipeline_refuses_sends() {
    let (a, _b) = pair().await.unwrap();
    a.pipeline.close();

    let err = a
        .pipeline
        .send_chunked(Bytes::from(pcm(800)), &Destination::Broadcast, 180)
        .await
        .unwrap_err();
    assert!(matches!(err, SendError::Closed), "{err}");
}

#[tokio::test]
async fn test_unreachable_peer_fails_chunk_after_retries() {
    let (a, _b) = pair().await.unwrap();
    let err = a
        .pipeline
        .send_chunked(
            Bytes::from(pcm(400)),
            &Destination::Peer("not-an-address".into()),
            180,
        )
        .await
        .unwrap_err();
    match err {
        SendError::ChunkFailed { chunk_num, attempts, .. } => {
            assert_eq!(chunk_num, 1);
            assert_eq!(attempts, fast_settings().retry_count + 1);
        }
        other => panic!("expected ChunkFailed, got {other}"),
    }
}

#[tokio::test]
async fn test_stalled_transfer_is_abandoned() {
    let (_a, mut b) = pair().await.unwrap();
    let raw = raw_socket().await.unwrap();

    inject(&raw, b.addr(), APP_PORT, ChunkEnvelope::new("5ta11ed0", 1, 3, b"one").into()).await;
    recv_ack(&raw).await;
    settle(&b, "5ta11ed0", Some((1, 3))).await;

    let now = tokio::time::Instant::now();
    assert_eq!(b.router.sweep(now).await, 0);
    assert_eq!(b.router.sweep(now + RECEIVE_TIMEOUT + Duration::from_secs(1)).await, 1);

    let InboundEvent::TransferAbandoned(t) = b.next_event().await.unwrap() else {
        panic!("expected abandoned transfer");
    };
    assert_eq!((t.chunk_id.as_str(), t.received, t.total), ("5ta11ed0", 1, 3));
    assert_eq!(b.engine.in_progress().await, 0);
}
