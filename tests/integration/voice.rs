use bytes::Bytes;
use std::time::Duration;

use voxmesh_services::{Destination, InboundEvent, SendReport, VoiceCodec, ZstdCodec};

use crate::*;

fn is_voice(event: &InboundEvent) -> bool {
    matches!(event, InboundEvent::Voice(_))
}

#[tokio::test]
async fn test_single_packet_voice_roundtrip() {
    let (a, mut b) = pair().await.unwrap();
    let codec = ZstdCodec::default();
    // Highly compressible, so it fits one packet.
    let recording = vec![128u8; 2000];
    let compressed = codec.compress(&recording, "Ultra Low").unwrap();

    let report = a
        .pipeline
        .send_voice(Bytes::from(compressed), &Destination::Broadcast, 200)
        .await
        .unwrap();
    assert!(matches!(report, SendReport::SinglePacket { .. }), "{report:?}");

    let InboundEvent::Voice(voice) = b.wait_for(is_voice).await.unwrap() else {
        unreachable!()
    };
    assert!(!voice.is_chunked());
    assert_eq!(voice.from.as_str(), a.addr().to_string());
    assert_eq!(codec.decompress(&voice.data).unwrap(), recording);
}

#[tokio::test]
async fn test_chunked_voice_roundtrip() {
    let (a, mut b) = pair().await.unwrap();
    let codec = ZstdCodec::default();
    let recording = pcm(3000);
    let compressed = codec.compress(&recording, "Low").unwrap();
    assert!(compressed.len() > 200, "test data compressed too well");

    let report = a
        .pipeline
        .send_voice(Bytes::from(compressed.clone()), &Destination::Broadcast, 180)
        .await
        .unwrap();
    let SendReport::Chunked { chunk_id, chunks, .. } = report else {
        panic!("expected a chunked send, got {report:?}");
    };
    assert!(chunks > 1);

    let InboundEvent::Voice(voice) = b.wait_for(is_voice).await.unwrap() else {
        unreachable!()
    };
    assert_eq!(voice.chunk_id.as_deref(), Some(chunk_id.as_str()));
    assert_eq!(voice.data.as_ref(), compressed.as_slice());
    assert_eq!(codec.decompress(&voice.data).unwrap(), recording);
    assert_eq!(b.engine.in_progress().await, 0);
}

#[tokio::test]
async fn test_sender_receives_an_ack_per_chunk() {
    let (mut a, _b) = pair().await.unwrap();
    let payload = Bytes::from(pcm(1200));

    let report = a
        .pipeline
        .send_chunked(payload, &Destination::Broadcast, 180)
        .await
        .unwrap();
    let SendReport::Chunked { chunk_id, chunks, .. } = report else {
        panic!("expected a chunked send");
    };

    let mut acked = Vec::new();
    while acked.len() < chunks as usize {
        match a.next_event().await.unwrap() {
            InboundEvent::Ack { ack_id, chunk_num, .. } => {
                assert_eq!(ack_id, chunk_id);
                acked.push(chunk_num);
            }
            other => panic!("unexpected event at sender: {other:?}"),
        }
    }
    acked.sort_unstable();
    assert_eq!(acked, (1..=chunks).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_message_reaches_peer() {
    let (a, mut b) = pair().await.unwrap();
    a.pipeline
        .send_test("radio check", &Destination::Broadcast)
        .await
        .unwrap();

    let event = b.next_event().await.unwrap();
    assert_eq!(
        event,
        InboundEvent::Test {
            from: a.addr().to_string().as_str().into(),
            text: "radio check".into(),
        }
    );
}

#[tokio::test]
async fn test_unicast_to_peer_address() {
    let (a, mut b) = pair().await.unwrap();
    let target = Destination::Peer(b.addr().to_string().as_str().into());
    a.pipeline.send_test("direct", &target).await.unwrap();

    let events = b.collect_for(Duration::from_millis(300)).await;
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], InboundEvent::Test { text, .. } if text == "direct"));
}

#[tokio::test]
async fn test_back_to_back_messages_stay_separate() {
    let (a, mut b) = pair().await.unwrap();
    let first = Bytes::from(pcm(700));
    let second = Bytes::from(pcm(900).into_iter().rev().collect::<Vec<_>>());

    a.pipeline
        .send_chunked(first.clone(), &Destination::Broadcast, 200)
        .await
        .unwrap();
    a.pipeline
        .send_chunked(second.clone(), &Destination::Broadcast, 200)
        .await
        .unwrap();

    let mut received = Vec::new();
    while received.len() < 2 {
        if let InboundEvent::Voice(voice) = b.wait_for(is_voice).await.unwrap() {
            received.push(voice.data);
        }
    }
    assert_eq!(received, vec![first, second]);
}
