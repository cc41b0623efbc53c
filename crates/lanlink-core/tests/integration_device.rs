//! Integration tests for device-to-device messaging and file transfer.
//!
//! These tests run real UDP traffic on localhost: either two full devices
//! bootstrapped toward each other, or one device probed by a raw socket
//! acting as a scripted peer (to observe retransmissions, withhold ACKs,
//! and inject corruption).

mod common;

use std::time::Duration;

use tokio::net::UdpSocket;

use lanlink_core::config::DeviceConfig;
use lanlink_core::device::Device;
use lanlink_core::protocol::Frame;
use lanlink_core::transfer::{digest_bytes, encode_chunk_payload, InboundStatus};
use lanlink_core::Error;

use common::{localhost, next_port, random_bytes, recv_matching, start_pair, wait_for_peer};

/// Bind a started device with nothing to bootstrap to.
fn solo_device(name: &str, download_dir: &std::path::Path) -> Device {
    let device = Device::bind(
        DeviceConfig::new(name, next_port())
            .bootstrap(localhost(next_port()))
            .download_dir(download_dir),
    )
    .expect("bind device");
    device.start();
    device
}

/// Raw UDP socket posing as a peer named `name` of `device`.
async fn scripted_peer(device: &Device, name: &str) -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind raw socket");
    let target = localhost(device.local_addr().expect("local addr").port());
    socket
        .send_to(
            Frame::Heartbeat {
                name: name.to_string(),
            }
            .encode()
            .as_bytes(),
            target,
        )
        .await
        .expect("send heartbeat");
    assert!(
        wait_for_peer(device, name, Duration::from_secs(2)).await,
        "device never recorded the scripted peer"
    );
    socket.connect(target).await.expect("connect raw socket");
    socket
}

async fn send_frame(socket: &UdpSocket, frame: &Frame) {
    socket
        .send(frame.encode().as_bytes())
        .await
        .expect("send frame");
}

#[tokio::test]
async fn test_end_to_end_file_transfer() {
    let dir_a = tempfile::tempdir().expect("tempdir");
    let dir_b = tempfile::tempdir().expect("tempdir");
    let (a, b) = start_pair("alpha", dir_a.path(), "beta", dir_b.path());

    assert!(wait_for_peer(&a, "beta", Duration::from_secs(5)).await);
    assert!(wait_for_peer(&b, "alpha", Duration::from_secs(5)).await);

    // 1500 bytes split into chunks of 512, 512, and 476.
    let content = random_bytes(1500);
    let source = dir_a.path().join("payload.bin");
    tokio::fs::write(&source, &content).await.expect("write source");

    let id = a.send_file("beta", &source).await.expect("send file");

    // Under no loss the whole transfer must finish well within 5 seconds.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while a.has_outbound_transfer().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "transfer did not complete in time"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(b.inbound_status(&id).await, Some(InboundStatus::Complete));
    let received = tokio::fs::read(dir_b.path().join("payload.bin"))
        .await
        .expect("read received file");
    assert_eq!(received.len(), 1500);
    assert_eq!(received, content);

    // The END delivery was acknowledged and cleared.
    assert_eq!(a.pending_deliveries().await, 0);

    a.stop();
    b.stop();
}

#[tokio::test]
async fn test_message_delivery_clears_pending() {
    let dir_a = tempfile::tempdir().expect("tempdir");
    let dir_b = tempfile::tempdir().expect("tempdir");
    let (a, b) = start_pair("mercury", dir_a.path(), "venus", dir_b.path());

    assert!(wait_for_peer(&a, "venus", Duration::from_secs(5)).await);
    let mut events = b.subscribe();

    a.send_message("venus", "hello from mercury")
        .await
        .expect("send message");

    let received = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            if let Ok(lanlink_core::device::DeviceEvent::TalkReceived { text, .. }) =
                events.recv().await
            {
                return text;
            }
        }
    })
    .await
    .expect("message never arrived");
    assert_eq!(received, "hello from mercury");

    // The ACK drains the pending-delivery set.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while a.pending_deliveries().await > 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "delivery never acknowledged"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    a.stop();
    b.stop();
}

#[tokio::test]
async fn test_send_message_unknown_peer_fails_without_network() {
    let dir = tempfile::tempdir().expect("tempdir");
    let device = solo_device("loner", dir.path());

    let result = device.send_message("Unknown", "hi").await;
    assert!(matches!(result, Err(Error::PeerNotFound(_))));
    assert_eq!(device.pending_deliveries().await, 0);

    device.stop();
}

#[tokio::test]
async fn test_send_file_rejects_missing_file_and_unknown_peer() {
    let dir = tempfile::tempdir().expect("tempdir");
    let device = solo_device("strict", dir.path());

    let missing = dir.path().join("nope.bin");
    assert!(matches!(
        device.send_file("anyone", &missing).await,
        Err(Error::FileNotFound(_))
    ));

    let real = dir.path().join("real.bin");
    tokio::fs::write(&real, b"data").await.expect("write");
    assert!(matches!(
        device.send_file("nobody-heartbeated", &real).await,
        Err(Error::PeerNotFound(_))
    ));

    device.stop();
}

#[tokio::test]
async fn test_single_outbound_transfer_slot() {
    let dir = tempfile::tempdir().expect("tempdir");
    let device = solo_device("busy", dir.path());
    let peer = scripted_peer(&device, "ghost").await;

    let file = dir.path().join("first.bin");
    tokio::fs::write(&file, random_bytes(100)).await.expect("write");

    device.send_file("ghost", &file).await.expect("first send");
    // The scripted peer never acknowledges the offer, so the slot stays
    // occupied and a second transfer is refused.
    assert!(matches!(
        device.send_file("ghost", &file).await,
        Err(Error::TransferInProgress)
    ));

    drop(peer);
    device.stop();
}

#[tokio::test]
async fn test_unacked_message_is_retransmitted_verbatim() {
    let dir = tempfile::tempdir().expect("tempdir");
    let device = solo_device("persistent", dir.path());
    let peer = scripted_peer(&device, "ghost").await;

    let id = device
        .send_message("ghost", "are you there")
        .await
        .expect("send message");

    // Never acknowledge; count identical arrivals over ~7 seconds. The
    // retry loop fires roughly every 2 seconds, so at least the original
    // plus two retransmissions must show up.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(7);
    let mut copies = 0;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        let matched = recv_matching(&peer, remaining, |frame| {
            matches!(frame, Frame::Talk { id: got, text } if *got == id && text == "are you there")
        })
        .await;
        if matched.is_some() {
            copies += 1;
        }
    }
    assert!(copies >= 3, "expected >= 3 transmissions, saw {copies}");
    assert_eq!(device.pending_deliveries().await, 1);

    device.stop();
}

#[tokio::test]
async fn test_idempotent_chunk_reception_and_save() {
    let dir = tempfile::tempdir().expect("tempdir");
    let device = solo_device("receiver", dir.path());
    let peer = scripted_peer(&device, "ghost").await;

    let content = random_bytes(600);
    let id = "t-idem";
    let is_ack = |frame: &Frame| matches!(frame, Frame::Ack { id: got } if got == id);

    send_frame(
        &peer,
        &Frame::FileOffer {
            id: id.to_string(),
            filename: "blob.bin".to_string(),
            size: 600,
        },
    )
    .await;
    assert!(recv_matching(&peer, Duration::from_secs(2), is_ack).await.is_some());

    let chunk0 = Frame::Chunk {
        id: id.to_string(),
        seq: 0,
        payload: encode_chunk_payload(&content[..512]),
    };
    send_frame(&peer, &chunk0).await;
    assert!(recv_matching(&peer, Duration::from_secs(2), is_ack).await.is_some());

    // The duplicate is acknowledged again but stored only once.
    send_frame(&peer, &chunk0).await;
    assert!(recv_matching(&peer, Duration::from_secs(2), is_ack).await.is_some());

    send_frame(
        &peer,
        &Frame::Chunk {
            id: id.to_string(),
            seq: 1,
            payload: encode_chunk_payload(&content[512..]),
        },
    )
    .await;
    assert!(recv_matching(&peer, Duration::from_secs(2), is_ack).await.is_some());

    send_frame(
        &peer,
        &Frame::End {
            id: id.to_string(),
            digest: digest_bytes(&content),
        },
    )
    .await;
    let final_ack = recv_matching(&peer, Duration::from_secs(2), |frame| {
        matches!(frame, Frame::Ack { id: got } if got == "t-idem_END")
    })
    .await;
    assert!(final_ack.is_some(), "END never acknowledged");

    assert_eq!(device.inbound_status(id).await, Some(InboundStatus::Complete));
    let saved = tokio::fs::read(dir.path().join("blob.bin"))
        .await
        .expect("auto-saved file");
    assert_eq!(saved, content);

    // Explicit save to another path reproduces the same bytes.
    let copy = dir.path().join("copy.bin");
    device
        .save_received_transfer(id, &copy)
        .await
        .expect("explicit save");
    assert_eq!(tokio::fs::read(&copy).await.expect("read copy"), content);

    device.stop();
}

#[tokio::test]
async fn test_corrupted_chunk_yields_nack_and_rejection() {
    let dir = tempfile::tempdir().expect("tempdir");
    let device = solo_device("vigilant", dir.path());
    let peer = scripted_peer(&device, "ghost").await;

    let content = random_bytes(512);
    let mut corrupted = content.clone();
    corrupted[100] ^= 0xFF;
    let id = "t-bad";

    send_frame(
        &peer,
        &Frame::FileOffer {
            id: id.to_string(),
            filename: "corrupt.bin".to_string(),
            size: 512,
        },
    )
    .await;
    assert!(recv_matching(&peer, Duration::from_secs(2), |frame| {
        matches!(frame, Frame::Ack { id: got } if got == id)
    })
    .await
    .is_some());

    send_frame(
        &peer,
        &Frame::Chunk {
            id: id.to_string(),
            seq: 0,
            payload: encode_chunk_payload(&corrupted),
        },
    )
    .await;
    assert!(recv_matching(&peer, Duration::from_secs(2), |frame| {
        matches!(frame, Frame::Ack { id: got } if got == id)
    })
    .await
    .is_some());

    // The declared digest is for the uncorrupted bytes.
    send_frame(
        &peer,
        &Frame::End {
            id: id.to_string(),
            digest: digest_bytes(&content),
        },
    )
    .await;

    let nack = recv_matching(&peer, Duration::from_secs(2), |frame| {
        matches!(frame, Frame::Nack { id: got, .. } if got == "t-bad_END")
    })
    .await;
    match nack {
        Some(Frame::Nack { reason, .. }) => assert_eq!(reason, "integrity_mismatch"),
        other => panic!("expected NACK, got {other:?}"),
    }

    assert_eq!(device.inbound_status(id).await, Some(InboundStatus::Rejected));
    assert!(!dir.path().join("corrupt.bin").exists());

    device.stop();
}

#[tokio::test]
async fn test_hostile_declared_size_leaves_device_responsive() {
    let dir = tempfile::tempdir().expect("tempdir");
    let device = solo_device("hardened", dir.path());
    let peer = scripted_peer(&device, "ghost").await;

    let id = "t-huge";
    send_frame(
        &peer,
        &Frame::FileOffer {
            id: id.to_string(),
            filename: "huge.bin".to_string(),
            size: u64::MAX,
        },
    )
    .await;
    assert!(recv_matching(&peer, Duration::from_secs(2), |frame| {
        matches!(frame, Frame::Ack { id: got } if got == id)
    })
    .await
    .is_some());

    // Nothing was received for the transfer, so END can only mismatch;
    // it must be answered with a NACK, not crash the receive loop.
    send_frame(
        &peer,
        &Frame::End {
            id: id.to_string(),
            digest: digest_bytes(b"anything"),
        },
    )
    .await;
    assert!(recv_matching(&peer, Duration::from_secs(2), |frame| {
        matches!(frame, Frame::Nack { id: got, .. } if got == "t-huge_END")
    })
    .await
    .is_some());
    assert_eq!(device.inbound_status(id).await, Some(InboundStatus::Rejected));

    // The device is still processing frames afterwards.
    send_frame(
        &peer,
        &Frame::Talk {
            id: "m-after".to_string(),
            text: "still alive?".to_string(),
        },
    )
    .await;
    assert!(recv_matching(&peer, Duration::from_secs(2), |frame| {
        matches!(frame, Frame::Ack { id: got } if got == "m-after")
    })
    .await
    .is_some());

    device.stop();
}

#[tokio::test]
async fn test_stop_and_wait_gates_next_chunk() {
    let dir = tempfile::tempdir().expect("tempdir");
    let device = solo_device("sender", dir.path());
    let peer = scripted_peer(&device, "ghost").await;

    let source = dir.path().join("three-chunks.bin");
    tokio::fs::write(&source, random_bytes(1500)).await.expect("write");

    let id = device.send_file("ghost", &source).await.expect("send file");

    let offer = recv_matching(&peer, Duration::from_secs(2), |frame| {
        matches!(frame, Frame::FileOffer { id: got, .. } if *got == id)
    })
    .await;
    assert!(offer.is_some(), "offer never arrived");
    send_frame(&peer, &Frame::Ack { id: id.clone() }).await;

    let first = recv_matching(&peer, Duration::from_secs(2), |frame| {
        matches!(frame, Frame::Chunk { seq: 0, .. })
    })
    .await;
    assert!(first.is_some(), "chunk 0 never arrived");

    // Withhold the ACK: chunk 1 must not appear while chunk 0 is
    // unconfirmed (observation window shorter than the retry timeout).
    let premature = recv_matching(&peer, Duration::from_millis(1200), |frame| {
        matches!(frame, Frame::Chunk { seq, .. } if *seq >= 1)
    })
    .await;
    assert!(premature.is_none(), "chunk 1 sent before chunk 0 was acknowledged");

    send_frame(&peer, &Frame::Ack { id: id.clone() }).await;
    let second = recv_matching(&peer, Duration::from_secs(2), |frame| {
        matches!(frame, Frame::Chunk { seq: 1, .. })
    })
    .await;
    assert!(second.is_some(), "chunk 1 never followed the acknowledgment");

    device.stop();
}
