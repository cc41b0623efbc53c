//! Shared helpers for integration tests.
//!
//! Tests talk over real UDP sockets on localhost; ports come from an
//! atomic allocator so parallel tests never collide.

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use rand::RngCore;
use tokio::net::UdpSocket;

use lanlink_core::config::DeviceConfig;
use lanlink_core::device::Device;
use lanlink_core::protocol::Frame;

static NEXT_PORT: AtomicU16 = AtomicU16::new(46200);

/// Allocate a localhost UDP port unique within this test binary.
pub fn next_port() -> u16 {
    NEXT_PORT.fetch_add(1, Ordering::SeqCst)
}

pub fn localhost(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Build and start two devices that bootstrap toward each other.
pub fn start_pair(
    name_a: &str,
    dir_a: &std::path::Path,
    name_b: &str,
    dir_b: &std::path::Path,
) -> (Device, Device) {
    let port_a = next_port();
    let port_b = next_port();

    let a = Device::bind(
        DeviceConfig::new(name_a, port_a)
            .bootstrap(localhost(port_b))
            .download_dir(dir_a),
    )
    .expect("bind device a");
    let b = Device::bind(
        DeviceConfig::new(name_b, port_b)
            .bootstrap(localhost(port_a))
            .download_dir(dir_b),
    )
    .expect("bind device b");

    a.start();
    b.start();
    (a, b)
}

/// Wait until `device` lists a peer called `name`, up to `timeout`.
pub async fn wait_for_peer(device: &Device, name: &str, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if device
            .list_active_peers()
            .await
            .iter()
            .any(|peer| peer.name == name)
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Receive the next decodable frame on `socket`, or `None` on timeout.
pub async fn recv_frame(socket: &UdpSocket, timeout: Duration) -> Option<(Frame, SocketAddr)> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut buf = vec![0u8; 2048];

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return None;
        }
        match tokio::time::timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, addr))) => {
                if let Ok(text) = std::str::from_utf8(&buf[..len]) {
                    if let Ok(frame) = Frame::decode(text) {
                        return Some((frame, addr));
                    }
                }
            }
            Ok(Err(_)) | Err(_) => return None,
        }
    }
}

/// Receive frames until one satisfies `pred`, skipping everything else
/// (heartbeat noise in particular), or `None` on timeout.
pub async fn recv_matching(
    socket: &UdpSocket,
    timeout: Duration,
    pred: impl Fn(&Frame) -> bool,
) -> Option<Frame> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return None;
        }
        let (frame, _) = recv_frame(socket, remaining).await?;
        if pred(&frame) {
            return Some(frame);
        }
    }
}
