//! The device orchestrator and its background loops.
//!
//! A [`Device`] owns the UDP socket, the peer directory, the pending-
//! delivery tracker, and the transfer state, and drives everything from
//! three background tasks:
//!
//! - **receive loop**: blocks on the socket, decodes each datagram, and
//!   dispatches on the frame kind
//! - **heartbeat loop**: announces liveness to every known peer every 5
//!   seconds (or to the bootstrap address while no peers are known)
//! - **retry loop**: every 100ms retransmits unacknowledged sends older
//!   than 2 seconds
//!
//! A fourth, short-lived task runs per outbound file transfer, pushing
//! chunks stop-and-wait style. All shared state sits behind one coarse
//! mutex; the socket itself is safe for concurrent sends.
//!
//! Shutdown clears a running flag and broadcasts on a shutdown channel;
//! the receive loop's blocking call is raced against that channel so no
//! task outlives [`Device::stop`] by more than one wake-up.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use crate::config::DeviceConfig;
use crate::delivery::DeliveryTracker;
use crate::error::{Error, Result};
use crate::peers::PeerDirectory;
use crate::protocol::{end_delivery_id, Frame, MAX_DATAGRAM_SIZE};
use crate::transfer::{
    decode_chunk_payload, encode_chunk_payload, file_digest, ChunkOutcome, InboundStatus,
    InboundTransfer, OutboundTransfer,
};
use crate::{CHUNK_ACK_ATTEMPTS, CHUNK_SIZE, HEARTBEAT_INTERVAL, RETRY_TICK};

/// A peer as reported to the front-end.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Peer name
    pub name: String,
    /// Last address the peer was heard from
    pub addr: SocketAddr,
    /// Time since the peer's last heartbeat
    pub age: Duration,
}

/// Notifications emitted for the front-end to print.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// A peer was heard from for the first time
    PeerDiscovered {
        /// Peer name
        name: String,
        /// Source address of its heartbeat
        addr: SocketAddr,
    },
    /// A text message arrived
    TalkReceived {
        /// Sender address
        from: SocketAddr,
        /// Message body
        text: String,
    },
    /// A file transfer was offered to us
    TransferOffered {
        /// Transfer identifier
        id: String,
        /// Declared file name
        filename: String,
        /// Declared size in bytes
        size: u64,
        /// Offering peer's address
        from: SocketAddr,
    },
    /// An inbound transfer verified and was saved
    TransferComplete {
        /// Transfer identifier
        id: String,
        /// Path the file was saved to
        path: PathBuf,
    },
    /// An inbound transfer failed its integrity check
    TransferRejected {
        /// Transfer identifier
        id: String,
    },
    /// Our outbound transfer was acknowledged end to end
    OutboundFinished {
        /// Transfer identifier
        id: String,
    },
    /// Our outbound transfer was abandoned after a NACK
    OutboundFailed {
        /// Transfer identifier
        id: String,
        /// Reason reported by the receiver
        reason: String,
    },
}

/// Shared state mutated by the background loops.
#[derive(Default)]
struct State {
    peers: PeerDirectory,
    pending: DeliveryTracker,
    outbound: Option<OutboundTransfer>,
    inbound: HashMap<String, InboundTransfer>,
}

struct Shared {
    config: DeviceConfig,
    socket: Arc<UdpSocket>,
    state: Mutex<State>,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    events_tx: broadcast::Sender<DeviceEvent>,
}

/// One participant in the mesh: a name, a bound UDP socket, and the
/// reliability machinery on top of it.
#[derive(Clone)]
pub struct Device {
    shared: Arc<Shared>,
}

impl Device {
    /// Bind the device's UDP socket. No background task starts until
    /// [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be created or bound.
    pub fn bind(config: DeviceConfig) -> Result<Self> {
        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;

        socket.set_reuse_address(true)?;

        #[cfg(target_os = "macos")]
        socket.set_reuse_port(true)?;

        let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port);
        socket.bind(&addr.into())?;

        socket.set_nonblocking(true)?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket)?;

        let (shutdown_tx, _) = broadcast::channel(1);
        let (events_tx, _) = broadcast::channel(64);

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                socket: Arc::new(socket),
                state: Mutex::new(State::default()),
                running: AtomicBool::new(false),
                shutdown_tx,
                events_tx,
            }),
        })
    }

    /// The name this device announces.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    /// The local socket address.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket is no longer usable.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.shared.socket.local_addr()?)
    }

    /// Subscribe to device notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.shared.events_tx.subscribe()
    }

    /// Spawn the receive, heartbeat, and retry loops. Idempotent.
    pub fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }

        tracing::info!(
            "device '{}' listening on port {}",
            self.shared.config.name,
            self.shared.config.port
        );

        tokio::spawn(receive_loop(Arc::clone(&self.shared)));
        tokio::spawn(heartbeat_loop(Arc::clone(&self.shared)));
        tokio::spawn(retry_loop(Arc::clone(&self.shared)));
    }

    /// Stop all background loops. In-flight transfers are abandoned in
    /// place, not drained.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let _ = self.shared.shutdown_tx.send(());
    }

    /// All peers with a heartbeat inside the liveness threshold. Stale
    /// records are evicted as a side effect.
    pub async fn list_active_peers(&self) -> Vec<PeerInfo> {
        let now = Instant::now();
        let mut state = self.shared.state.lock().await;
        state
            .peers
            .list_active(now)
            .into_iter()
            .map(|record| PeerInfo {
                age: record.age(now),
                name: record.name,
                addr: record.addr,
            })
            .collect()
    }

    /// Send a text message with at-least-once delivery. Returns the
    /// delivery identifier.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PeerNotFound`] before any network I/O when the
    /// target is unknown or already evicted.
    pub async fn send_message(&self, target: &str, text: &str) -> Result<String> {
        let mut state = self.shared.state.lock().await;
        let dest = state
            .peers
            .resolve(target)
            .ok_or_else(|| Error::PeerNotFound(target.to_string()))?;

        let id = Uuid::new_v4().to_string();
        let bytes = Frame::Talk {
            id: id.clone(),
            text: text.to_string(),
        }
        .encode()
        .into_bytes();

        self.shared.socket.send_to(&bytes, dest).await?;
        state.pending.register(&id, bytes, dest, Instant::now());
        tracing::debug!("sent message {id} to {target}");
        Ok(id)
    }

    /// Offer a file to a peer and register the transfer in the single
    /// outbound slot. Chunking starts once the offer is acknowledged.
    /// Returns the transfer identifier.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileNotFound`] or [`Error::PeerNotFound`] before
    /// any network I/O, and [`Error::TransferInProgress`] when an
    /// outbound transfer is already active.
    pub async fn send_file(&self, target: &str, path: impl AsRef<Path>) -> Result<String> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|_| Error::FileNotFound(path.display().to_string()))?;
        if !metadata.is_file() {
            return Err(Error::FileNotFound(path.display().to_string()));
        }
        let size = metadata.len();

        let mut state = self.shared.state.lock().await;
        let dest = state
            .peers
            .resolve(target)
            .ok_or_else(|| Error::PeerNotFound(target.to_string()))?;
        if state.outbound.is_some() {
            return Err(Error::TransferInProgress);
        }

        let id = Uuid::new_v4().to_string();
        let filename = path
            .file_name()
            .map_or_else(|| id.clone(), |n| n.to_string_lossy().to_string());

        let bytes = Frame::FileOffer {
            id: id.clone(),
            filename,
            size,
        }
        .encode()
        .into_bytes();

        self.shared.socket.send_to(&bytes, dest).await?;
        state
            .pending
            .register(&id, bytes, dest, Instant::now());
        state.outbound = Some(OutboundTransfer::new(
            id.clone(),
            path.to_path_buf(),
            size,
            target.to_string(),
            dest,
        ));
        tracing::info!("offered file '{}' ({size} bytes) to {target}", path.display());
        Ok(id)
    }

    /// Save the chunks received for a transfer to an explicit path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransferNotFound`] when the identifier is unknown
    /// or nothing was received for it, and I/O errors from writing.
    pub async fn save_received_transfer(
        &self,
        transfer_id: &str,
        dest: impl AsRef<Path>,
    ) -> Result<()> {
        let state = self.shared.state.lock().await;
        let transfer = state
            .inbound
            .get(transfer_id)
            .filter(|t| t.received_count() > 0)
            .ok_or_else(|| Error::TransferNotFound(transfer_id.to_string()))?;
        let bytes = transfer.assemble();
        drop(state);

        tokio::fs::write(dest.as_ref(), bytes).await?;
        Ok(())
    }

    /// Whether the outbound transfer slot is occupied.
    pub async fn has_outbound_transfer(&self) -> bool {
        self.shared.state.lock().await.outbound.is_some()
    }

    /// Number of deliveries currently awaiting acknowledgment.
    pub async fn pending_deliveries(&self) -> usize {
        self.shared.state.lock().await.pending.len()
    }

    /// Status of an inbound transfer, if one exists for the identifier.
    pub async fn inbound_status(&self, transfer_id: &str) -> Option<InboundStatus> {
        self.shared
            .state
            .lock()
            .await
            .inbound
            .get(transfer_id)
            .map(|t| t.status)
    }
}

async fn receive_loop(shared: Arc<Shared>) {
    let mut shutdown_rx = shared.shutdown_tx.subscribe();
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }

        tokio::select! {
            result = shared.socket.recv_from(&mut buf) => match result {
                Ok((len, addr)) => {
                    let Ok(text) = std::str::from_utf8(&buf[..len]) else {
                        tracing::debug!("dropping non-UTF-8 datagram from {addr}");
                        continue;
                    };
                    match Frame::decode(text) {
                        Ok(frame) => handle_frame(&shared, frame, addr).await,
                        Err(e) => tracing::debug!("dropping datagram from {addr}: {e}"),
                    }
                }
                Err(e) => {
                    if shared.running.load(Ordering::SeqCst) {
                        tracing::warn!("receive error: {e}");
                    } else {
                        break;
                    }
                }
            },
            _ = shutdown_rx.recv() => {
                tracing::debug!("receive loop shutting down");
                break;
            }
        }
    }
}

async fn heartbeat_loop(shared: Arc<Shared>) {
    let mut shutdown_rx = shared.shutdown_tx.subscribe();

    loop {
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }

        send_heartbeats(&shared).await;

        tokio::select! {
            () = tokio::time::sleep(HEARTBEAT_INTERVAL) => {}
            _ = shutdown_rx.recv() => {
                tracing::debug!("heartbeat loop shutting down");
                break;
            }
        }
    }
}

async fn send_heartbeats(shared: &Arc<Shared>) {
    let frame = Frame::Heartbeat {
        name: shared.config.name.clone(),
    }
    .encode()
    .into_bytes();

    // Listing also sweeps out peers past the liveness threshold.
    let targets: Vec<SocketAddr> = {
        let mut state = shared.state.lock().await;
        state
            .peers
            .list_active(Instant::now())
            .into_iter()
            .map(|record| record.addr)
            .collect()
    };

    if targets.is_empty() {
        // Nobody known yet: announce at the bootstrap address, unless that
        // would be announcing to ourselves.
        let own = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), shared.config.port);
        if shared.config.bootstrap != own {
            if let Err(e) = shared.socket.send_to(&frame, shared.config.bootstrap).await {
                tracing::warn!("failed to send bootstrap heartbeat: {e}");
            }
        }
        return;
    }

    for addr in targets {
        if let Err(e) = shared.socket.send_to(&frame, addr).await {
            tracing::warn!("failed to send heartbeat to {addr}: {e}");
        }
    }
}

async fn retry_loop(shared: Arc<Shared>) {
    let mut shutdown_rx = shared.shutdown_tx.subscribe();

    loop {
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }

        {
            let mut state = shared.state.lock().await;
            let now = Instant::now();

            for (id, payload, dest) in state.pending.take_due(now) {
                tracing::debug!("retransmitting delivery {id}");
                if let Err(e) = shared.socket.send_to(&payload, dest).await {
                    tracing::warn!("retransmission of {id} failed: {e}");
                }
            }

            if let Some(outbound) = state.outbound.as_mut() {
                let dest = outbound.dest;
                for (seq, payload) in outbound.take_due_chunks(now) {
                    tracing::debug!("retransmitting chunk {seq}");
                    if let Err(e) = shared.socket.send_to(&payload, dest).await {
                        tracing::warn!("retransmission of chunk {seq} failed: {e}");
                    }
                }
            }
        }

        tokio::select! {
            () = tokio::time::sleep(RETRY_TICK) => {}
            _ = shutdown_rx.recv() => {
                tracing::debug!("retry loop shutting down");
                break;
            }
        }
    }
}

async fn handle_frame(shared: &Arc<Shared>, frame: Frame, addr: SocketAddr) {
    match frame {
        Frame::Heartbeat { name } => handle_heartbeat(shared, &name, addr).await,
        Frame::Talk { id, text } => handle_talk(shared, &id, text, addr).await,
        Frame::Ack { id } => handle_ack(shared, &id).await,
        Frame::Nack { id, reason } => handle_nack(shared, &id, reason).await,
        Frame::FileOffer { id, filename, size } => {
            handle_file_offer(shared, id, filename, size, addr).await;
        }
        Frame::Chunk { id, seq, payload } => handle_chunk(shared, &id, seq, &payload, addr).await,
        Frame::End { id, digest } => handle_end(shared, &id, &digest, addr).await,
    }
}

async fn handle_heartbeat(shared: &Arc<Shared>, name: &str, addr: SocketAddr) {
    if name == shared.config.name {
        return;
    }

    let is_new = {
        let mut state = shared.state.lock().await;
        state.peers.record_heartbeat(name, addr, Instant::now())
    };

    if is_new {
        tracing::info!("new peer '{name}' detected at {addr}");
        let _ = shared.events_tx.send(DeviceEvent::PeerDiscovered {
            name: name.to_string(),
            addr,
        });
    }
}

async fn handle_talk(shared: &Arc<Shared>, id: &str, text: String, addr: SocketAddr) {
    tracing::info!("message from {addr}: {text}");
    let _ = shared
        .events_tx
        .send(DeviceEvent::TalkReceived { from: addr, text });
    send_ack(shared, id, addr).await;
}

async fn handle_ack(shared: &Arc<Shared>, id: &str) {
    let mut start_chunks = false;
    let mut finished_id = None;

    {
        let mut state = shared.state.lock().await;
        let was_pending = state.pending.acknowledge(id);
        if was_pending {
            tracing::debug!("delivery {id} acknowledged");
        }

        if let Some(outbound) = state.outbound.as_mut() {
            if id == outbound.id {
                if outbound.acknowledged {
                    // Offer is long confirmed: this acknowledges the
                    // single in-flight chunk.
                    outbound.ack_oldest_chunk();
                } else {
                    outbound.acknowledged = true;
                    start_chunks = true;
                }
            } else if id == outbound.end_id() && was_pending {
                finished_id = Some(outbound.id.clone());
            }
        }

        if finished_id.is_some() {
            state.outbound = None;
        }
    }

    if let Some(id) = finished_id {
        tracing::info!("file transfer {id} completed successfully");
        let _ = shared.events_tx.send(DeviceEvent::OutboundFinished { id });
    }

    if start_chunks {
        let shared = Arc::clone(shared);
        let id = id.to_string();
        tokio::spawn(async move { send_file_chunks(shared, id).await });
    }
}

async fn handle_nack(shared: &Arc<Shared>, id: &str, reason: String) {
    tracing::warn!("received NACK for {id}: {reason}");

    let failed_id = {
        let mut state = shared.state.lock().await;
        let matches_end = state
            .outbound
            .as_ref()
            .is_some_and(|outbound| id == outbound.end_id());
        if matches_end {
            state.pending.discard(id);
            state.outbound.take().map(|outbound| outbound.id)
        } else {
            None
        }
    };

    // No automatic retry of the whole transfer; a fresh send_file call is
    // required.
    if let Some(id) = failed_id {
        tracing::warn!("file transfer {id} failed integrity check at the receiver");
        let _ = shared
            .events_tx
            .send(DeviceEvent::OutboundFailed { id, reason });
    }
}

async fn handle_file_offer(
    shared: &Arc<Shared>,
    id: String,
    filename: String,
    size: u64,
    addr: SocketAddr,
) {
    let is_new = {
        let mut state = shared.state.lock().await;
        if state.inbound.contains_key(&id) {
            false
        } else {
            state.inbound.insert(
                id.clone(),
                InboundTransfer::new(id.clone(), filename.clone(), size),
            );
            true
        }
    };

    if is_new {
        tracing::info!("incoming file offer from {addr}: '{filename}' ({size} bytes)");
        let _ = shared.events_tx.send(DeviceEvent::TransferOffered {
            id: id.clone(),
            filename,
            size,
            from: addr,
        });
    }

    // Duplicate offers are re-acknowledged without resetting state.
    send_ack(shared, &id, addr).await;
}

async fn handle_chunk(shared: &Arc<Shared>, id: &str, seq: u64, payload: &str, addr: SocketAddr) {
    let outcome = {
        let mut state = shared.state.lock().await;
        let Some(transfer) = state.inbound.get_mut(id) else {
            tracing::debug!("dropping chunk {seq} for unknown transfer {id}");
            return;
        };

        let bytes = match decode_chunk_payload(payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                // No ACK: the sender's retry path re-sends the chunk.
                tracing::warn!("dropping undecodable chunk {seq} of transfer {id}: {e}");
                return;
            }
        };

        let outcome = transfer.store_chunk(seq, bytes);
        if outcome == ChunkOutcome::Stored {
            tracing::debug!(
                "received chunk {}/{} of transfer {id}",
                seq + 1,
                transfer.total_chunks
            );
        }
        outcome
    };

    match outcome {
        // Duplicates are acknowledged again so a lost ACK cannot wedge
        // the sender.
        ChunkOutcome::Stored | ChunkOutcome::Duplicate => send_ack(shared, id, addr).await,
        ChunkOutcome::OutOfRange => {
            tracing::debug!("dropping out-of-range chunk {seq} for transfer {id}");
        }
    }
}

async fn handle_end(shared: &Arc<Shared>, id: &str, declared_digest: &str, addr: SocketAddr) {
    let end_id = end_delivery_id(id);

    enum Verdict {
        Saved(PathBuf),
        Mismatch,
        AlreadyComplete,
        SaveFailed,
    }

    let verdict = {
        let mut state = shared.state.lock().await;
        let Some(transfer) = state.inbound.get_mut(id) else {
            tracing::debug!("END for unknown transfer {id}");
            return;
        };

        if transfer.status == InboundStatus::Complete {
            Verdict::AlreadyComplete
        } else {
            match transfer.verify(declared_digest) {
                Ok(assembled) => {
                    let dest = shared
                        .config
                        .download_dir
                        .join(sanitize_filename(&transfer.filename, id));
                    match tokio::fs::write(&dest, &assembled).await {
                        Ok(()) => {
                            transfer.status = InboundStatus::Complete;
                            Verdict::Saved(dest)
                        }
                        Err(e) => {
                            // Leave the transfer receiving; the sender's END
                            // retries give the save another chance.
                            tracing::warn!(
                                "failed to save transfer {id} to {}: {e}",
                                dest.display()
                            );
                            Verdict::SaveFailed
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("transfer {id} failed verification: {e}");
                    transfer.reject();
                    Verdict::Mismatch
                }
            }
        }
    };

    match verdict {
        Verdict::Saved(path) => {
            tracing::info!("transfer {id} verified and saved to {}", path.display());
            let _ = shared.events_tx.send(DeviceEvent::TransferComplete {
                id: id.to_string(),
                path,
            });
            send_ack(shared, &end_id, addr).await;
        }
        Verdict::AlreadyComplete => send_ack(shared, &end_id, addr).await,
        Verdict::Mismatch => {
            let _ = shared
                .events_tx
                .send(DeviceEvent::TransferRejected { id: id.to_string() });
            let frame = Frame::Nack {
                id: end_id,
                reason: "integrity_mismatch".to_string(),
            };
            if let Err(e) = shared
                .socket
                .send_to(frame.encode().as_bytes(), addr)
                .await
            {
                tracing::warn!("failed to send NACK: {e}");
            }
        }
        Verdict::SaveFailed => {}
    }
}

/// Stop-and-wait chunk sender for one outbound transfer. Spawned when the
/// offer is acknowledged; exits early whenever the transfer disappears
/// from the outbound slot (NACK, completion, or shutdown races).
async fn send_file_chunks(shared: Arc<Shared>, id: String) {
    let (path, total) = {
        let state = shared.state.lock().await;
        let Some(outbound) = state.outbound.as_ref().filter(|t| t.id == id) else {
            return;
        };
        (outbound.path.clone(), outbound.total_chunks)
    };

    let mut file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            tracing::warn!("cannot read '{}': {e}; abandoning transfer", path.display());
            abandon_outbound(&shared, &id).await;
            return;
        }
    };

    let mut seq: u64 = 0;
    loop {
        let chunk = match read_chunk(&mut file).await {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!("read error on '{}': {e}; abandoning transfer", path.display());
                abandon_outbound(&shared, &id).await;
                return;
            }
        };
        let Some(chunk) = chunk else { break };

        let bytes = Frame::Chunk {
            id: id.clone(),
            seq,
            payload: encode_chunk_payload(&chunk),
        }
        .encode()
        .into_bytes();

        if !send_and_register_chunk(&shared, &id, seq, &bytes).await {
            return;
        }
        tracing::debug!("sent chunk {}/{total} of transfer {id}", seq + 1);

        // Stop-and-wait: poll for the chunk ACK before moving on.
        let mut acked = false;
        for _ in 0..CHUNK_ACK_ATTEMPTS {
            tokio::time::sleep(RETRY_TICK).await;
            let state = shared.state.lock().await;
            match state.outbound.as_ref().filter(|t| t.id == id) {
                None => return,
                Some(outbound) => {
                    if !outbound.is_chunk_pending(seq) {
                        acked = true;
                        break;
                    }
                }
            }
        }

        if !acked {
            // Retransmit once and move on; the retry loop keeps covering
            // the still-pending chunk.
            tracing::warn!("timeout waiting for ACK of chunk {seq}, retransmitting");
            if !send_and_register_chunk(&shared, &id, seq, &bytes).await {
                return;
            }
        }

        seq += 1;
    }

    let digest = match file_digest(&path).await {
        Ok(digest) => digest,
        Err(e) => {
            tracing::warn!("cannot digest '{}': {e}; abandoning transfer", path.display());
            abandon_outbound(&shared, &id).await;
            return;
        }
    };

    let end_id = end_delivery_id(&id);
    let bytes = Frame::End {
        id: id.clone(),
        digest,
    }
    .encode()
    .into_bytes();

    {
        let mut state = shared.state.lock().await;
        let Some(outbound) = state.outbound.as_ref().filter(|t| t.id == id) else {
            return;
        };
        let dest = outbound.dest;
        if let Err(e) = shared.socket.send_to(&bytes, dest).await {
            tracing::warn!("failed to send END for {id}: {e}");
        }
        state.pending.register(&end_id, bytes, dest, Instant::now());
    }

    tracing::info!("all {total} chunks of {id} sent; awaiting final acknowledgment");
}

/// Send one chunk frame and record it as pending. Returns `false` when the
/// transfer is no longer in the outbound slot.
async fn send_and_register_chunk(
    shared: &Arc<Shared>,
    id: &str,
    seq: u64,
    bytes: &[u8],
) -> bool {
    let mut state = shared.state.lock().await;
    let Some(outbound) = state.outbound.as_mut().filter(|t| t.id == id) else {
        return false;
    };
    let dest = outbound.dest;
    outbound.register_chunk(seq, bytes.to_vec(), Instant::now());
    if let Err(e) = shared.socket.send_to(bytes, dest).await {
        tracing::warn!("failed to send chunk {seq}: {e}");
    }
    true
}

async fn abandon_outbound(shared: &Arc<Shared>, id: &str) {
    let mut state = shared.state.lock().await;
    if state.outbound.as_ref().is_some_and(|t| t.id == id) {
        state.outbound = None;
        state.pending.discard(id);
        state.pending.discard(&end_delivery_id(id));
    }
}

async fn send_ack(shared: &Arc<Shared>, id: &str, addr: SocketAddr) {
    let frame = Frame::Ack { id: id.to_string() };
    if let Err(e) = shared.socket.send_to(frame.encode().as_bytes(), addr).await {
        tracing::warn!("failed to send ACK for {id}: {e}");
    }
}

/// Read up to one chunk from the file. `Ok(None)` signals end of file.
async fn read_chunk(file: &mut tokio::fs::File) -> std::io::Result<Option<Vec<u8>>> {
    use tokio::io::AsyncReadExt;

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut filled = 0;
    while filled < CHUNK_SIZE {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    if filled == 0 {
        return Ok(None);
    }
    buf.truncate(filled);
    Ok(Some(buf))
}

/// Reduce a declared filename to its final path component so a malicious
/// offer cannot write outside the download directory.
fn sanitize_filename(declared: &str, fallback: &str) -> String {
    Path::new(declared)
        .file_name()
        .map_or_else(|| fallback.to_string(), |n| n.to_string_lossy().to_string())
}
