//! Unix socket transport.
//!
//! One accept loop per listener, and per peer connection a reader task
//! (decodes frames, forwards them to the sink in arrival order) and a
//! writer task (drains an unbounded outbox, so sends never block the
//! caller and stay FIFO per peer).
//!
//! Outward dials are serialized per address, so one member never holds two
//! connections it opened to the same peer. Binding is serialized per
//! address across processes with an `flock` on a `.lock` sidecar, so a
//! stale socket is probed, removed and rebound by one binder at a time.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use async_trait::async_trait;
use nix::fcntl::{Flock, FlockArg};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::codec::{self, Frame};
use super::{
    Direction, PeerId, PeerInfo, Result, Transport, TransportConfig, TransportError,
    TransportEvent, TransportSink,
};
use crate::address::Uid;
use crate::envelope::Envelope;

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: std::time::Duration = std::time::Duration::from_millis(10);

/// Unix domain socket transport.
pub struct UnixTransport {
    shared: Arc<Shared>,
}

struct Shared {
    uid: Uid,
    config: TransportConfig,
    local_address: RwLock<Option<PathBuf>>,
    sink: RwLock<Option<TransportSink>>,
    peers: Mutex<HashMap<PeerId, PeerEntry>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    /// One gate per address being dialed.
    dialing: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
    next_peer: AtomicU64,
    closed: AtomicBool,
}

struct PeerEntry {
    info: PeerInfo,
    /// Who opened the connection; breaks ties between crossed dials.
    initiator: Uid,
    outbox: mpsc::UnboundedSender<Arc<Vec<u8>>>,
    reader: Option<JoinHandle<()>>,
}

impl UnixTransport {
    /// Create a transport that announces itself as `uid`.
    pub fn new(uid: Uid, config: TransportConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                uid,
                config,
                local_address: RwLock::new(None),
                sink: RwLock::new(None),
                peers: Mutex::new(HashMap::new()),
                accept_task: Mutex::new(None),
                dialing: Mutex::new(HashMap::new()),
                next_peer: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Address this transport listens on, once bound.
    pub fn local_address(&self) -> Option<PathBuf> {
        read(&self.shared.local_address).clone()
    }
}

impl Drop for UnixTransport {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.shared.accept_task).take() {
            task.abort();
        }
        for (_, entry) in lock(&self.shared.peers).drain() {
            if let Some(reader) = entry.reader {
                reader.abort();
            }
        }
    }
}

#[async_trait]
impl Transport for UnixTransport {
    fn on_event(&self, sink: TransportSink) {
        *write(&self.shared.sink) = Some(sink);
    }

    async fn listen(&self, address: &Path) -> Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let current = read(&self.shared.local_address).clone();
        if let Some(current) = current {
            if current == address {
                return Ok(());
            }
            return Err(TransportError::Bind {
                path: address.to_path_buf(),
                source: io::Error::other(format!(
                    "already listening on {}",
                    current.display()
                )),
            });
        }

        let listener = bind_reclaiming(address, &self.shared.config).await?;
        *write(&self.shared.local_address) = Some(address.to_path_buf());

        info!(
            path = %address.display(),
            uid = %self.shared.uid,
            "Transport listening"
        );

        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(accept_loop(shared, listener));
        *lock(&self.shared.accept_task) = Some(task);

        Ok(())
    }

    async fn connect(&self, address: &Path) -> Result<PeerInfo> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let local = read(&shared.local_address)
            .clone()
            .ok_or(TransportError::NotListening)?;
        if local == address {
            return Err(TransportError::SelfConnect(address.to_path_buf()));
        }
        let gate = shared.dial_gate(address);
        let result = {
            let _dialing = gate.lock().await;
            match shared.peer_at(address) {
                Some(existing) => {
                    debug!(path = %address.display(), peer = %existing.id, "Already connected");
                    Ok(existing)
                }
                None => shared.dial(address, local).await,
            }
        };
        shared.release_dial_gate(address, gate);
        result
    }

    async fn broadcast(&self, envelope: &Envelope) -> Result<usize> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        // Serialize once
        let frame = Frame::Message {
            envelope: envelope.clone(),
        };
        let bytes = Arc::new(codec::encode(&frame, self.shared.config.max_frame_len)?);

        let mut queued = 0;
        {
            let peers = lock(&self.shared.peers);
            for entry in peers.values() {
                if entry.outbox.send(Arc::clone(&bytes)).is_ok() {
                    queued += 1;
                } else {
                    debug!(peer = %entry.info.id, "Outbox closed, skipping peer");
                }
            }
        }

        debug!(event = %envelope.event, peers = queued, "Broadcast queued");
        Ok(queued)
    }

    fn peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<_> = lock(&self.shared.peers)
            .values()
            .map(|e| e.info.clone())
            .collect();
        peers.sort_by_key(|p| p.id);
        peers
    }

    async fn close_all(&self) {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(task) = lock(&shared.accept_task).take() {
            task.abort();
        }

        let mut drained: Vec<PeerEntry> = lock(&shared.peers).drain().map(|(_, e)| e).collect();
        drained.sort_by_key(|e| e.info.id);

        info!(peers = drained.len(), uid = %shared.uid, "Closing all peer connections");

        for entry in drained {
            shared.disconnect(entry);
        }
    }
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        let sink = read(&self.sink).clone();
        match sink {
            Some(sink) => sink(event),
            None => debug!("No transport sink registered, dropping event"),
        }
    }

    fn dial_gate(&self, address: &Path) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(lock(&self.dialing).entry(address.to_path_buf()).or_default())
    }

    /// Forget the gate for `address` unless another dial is waiting on it.
    fn release_dial_gate(&self, address: &Path, gate: Arc<tokio::sync::Mutex<()>>) {
        let mut dialing = lock(&self.dialing);
        // Ours plus the map's
        let idle = Arc::strong_count(&gate) <= 2
            && dialing.get(address).is_some_and(|g| Arc::ptr_eq(g, &gate));
        if idle {
            dialing.remove(address);
        }
    }

    /// Open, handshake and admit a new outbound connection.
    async fn dial(self: &Arc<Self>, address: &Path, local: PathBuf) -> Result<PeerInfo> {
        let connect_timeout = self.config.connect_timeout;
        let mut stream = match timeout(connect_timeout, UnixStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(TransportError::Connect {
                    path: address.to_path_buf(),
                    source,
                })
            }
            Err(_) => {
                return Err(TransportError::ConnectTimeout {
                    path: address.to_path_buf(),
                    timeout: connect_timeout,
                })
            }
        };

        let hello = Frame::Hello {
            uid: self.uid.clone(),
            address: local,
        };
        let reply = timeout(
            self.config.handshake_timeout,
            handshake_outbound(&mut stream, &hello, self.config.max_frame_len),
        )
        .await;
        let peer_uid = match reply {
            Ok(Ok(Some(Frame::Hello { uid, .. }))) => uid,
            Ok(Ok(other)) => {
                return Err(handshake_error(address, format!("expected hello, got {other:?}")))
            }
            Ok(Err(e)) => return Err(handshake_error(address, e.to_string())),
            Err(_) => return Err(handshake_error(address, "timed out".to_string())),
        };

        let initiator = self.uid.clone();
        self.admit(stream, peer_uid, address.to_path_buf(), Direction::Outbound, initiator)
            .ok_or(TransportError::Closed)
    }

    fn peer_at(&self, address: &Path) -> Option<PeerInfo> {
        lock(&self.peers)
            .values()
            .find(|e| e.info.address == address)
            .map(|e| e.info.clone())
    }

    /// Register a handshaken connection and start its tasks.
    ///
    /// When a peer at the same address is already connected, the
    /// connection opened by the lower uid survives so that two members
    /// dialing each other at once settle on the same connection.
    ///
    /// Membership events are emitted under the peers lock, so they cannot
    /// interleave with the disconnects `close_all` emits after draining.
    fn admit(
        self: &Arc<Self>,
        stream: UnixStream,
        uid: Uid,
        address: PathBuf,
        direction: Direction,
        initiator: Uid,
    ) -> Option<PeerInfo> {
        let mut peers = lock(&self.peers);

        // Checked under the lock: close_all drains after setting it
        if self.closed.load(Ordering::SeqCst) {
            debug!(path = %address.display(), "Transport closed, dropping connection");
            return None;
        }

        let duplicate = peers
            .iter()
            .find(|(_, e)| e.info.address == address)
            .map(|(id, e)| (*id, e.initiator.clone()));

        let mut evicted = None;
        if let Some((existing_id, existing_initiator)) = duplicate {
            if existing_initiator <= initiator {
                debug!(
                    path = %address.display(),
                    peer = %existing_id,
                    "Dropping duplicate connection"
                );
                return peers.get(&existing_id).map(|e| e.info.clone());
            }
            evicted = peers.remove(&existing_id);
        }

        let id = PeerId(self.next_peer.fetch_add(1, Ordering::SeqCst));
        let info = PeerInfo {
            id,
            uid,
            address,
            direction,
        };

        let (read_half, write_half) = stream.into_split();
        let (outbox, rx) = mpsc::unbounded_channel();

        tokio::spawn(write_loop(write_half, rx, id));
        let reader = tokio::spawn(read_loop(Arc::clone(self), read_half, info.clone()));

        peers.insert(
            id,
            PeerEntry {
                info: info.clone(),
                initiator,
                outbox,
                reader: Some(reader),
            },
        );

        if let Some(old) = evicted {
            debug!(peer = %old.info.id, replacement = %id, "Replaced crossed connection");
            self.disconnect(old);
        }

        info!(
            peer = %id,
            uid = %info.uid,
            path = %info.address.display(),
            direction = ?info.direction,
            "Peer connected"
        );
        self.emit(TransportEvent::PeerConnected(info.clone()));
        drop(peers);

        Some(info)
    }

    /// Tear down a peer already removed from the map.
    ///
    /// Dropping the outbox lets the writer flush what is queued and shut
    /// the socket down.
    fn disconnect(&self, mut entry: PeerEntry) {
        if let Some(reader) = entry.reader.take() {
            reader.abort();
        }
        let info = entry.info.clone();
        drop(entry);

        info!(peer = %info.id, uid = %info.uid, "Peer disconnected");
        self.emit(TransportEvent::PeerDisconnected(info));
    }

    /// Called by a reader task when its connection ends.
    fn reader_finished(&self, id: PeerId) {
        let entry = lock(&self.peers).remove(&id);
        if let Some(mut entry) = entry {
            // The reader is the current task
            entry.reader = None;
            self.disconnect(entry);
        }
    }
}

/// Exclusive hold on the `.lock` sidecar of one address.
///
/// Every bind of the address runs under this lock, so probing, removing
/// and rebinding a stale socket cannot interleave with another binder.
/// The sidecar is unlinked before the lock is released; waiters that
/// opened the old file notice and retry on a fresh one.
struct BindLock {
    path: PathBuf,
    file: Option<Flock<File>>,
}

impl BindLock {
    async fn acquire(address: &Path) -> io::Result<Self> {
        let path = bind_lock_path(address);
        let target = path.clone();
        let file = tokio::task::spawn_blocking(move || lock_sidecar(&target))
            .await
            .map_err(io::Error::other)??;
        Ok(Self {
            path,
            file: Some(file),
        })
    }
}

impl Drop for BindLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove bind lock");
            }
        }
        drop(self.file.take());
    }
}

fn bind_lock_path(address: &Path) -> PathBuf {
    let mut path = OsString::from(address.as_os_str());
    path.push(".lock");
    PathBuf::from(path)
}

/// Block until `path` is locked and still names the locked file.
fn lock_sidecar(path: &Path) -> io::Result<Flock<File>> {
    loop {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let locked =
            Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| io::Error::from(errno))?;

        let held = locked.metadata()?;
        match std::fs::metadata(path) {
            Ok(current) if current.dev() == held.dev() && current.ino() == held.ino() => {
                return Ok(locked)
            }
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Bind `address`, reclaiming it when only a stale socket file remains.
async fn bind_reclaiming(address: &Path, config: &TransportConfig) -> Result<UnixListener> {
    if let Some(parent) = address.parent() {
        std::fs::create_dir_all(parent).map_err(|source| TransportError::Bind {
            path: address.to_path_buf(),
            source,
        })?;
    }

    let _lock = BindLock::acquire(address)
        .await
        .map_err(|source| TransportError::Bind {
            path: address.to_path_buf(),
            source,
        })?;

    match UnixListener::bind(address) {
        Ok(listener) => return Ok(listener),
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {}
        Err(source) => {
            return Err(TransportError::Bind {
                path: address.to_path_buf(),
                source,
            })
        }
    }

    let is_socket = std::fs::symlink_metadata(address)
        .map(|m| m.file_type().is_socket())
        .unwrap_or(false);
    if !is_socket {
        return Err(TransportError::Bind {
            path: address.to_path_buf(),
            source: io::Error::new(
                io::ErrorKind::AddrInUse,
                "path exists and is not a socket",
            ),
        });
    }

    match timeout(config.connect_timeout, UnixStream::connect(address)).await {
        Ok(Ok(_)) | Err(_) => return Err(TransportError::AddressInUse(address.to_path_buf())),
        Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
            info!(path = %address.display(), "Removing stale socket");
            if let Err(source) = std::fs::remove_file(address) {
                if source.kind() != io::ErrorKind::NotFound {
                    return Err(TransportError::Bind {
                        path: address.to_path_buf(),
                        source,
                    });
                }
            }
        }
        Ok(Err(e)) => debug!(path = %address.display(), error = %e, "Probe failed, retrying bind"),
    }

    UnixListener::bind(address).map_err(|source| match source.kind() {
        io::ErrorKind::AddrInUse => TransportError::AddressInUse(address.to_path_buf()),
        _ => TransportError::Bind {
            path: address.to_path_buf(),
            source,
        },
    })
}

async fn accept_loop(shared: Arc<Shared>, listener: UnixListener) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    if let Err(e) = accept_peer(&shared, stream).await {
                        warn!(error = %e, "Rejected inbound connection");
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "Accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

async fn accept_peer(shared: &Arc<Shared>, mut stream: UnixStream) -> Result<()> {
    let max = shared.config.max_frame_len;
    let local = read(&shared.local_address)
        .clone()
        .ok_or(TransportError::NotListening)?;

    let ours = Frame::Hello {
        uid: shared.uid.clone(),
        address: local.clone(),
    };
    let hello = timeout(
        shared.config.handshake_timeout,
        handshake_inbound(&mut stream, &ours, max),
    )
    .await;
    let (uid, address) = match hello {
        Ok(Ok(Some(Frame::Hello { uid, address }))) => (uid, address),
        // Liveness probe or a client that hung up
        Ok(Ok(None)) => return Ok(()),
        Ok(Ok(Some(other))) => {
            return Err(handshake_error(&local, format!("expected hello, got {other:?}")))
        }
        Ok(Err(e)) => return Err(handshake_error(&local, e.to_string())),
        Err(_) => return Err(handshake_error(&local, "timed out".to_string())),
    };

    let initiator = uid.clone();
    shared.admit(stream, uid, address, Direction::Inbound, initiator);
    Ok(())
}

/// Send our hello, then wait for the peer's.
async fn handshake_outbound(
    stream: &mut UnixStream,
    hello: &Frame,
    max: usize,
) -> Result<Option<Frame>> {
    codec::write_frame(stream, hello, max).await?;
    codec::read_frame(stream, max).await
}

/// Wait for the peer's hello, then answer with ours.
async fn handshake_inbound(
    stream: &mut UnixStream,
    ours: &Frame,
    max: usize,
) -> Result<Option<Frame>> {
    let hello = codec::read_frame(stream, max).await?;
    if let Some(Frame::Hello { .. }) = hello {
        codec::write_frame(stream, ours, max).await?;
    }
    Ok(hello)
}

async fn read_loop(shared: Arc<Shared>, read_half: OwnedReadHalf, info: PeerInfo) {
    let mut reader = BufReader::new(read_half);
    let max = shared.config.max_frame_len;

    loop {
        match codec::read_frame(&mut reader, max).await {
            Ok(Some(Frame::Message { envelope })) => {
                debug!(peer = %info.id, event = %envelope.event, "Received message");
                shared.emit(TransportEvent::Message {
                    peer: info.clone(),
                    envelope,
                });
            }
            Ok(Some(Frame::Hello { .. })) => {
                warn!(peer = %info.id, "Ignoring repeated hello");
            }
            Ok(None) => {
                debug!(peer = %info.id, "Peer closed connection");
                break;
            }
            Err(e) => {
                warn!(peer = %info.id, error = %e, "Peer connection failed");
                break;
            }
        }
    }

    shared.reader_finished(info.id);
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Arc<Vec<u8>>>,
    id: PeerId,
) {
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = write_half.write_all(&bytes).await {
            if e.kind() != io::ErrorKind::BrokenPipe {
                warn!(peer = %id, error = %e, "Failed to write to peer");
            }
            return;
        }
    }
    let _ = write_half.shutdown().await;
}

fn handshake_error(peer: &Path, reason: String) -> TransportError {
    TransportError::Handshake {
        peer: peer.display().to_string(),
        reason,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
