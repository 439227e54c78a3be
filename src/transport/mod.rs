//! Transport layer for bus members.
//!
//! The [`Transport`] trait is the contract a bus member relies on:
//! listen on one local address, connect outward, broadcast envelopes to
//! every connected peer, and report membership changes and inbound
//! messages through a registered [`TransportSink`].
//!
//! [`UnixTransport`] is the supplied implementation over Unix domain
//! sockets with length-prefixed JSON frames (see [`codec`]).

pub mod codec;
mod unix;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::address::Uid;
use crate::envelope::Envelope;

pub use unix::UnixTransport;

/// Default bound on an outward connection attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Default bound on the hello exchange of a new connection.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// Default maximum encoded frame size.
pub const DEFAULT_MAX_FRAME_LEN: usize = 10 * 1024 * 1024;

/// Errors that can occur during transport operations.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Another live member is listening on the address.
    #[error("Address already in use by a live member: {0}")]
    AddressInUse(PathBuf),

    #[error("Failed to bind {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out connecting to {path} after {timeout:?}")]
    ConnectTimeout { path: PathBuf, timeout: Duration },

    #[error("Handshake with {peer} failed: {reason}")]
    Handshake { peer: String, reason: String },

    #[error("Refusing to connect to own address {0}")]
    SelfConnect(PathBuf),

    #[error("Transport is not listening")]
    NotListening,

    #[error("Transport is closed")]
    Closed,

    #[error("Frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Transport tuning.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Bound on an outward connect.
    pub connect_timeout: Duration,
    /// Bound on the hello exchange.
    pub handshake_timeout: Duration,
    /// Largest frame accepted or sent.
    pub max_frame_len: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// Transport-local handle of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Which side opened a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The peer connected to us.
    Inbound,
    /// We connected to the peer.
    Outbound,
}

/// A connected peer as seen by the local transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: PeerId,
    /// Uid the peer announced in its hello.
    pub uid: Uid,
    /// Address the peer listens on.
    pub address: PathBuf,
    pub direction: Direction,
}

/// Notifications emitted by a transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    PeerConnected(PeerInfo),
    PeerDisconnected(PeerInfo),
    /// One received envelope; per-peer arrival order is preserved.
    Message { peer: PeerInfo, envelope: Envelope },
}

/// Callback receiving every transport event.
pub type TransportSink = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// Connection-oriented local message channel owned by one bus member.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Register the callback for membership and message events.
    ///
    /// Replaces any previously registered sink.
    fn on_event(&self, sink: TransportSink);

    /// Bind `address` and start accepting peers.
    ///
    /// Fails with [`TransportError::AddressInUse`] when a live listener
    /// already owns the address.
    async fn listen(&self, address: &Path) -> Result<()>;

    /// Connect to the member listening on `address`.
    ///
    /// Connecting to an address already held by a connected peer returns
    /// that peer instead of opening a second connection.
    async fn connect(&self, address: &Path) -> Result<PeerInfo>;

    /// Queue `envelope` to every peer connected at call time.
    ///
    /// Returns the number of peers it was queued for.
    async fn broadcast(&self, envelope: &Envelope) -> Result<usize>;

    /// Snapshot of connected peers.
    fn peers(&self) -> Vec<PeerInfo>;

    /// Disconnect every peer and stop accepting new ones.
    async fn close_all(&self);
}
