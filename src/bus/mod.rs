//! Bus member.
//!
//! A [`Bus`] is one process's membership in a namespace. It owns a
//! transport bound to the member's resolved address and wires it to the
//! router and the subscriber registry:
//!
//! ```text
//! Transport ──sink──► Router ──► dispatcher task ──► SubscriberRegistry
//!                                      │
//!                                      └──► broadcast channel (Bus::events)
//! ```
//!
//! Every event, whether lifecycle, membership or message, goes through one
//! queue and one dispatcher task, so handlers see events in emission
//! order: messages from one peer stay in arrival order, a peer's
//! `peerDisconnected` precedes the `close` that caused it.
//!
//! Lifecycle:
//!
//! ```text
//! Constructing ──► Listening ──► Closing ──► Closed
//!      │                            ▲
//!      └──► BindFailed ─────────────┘
//! ```

pub mod events;
pub mod registry;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::join_all;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::address::{resolve_checked, AddressError, Uid};
use crate::config::BusOptions;
use crate::discovery::{find_peers, ScanError};
use crate::envelope::Envelope;
use crate::lifecycle::EndpointGuard;
use crate::router::Router;
use crate::transport::{PeerInfo, Transport, TransportConfig, TransportError, UnixTransport};

pub use events::{is_reserved, BusEvent, Message, RESERVED_EVENTS};
pub use registry::{Handler, HandlerId, SubscriberRegistry};

/// Capacity of the [`Bus::events`] channel; slow receivers lag past it.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// Invalid namespace or uid; nothing was created.
    #[error("Cannot construct bus member: {0}")]
    Construction(#[from] AddressError),

    /// Bind, connect or send failure in the transport.
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Scan(#[from] ScanError),

    /// The endpoint file could not be removed during close.
    #[error("Failed to remove endpoint {path}: {source}")]
    CloseResource {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Binding failed; the member will never listen.
    #[error("Bus member is not listening: {reason}")]
    NotListening { reason: String },

    #[error("Event name '{0}' is reserved")]
    ReservedEvent(String),

    #[error("Bus member is closed")]
    Closed,

    #[error("Bus member requires a tokio runtime: {0}")]
    Runtime(String),
}

/// Lifecycle state of a bus member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    /// Binding in progress.
    Constructing,
    /// Bound and accepting peers; subscribe and send are available.
    Listening,
    /// Binding failed. The member stays usable for `close` only.
    BindFailed,
    Closing,
    Closed,
}

/// Outcome of [`Bus::subscribe_all`].
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    /// Peers connected (or already connected) after the call.
    pub connected: Vec<PeerInfo>,
    /// Discovered addresses that could not be connected.
    pub failed: Vec<(PathBuf, Arc<BusError>)>,
}

impl DiscoveryReport {
    /// Whether every discovered peer was connected.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// One member of a local publish/subscribe namespace.
///
/// Cheap to clone; clones share the member.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

struct BusInner {
    namespace: String,
    uid: Uid,
    options: BusOptions,
    address: PathBuf,
    transport: Arc<dyn Transport>,
    registry: Arc<SubscriberRegistry>,
    emitter: mpsc::UnboundedSender<BusEvent>,
    events: broadcast::Sender<BusEvent>,
    state: watch::Sender<BusState>,
    bind_failure: Mutex<Option<String>>,
    endpoint: Mutex<Option<EndpointGuard>>,
    close_lock: tokio::sync::Mutex<()>,
}

impl BusInner {
    fn emit(&self, event: BusEvent) {
        let _ = self.emitter.send(event);
    }
}

impl Bus {
    /// Create a member of `namespace` and start binding its address.
    ///
    /// Fails synchronously, before touching the filesystem, when the
    /// namespace or uid is invalid or no tokio runtime is running. Binding
    /// itself completes in the background: `ready` is emitted on success,
    /// `error` on failure; [`Bus::ready`] awaits either outcome.
    pub fn new(namespace: &str, options: BusOptions) -> Result<Self> {
        let transport = UnixTransport::new(options.uid.clone(), TransportConfig::from(&options));
        Self::with_transport(namespace, options, Arc::new(transport))
    }

    /// Like [`Bus::new`], over a caller-supplied transport.
    pub fn with_transport(
        namespace: &str,
        options: BusOptions,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let address = resolve_checked(&options.path, namespace, &options.uid)?;
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|e| BusError::Runtime(e.to_string()))?;

        let registry = Arc::new(SubscriberRegistry::new());
        let (emitter, queue) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (state, _) = watch::channel(BusState::Constructing);

        runtime.spawn(dispatch_loop(queue, Arc::clone(&registry), events.clone()));

        let router = Router::new();
        let sink_emitter = emitter.clone();
        transport.on_event(Arc::new(move |event| {
            if let Some(event) = router.translate(event) {
                let _ = sink_emitter.send(event);
            }
        }));

        let inner = Arc::new(BusInner {
            namespace: namespace.to_string(),
            uid: options.uid.clone(),
            options,
            address,
            transport,
            registry,
            emitter,
            events,
            state,
            bind_failure: Mutex::new(None),
            endpoint: Mutex::new(None),
            close_lock: tokio::sync::Mutex::new(()),
        });

        debug!(
            namespace = %inner.namespace,
            uid = %inner.uid,
            address = %inner.address.display(),
            "Binding bus member"
        );
        runtime.spawn(bind_endpoint(Arc::clone(&inner)));

        Ok(Self { inner })
    }

    /// Create a member and wait until it is listening.
    pub async fn bind(namespace: &str, options: BusOptions) -> Result<Self> {
        let bus = Self::new(namespace, options)?;
        bus.ready().await?;
        Ok(bus)
    }

    /// Wait until the member is listening.
    ///
    /// Returns [`BusError::NotListening`] if binding failed and
    /// [`BusError::Closed`] once the member is closed.
    pub async fn ready(&self) -> Result<()> {
        let mut state = self.inner.state.subscribe();
        let current = *state
            .wait_for(|s| *s != BusState::Constructing)
            .await
            .map_err(|_| BusError::Closed)?;

        match current {
            BusState::Listening => Ok(()),
            BusState::BindFailed => Err(BusError::NotListening {
                reason: lock(&self.inner.bind_failure)
                    .clone()
                    .unwrap_or_else(|| "bind failed".to_string()),
            }),
            _ => Err(BusError::Closed),
        }
    }

    /// Connect to the member of this namespace with `uid`.
    ///
    /// Connecting to an already-connected member returns the existing
    /// connection. Waits for this member to be listening first.
    pub async fn subscribe(&self, uid: impl Into<Uid>) -> Result<PeerInfo> {
        self.ensure_open()?;
        let uid = uid.into();
        let address = resolve_checked(&self.inner.options.path, &self.inner.namespace, &uid)?;
        self.ready().await?;

        let peer = self.inner.transport.connect(&address).await?;
        debug!(
            namespace = %self.inner.namespace,
            peer = %peer.uid,
            "Subscribed to peer"
        );
        Ok(peer)
    }

    /// Discover every other member of the namespace and connect to each.
    ///
    /// A peer that cannot be connected (typically a stale socket left by a
    /// dead process) is reported as an `error` event and in the returned
    /// report; the remaining peers are still connected. A failed directory
    /// scan is both emitted and returned.
    pub async fn subscribe_all(&self) -> Result<DiscoveryReport> {
        self.ensure_open()?;
        self.ready().await?;

        let inner = &self.inner;
        let addresses = match find_peers(&inner.options.path, &inner.namespace, &inner.address).await
        {
            Ok(addresses) => addresses,
            Err(e) => {
                warn!(namespace = %inner.namespace, error = %e, "Peer discovery failed");
                inner.emit(BusEvent::error(e.clone()));
                return Err(e.into());
            }
        };

        let attempts = addresses.iter().map(|address| async move {
            (address, inner.transport.connect(address).await)
        });

        let mut report = DiscoveryReport::default();
        for (address, result) in join_all(attempts).await {
            match result {
                Ok(peer) => report.connected.push(peer),
                Err(e) => {
                    warn!(
                        namespace = %inner.namespace,
                        address = %address.display(),
                        error = %e,
                        "Failed to connect to discovered peer"
                    );
                    let err = Arc::new(BusError::from(e));
                    inner.emit(BusEvent::Error(Arc::clone(&err)));
                    report.failed.push((address.clone(), err));
                }
            }
        }

        info!(
            namespace = %inner.namespace,
            connected = report.connected.len(),
            failed = report.failed.len(),
            "Subscribed to discovered peers"
        );
        Ok(report)
    }

    /// Send a message of type `event` to every connected peer.
    ///
    /// `data` becomes the body; anything other than a JSON object is
    /// replaced by `{}`. The body's `_fromUID` is always this member's
    /// uid. Delivery is fire-and-forget; the return value is the number of
    /// peers the message was queued for.
    pub async fn send(&self, event: &str, data: Value) -> Result<usize> {
        self.ensure_open()?;
        if event.is_empty() || is_reserved(event) {
            return Err(BusError::ReservedEvent(event.to_string()));
        }

        let envelope = Envelope::stamped(event, data, &self.inner.uid);
        let queued = self.inner.transport.broadcast(&envelope).await?;
        debug!(event = %event, peers = queued, "Sent message");
        Ok(queued)
    }

    /// Alias of [`Bus::send`].
    pub async fn broadcast(&self, event: &str, data: Value) -> Result<usize> {
        self.send(event, data).await
    }

    /// Disconnect every peer, remove the endpoint, then emit `close`.
    ///
    /// A failure to remove the endpoint is emitted as an `error` event and
    /// does not stop teardown. Calling `close` again is a no-op.
    pub async fn close(&self) -> Result<()> {
        let _serial = self.inner.close_lock.lock().await;

        match self.state() {
            BusState::Closing | BusState::Closed => {
                debug!(namespace = %self.inner.namespace, "Bus member already closed");
                return Ok(());
            }
            BusState::Constructing => {
                // bind outcome decides whether there is an endpoint to remove
                let _ = self.ready().await;
            }
            BusState::Listening | BusState::BindFailed => {}
        }

        self.inner.state.send_replace(BusState::Closing);
        self.inner.transport.close_all().await;

        let endpoint = lock(&self.inner.endpoint).take();
        if let Some(endpoint) = endpoint {
            let path = endpoint.path().to_path_buf();
            if let Err(source) = endpoint.release() {
                warn!(path = %path.display(), error = %source, "Failed to remove endpoint");
                self.inner
                    .emit(BusEvent::error(BusError::CloseResource { path, source }));
            }
        }

        self.inner.state.send_replace(BusState::Closed);
        info!(
            namespace = %self.inner.namespace,
            uid = %self.inner.uid,
            "Bus member closed"
        );
        self.inner.emit(BusEvent::Close);
        Ok(())
    }

    /// Register `handler` for every event named `event` (`"*"` for all).
    pub fn on<F>(&self, event: &str, handler: F) -> HandlerId
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        self.inner.registry.on(event, Arc::new(handler))
    }

    /// Register `handler` for the next event named `event` only.
    pub fn once<F>(&self, event: &str, handler: F) -> HandlerId
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        self.inner.registry.once(event, Arc::new(handler))
    }

    /// Remove a handler. Returns whether it was registered.
    pub fn off(&self, id: HandlerId) -> bool {
        self.inner.registry.off(id)
    }

    /// Receiver of every event emitted from now on.
    pub fn events(&self) -> broadcast::Receiver<BusEvent> {
        self.inner.events.subscribe()
    }

    /// [`Bus::events`] as a stream, skipping over lag.
    pub fn event_stream(&self) -> impl Stream<Item = BusEvent> {
        BroadcastStream::new(self.events()).filter_map(|event| event.ok())
    }

    /// Connected peers.
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.inner.transport.peers()
    }

    pub fn state(&self) -> BusState {
        *self.inner.state.borrow()
    }

    /// Socket path this member binds.
    pub fn address(&self) -> &Path {
        &self.inner.address
    }

    pub fn uid(&self) -> &Uid {
        &self.inner.uid
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state() {
            BusState::Closing | BusState::Closed => Err(BusError::Closed),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("namespace", &self.inner.namespace)
            .field("uid", &self.inner.uid)
            .field("address", &self.inner.address)
            .field("state", &self.state())
            .finish()
    }
}

/// Deliver queued events to the registry, then to channel receivers.
async fn dispatch_loop(
    mut queue: mpsc::UnboundedReceiver<BusEvent>,
    registry: Arc<SubscriberRegistry>,
    events: broadcast::Sender<BusEvent>,
) {
    while let Some(event) = queue.recv().await {
        registry.dispatch(&event);
        let _ = events.send(event);
    }
}

async fn bind_endpoint(inner: Arc<BusInner>) {
    match inner.transport.listen(&inner.address).await {
        Ok(()) => {
            *lock(&inner.endpoint) = Some(EndpointGuard::claim(&inner.address));
            inner.state.send_replace(BusState::Listening);
            info!(
                namespace = %inner.namespace,
                uid = %inner.uid,
                address = %inner.address.display(),
                "Bus member listening"
            );
            inner.emit(BusEvent::Ready);
        }
        Err(e) => {
            warn!(
                namespace = %inner.namespace,
                uid = %inner.uid,
                error = %e,
                "Bus member failed to bind"
            );
            *lock(&inner.bind_failure) = Some(e.to_string());
            inner.state.send_replace(BusState::BindFailed);
            inner.emit(BusEvent::error(e));
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_namespace_fails_before_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let opts = BusOptions::default().with_uid(1u32).with_path(dir.path());

        let err = Bus::new("", opts).unwrap_err();
        assert!(matches!(
            err,
            BusError::Construction(AddressError::MissingNamespace)
        ));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_invalid_uid_is_a_construction_error() {
        let opts = BusOptions::default().with_uid("a-b");
        let err = Bus::new("ns", opts).unwrap_err();
        assert!(matches!(
            err,
            BusError::Construction(AddressError::InvalidUid(_))
        ));
    }

    #[test]
    fn test_requires_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let opts = BusOptions::default().with_uid(1u32).with_path(dir.path());

        let err = Bus::new("ns", opts).unwrap_err();
        assert!(matches!(err, BusError::Runtime(_)));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_discovery_report_completeness() {
        let mut report = DiscoveryReport::default();
        assert!(report.is_complete());

        report
            .failed
            .push((PathBuf::from("/tmp/ns-9.sock"), Arc::new(BusError::Closed)));
        assert!(!report.is_complete());
    }
}
