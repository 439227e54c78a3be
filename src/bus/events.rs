//! Events a bus member delivers to local subscribers.

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use super::BusError;
use crate::address::Uid;
use crate::envelope::sender_uid;
use crate::transport::PeerInfo;

/// Emitted once the member is listening.
pub const READY: &str = "ready";
/// Emitted once teardown completes.
pub const CLOSE: &str = "close";
/// Emitted for asynchronous failures.
pub const ERROR: &str = "error";
/// Emitted when a peer connection opens.
pub const PEER_CONNECTED: &str = "peerConnected";
/// Emitted when a peer connection ends.
pub const PEER_DISCONNECTED: &str = "peerDisconnected";
/// Subscription name observing every event.
pub const WILDCARD: &str = "*";

/// Names that cannot be used as message types.
pub const RESERVED_EVENTS: &[&str] = &[
    READY,
    CLOSE,
    ERROR,
    PEER_CONNECTED,
    PEER_DISCONNECTED,
    WILDCARD,
];

/// Whether `name` is one of [`RESERVED_EVENTS`].
pub fn is_reserved(name: &str) -> bool {
    RESERVED_EVENTS.contains(&name)
}

/// A message received from a peer.
#[derive(Debug, Clone)]
pub struct Message {
    /// Message type, used as the local event name.
    pub event: String,
    /// Message body, including the sender's `_fromUID`.
    pub body: Map<String, Value>,
    /// Connection it arrived on.
    pub peer: PeerInfo,
}

impl Message {
    /// Uid the sender stamped into the body.
    pub fn from_uid(&self) -> Option<Uid> {
        sender_uid(&self.body)
    }

    /// Body as a JSON value, for logging and re-serialization.
    pub fn body_json(&self) -> Value {
        Value::Object(self.body.clone())
    }
}

/// Everything a bus member emits.
#[derive(Debug, Clone)]
pub enum BusEvent {
    Ready,
    Close,
    Error(Arc<BusError>),
    PeerConnected(PeerInfo),
    PeerDisconnected(PeerInfo),
    Message(Message),
}

impl BusEvent {
    /// Local event name handlers subscribe to.
    pub fn name(&self) -> &str {
        match self {
            BusEvent::Ready => READY,
            BusEvent::Close => CLOSE,
            BusEvent::Error(_) => ERROR,
            BusEvent::PeerConnected(_) => PEER_CONNECTED,
            BusEvent::PeerDisconnected(_) => PEER_DISCONNECTED,
            BusEvent::Message(m) => &m.event,
        }
    }

    pub(crate) fn error(e: impl Into<BusError>) -> Self {
        BusEvent::Error(Arc::new(e.into()))
    }
}

impl fmt::Display for BusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusEvent::Error(e) => write!(f, "error: {e}"),
            BusEvent::PeerConnected(p) | BusEvent::PeerDisconnected(p) => {
                write!(f, "{} {} ({})", self.name(), p.uid, p.address.display())
            }
            BusEvent::Message(m) => write!(f, "message {} from {}", m.event, m.peer.uid),
            _ => f.write_str(self.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Direction, PeerId};
    use serde_json::json;
    use std::path::PathBuf;

    fn peer() -> PeerInfo {
        PeerInfo {
            id: PeerId(1),
            uid: Uid::Num(1),
            address: PathBuf::from("/tmp/ns-1.sock"),
            direction: Direction::Inbound,
        }
    }

    #[test]
    fn test_names() {
        assert_eq!(BusEvent::Ready.name(), "ready");
        assert_eq!(BusEvent::Close.name(), "close");
        assert_eq!(BusEvent::PeerConnected(peer()).name(), "peerConnected");
        assert_eq!(BusEvent::PeerDisconnected(peer()).name(), "peerDisconnected");
        assert_eq!(BusEvent::error(BusError::Closed).name(), "error");

        let msg = Message {
            event: "ping".to_string(),
            body: Map::new(),
            peer: peer(),
        };
        assert_eq!(BusEvent::Message(msg).name(), "ping");
    }

    #[test]
    fn test_message_sender() {
        let body = json!({"n": 1, "_fromUID": 1});
        let msg = Message {
            event: "ping".to_string(),
            body: body.as_object().cloned().unwrap(),
            peer: peer(),
        };
        assert_eq!(msg.from_uid(), Some(Uid::Num(1)));
        assert_eq!(msg.body_json(), body);
        assert!(msg.body_json().to_string().contains(r#""_fromUID":1"#));
    }

    #[test]
    fn test_reserved() {
        for name in ["ready", "close", "error", "peerConnected", "peerDisconnected", "*"] {
            assert!(is_reserved(name));
        }
        assert!(!is_reserved("ping"));
    }
}
