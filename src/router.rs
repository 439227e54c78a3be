//! Inbound message routing.
//!
//! The router sits between the transport and the subscriber registry. It
//! unwraps each received envelope into a [`Message`] whose event name is
//! the envelope's type, and passes membership changes through unchanged.
//! Per-peer arrival order is kept because translation is synchronous and
//! happens on the transport's reader task.

use tracing::warn;

use crate::bus::events::{is_reserved, BusEvent, Message};
use crate::envelope::Envelope;
use crate::transport::{PeerInfo, TransportEvent};

/// Translates transport notifications into bus events.
#[derive(Debug, Clone, Copy, Default)]
pub struct Router;

impl Router {
    pub fn new() -> Self {
        Self
    }

    /// Unwrap one received envelope and hand it to `deliver`.
    ///
    /// Envelopes with a reserved or empty type are dropped.
    pub fn route(&self, peer: PeerInfo, envelope: Envelope, deliver: impl FnOnce(Message)) {
        if is_reserved(&envelope.event) || envelope.event.is_empty() {
            warn!(
                peer = %peer.uid,
                event = %envelope.event,
                "Dropping message with reserved type"
            );
            return;
        }
        deliver(Message {
            event: envelope.event,
            body: envelope.body,
            peer,
        });
    }

    /// Map a transport notification to the event the bus emits for it.
    pub fn translate(&self, event: TransportEvent) -> Option<BusEvent> {
        match event {
            TransportEvent::PeerConnected(peer) => Some(BusEvent::PeerConnected(peer)),
            TransportEvent::PeerDisconnected(peer) => Some(BusEvent::PeerDisconnected(peer)),
            TransportEvent::Message { peer, envelope } => {
                let mut routed = None;
                self.route(peer, envelope, |msg| routed = Some(BusEvent::Message(msg)));
                routed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Uid;
    use crate::transport::{Direction, PeerId};
    use serde_json::json;
    use std::path::PathBuf;

    fn peer() -> PeerInfo {
        PeerInfo {
            id: PeerId(7),
            uid: Uid::Num(1),
            address: PathBuf::from("/tmp/ns-1.sock"),
            direction: Direction::Outbound,
        }
    }

    #[test]
    fn test_every_message_type_is_routed() {
        let router = Router::new();
        for name in ["ping", "orders", "orders.created", "ready.later", "#", "Ready"] {
            let env = Envelope::stamped(name, json!({}), &Uid::Num(1));
            let event = router.translate(TransportEvent::Message {
                peer: peer(),
                envelope: env,
            });
            assert!(
                matches!(event, Some(BusEvent::Message(ref m)) if m.event == name),
                "{name} should be routed"
            );
        }
    }

    #[test]
    fn test_route_unwraps_envelope() {
        let env = Envelope::stamped("ping", json!({"n": 1}), &Uid::Num(1));
        let mut delivered = Vec::new();
        Router::new().route(peer(), env, |m| delivered.push(m));

        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].event, "ping");
        assert_eq!(delivered[0].body["n"], json!(1));
        assert_eq!(delivered[0].from_uid(), Some(Uid::Num(1)));
        assert_eq!(delivered[0].peer.id, PeerId(7));
    }

    #[test]
    fn test_reserved_types_are_dropped() {
        for name in ["ready", "close", "error", "peerConnected", "*", ""] {
            let env = Envelope::stamped(name, json!({}), &Uid::Num(1));
            let event = Router::new().translate(TransportEvent::Message {
                peer: peer(),
                envelope: env,
            });
            assert!(event.is_none(), "{name} should be dropped");
        }
    }

    #[test]
    fn test_translate_membership() {
        let router = Router::default();
        let up = router.translate(TransportEvent::PeerConnected(peer()));
        assert!(matches!(up, Some(BusEvent::PeerConnected(p)) if p.id == PeerId(7)));

        let down = router.translate(TransportEvent::PeerDisconnected(peer()));
        assert!(matches!(down, Some(BusEvent::PeerDisconnected(_))));
    }
}
