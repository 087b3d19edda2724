//! Observable protocol events
//!
//! Every connection publishes what it sees onto a broadcast bus. Nothing in
//! the engine depends on a subscriber being present.

use tokio::sync::broadcast;

use crate::codec::TransportKind;
use crate::error::{CloseReason, RoutingError};
use crate::role::Initiation;
use crate::types::{Action, CorrelationId, NodeId, PeerIdentity};

#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    ConnectionOpened {
        peer: PeerIdentity,
        transport: TransportKind,
    },
    ConnectionClosed {
        peer: PeerIdentity,
        reason: CloseReason,
        /// Requests failed with `ConnectionClosed`
        cancelled: usize,
    },
    RequestSent {
        peer: PeerIdentity,
        correlation_id: CorrelationId,
        action: Action,
        /// `Queued` when the Call waits for the station to poll
        initiation: Initiation,
    },
    RequestReceived {
        peer: PeerIdentity,
        correlation_id: CorrelationId,
        action: Action,
    },
    ResponseSent {
        peer: PeerIdentity,
        correlation_id: CorrelationId,
        is_error: bool,
    },
    ResponseReceived {
        peer: PeerIdentity,
        correlation_id: CorrelationId,
        is_error: bool,
    },
    /// Response whose id matches no pending request
    StrayResponse {
        peer: PeerIdentity,
        correlation_id: CorrelationId,
    },
    RequestTimedOut {
        correlation_id: CorrelationId,
        action: Action,
    },
    DecodeFailed {
        peer: PeerIdentity,
        reason: String,
    },
    Forwarded {
        correlation_id: CorrelationId,
        from: NodeId,
        to: NodeId,
    },
    RoutingRejected {
        correlation_id: CorrelationId,
        error: RoutingError,
    },
}

/// Broadcast bus shared by every connection of a node
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ProtocolEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProtocolEvent> {
        self.tx.subscribe()
    }

    /// Publish; dropped silently when nobody listens
    pub fn publish(&self, event: ProtocolEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        bus.publish(ProtocolEvent::DecodeFailed {
            peer: "CS1".into(),
            reason: "bad".into(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        bus.publish(ProtocolEvent::RequestTimedOut {
            correlation_id: "1".into(),
            action: "Heartbeat".into(),
        });
        match rx.recv().await.unwrap() {
            ProtocolEvent::RequestTimedOut { correlation_id, .. } => assert_eq!(correlation_id, "1"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
