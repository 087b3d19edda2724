//! Transport adapters
//!
//! A [`Link`] is the engine's view of one physical channel: a frame sender,
//! a receive stream ending in a single `Closed` event, and a control handle.
//! Implementations drive the other end through a [`LinkDriver`]:
//!
//! - `channel`: in-memory pair, for tests and embedding
//! - `websocket`: OCPP-J over tokio-tungstenite
//! - `soap`: OCPP-S over HTTP (axum server, reqwest client)

pub mod channel;
pub mod soap;
pub mod websocket;

use std::net::SocketAddr;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::sync::{mpsc, watch};

use crate::codec::TransportKind;
use crate::config::BasicAuth;
use crate::error::TransportError;
use crate::types::{PeerIdentity, ProtocolVersion};

/// Frames buffered per direction
pub const LINK_CAPACITY: usize = 64;

/// What the receive side of a link yields
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Frame(Vec<u8>),
    /// End of stream; `Some` when the channel failed rather than closed
    Closed(Option<TransportError>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Open,
    Closed,
    Failed(TransportError),
}

/// Shared open/closed flag of one link
#[derive(Debug, Clone)]
pub struct LinkControl {
    state: Arc<watch::Sender<LinkState>>,
}

impl LinkControl {
    pub fn new() -> Self {
        let (state, _) = watch::channel(LinkState::Open);
        Self {
            state: Arc::new(state),
        }
    }

    /// Orderly local close; no-op once closed
    pub fn close(&self) {
        self.transition(LinkState::Closed);
    }

    /// Mark the channel as failed; no-op once closed
    pub fn abort(&self, error: TransportError) {
        self.transition(LinkState::Failed(error));
    }

    fn transition(&self, next: LinkState) {
        self.state.send_if_modified(|state| {
            if *state == LinkState::Open {
                *state = next;
                true
            } else {
                false
            }
        });
    }

    pub fn state(&self) -> LinkState {
        self.state.borrow().clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.state.borrow() != LinkState::Open
    }

    /// Resolves once the link leaves `Open`
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state != LinkState::Open).await;
    }
}

impl Default for LinkControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Outbound half. Clones share one queue, drained by a single writer task,
/// so concurrent senders never interleave frames.
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<Vec<u8>>,
    control: LinkControl,
}

impl FrameSender {
    pub async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        match self.control.state() {
            LinkState::Open => {}
            LinkState::Closed => return Err(TransportError::Closed),
            LinkState::Failed(e) => return Err(e),
        }
        // A full queue on a link that closes meanwhile must not block forever
        tokio::select! {
            sent = self.tx.send(frame) => sent.map_err(|_| TransportError::Closed),
            _ = self.control.closed() => match self.control.state() {
                LinkState::Failed(e) => Err(e),
                _ => Err(TransportError::Closed),
            },
        }
    }
}

/// Inbound half
#[derive(Debug)]
pub struct FrameReceiver {
    rx: mpsc::Receiver<LinkEvent>,
}

impl FrameReceiver {
    /// Next event; `Closed(None)` forever once the driver is gone
    pub async fn recv(&mut self) -> LinkEvent {
        self.rx.recv().await.unwrap_or(LinkEvent::Closed(None))
    }
}

/// Engine side of a physical channel
#[derive(Debug)]
pub struct Link {
    pub kind: TransportKind,
    pub sender: FrameSender,
    pub receiver: FrameReceiver,
    pub control: LinkControl,
}

/// Transport side of a link: drains what the engine sends, feeds what arrives
#[derive(Debug)]
pub struct LinkDriver {
    pub outbound: mpsc::Receiver<Vec<u8>>,
    pub inbound: mpsc::Sender<LinkEvent>,
    pub control: LinkControl,
}

/// Create a link and the driver a transport implementation runs
pub fn link(kind: TransportKind) -> (Link, LinkDriver) {
    let (out_tx, out_rx) = mpsc::channel(LINK_CAPACITY);
    let (in_tx, in_rx) = mpsc::channel(LINK_CAPACITY);
    let control = LinkControl::new();

    let link = Link {
        kind,
        sender: FrameSender {
            tx: out_tx,
            control: control.clone(),
        },
        receiver: FrameReceiver { rx: in_rx },
        control: control.clone(),
    };
    let driver = LinkDriver {
        outbound: out_rx,
        inbound: in_tx,
        control,
    };
    (link, driver)
}

/// A peer that completed a server-side handshake
#[derive(Debug)]
pub struct Accepted {
    pub link: Link,
    pub identity: PeerIdentity,
    pub protocol: ProtocolVersion,
    pub remote_addr: Option<SocketAddr>,
}

/// `Authorization` header value for HTTP Basic credentials
pub fn basic_auth_header(auth: &BasicAuth) -> String {
    let token = BASE64.encode(format!("{}:{}", auth.username, auth.password));
    format!("Basic {}", token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_auth_header() {
        let auth = BasicAuth::new("Aladdin", "open sesame");
        assert_eq!(basic_auth_header(&auth), "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ==");
    }

    #[tokio::test]
    async fn test_control_transitions_once() {
        let control = LinkControl::new();
        assert!(!control.is_closed());
        control.abort(TransportError::Reset("gone".into()));
        control.close();
        assert_eq!(control.state(), LinkState::Failed(TransportError::Reset("gone".into())));
        control.closed().await;
    }

    #[tokio::test]
    async fn test_sender_fails_after_close() {
        let (link, _driver) = link(TransportKind::Json);
        link.control.close();
        assert_eq!(link.sender.send(b"x".to_vec()).await, Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn test_blocked_send_released_by_close() {
        let (link, _driver) = link(TransportKind::Json);
        for _ in 0..LINK_CAPACITY {
            link.sender.send(b"x".to_vec()).await.unwrap();
        }
        let blocked = {
            let sender = link.sender.clone();
            tokio::spawn(async move { sender.send(b"one too many".to_vec()).await })
        };
        tokio::task::yield_now().await;
        link.control.close();
        assert_eq!(blocked.await.unwrap(), Err(TransportError::Closed));
    }
}
