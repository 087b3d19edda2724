//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use ocpp_core::transport::channel;
use ocpp_core::{
    Connection, EngineContext, Link, LinkEvent, OcppConfig, ProtocolEvent, Side, TransportKind,
};
use serde_json::Value;
use tokio::sync::broadcast;

/// Engine connection on one end, a hand-driven peer on the other
pub fn engine_with_raw_peer(ctx: &Arc<EngineContext>, peer: &str) -> (Connection, Link) {
    let (link, raw) = channel::pair(TransportKind::Json);
    let (connection, _task) = ctx.open(link, peer.into());
    (connection, raw)
}

/// Two engines joined by an in-memory link
pub fn connect(
    a: &Arc<EngineContext>,
    b: &Arc<EngineContext>,
    kind: TransportKind,
) -> (Connection, Connection) {
    let (link_a, link_b) = channel::pair(kind);
    let (conn_a, _) = a.open(link_a, b.config.node_id.as_str().into());
    let (conn_b, _) = b.open(link_b, a.config.node_id.as_str().into());
    (conn_a, conn_b)
}

pub fn node(node_id: &str, side: Side) -> Arc<EngineContext> {
    EngineContext::new(OcppConfig::new(node_id, side))
}

/// Next frame the raw peer received, parsed as OCPP-J
pub async fn recv_json(raw: &mut Link) -> Value {
    match raw.receiver.recv().await {
        LinkEvent::Frame(frame) => serde_json::from_slice(&frame).expect("frame is JSON"),
        other => panic!("expected a frame, got {:?}", other),
    }
}

/// Next frame the raw peer received, verbatim
pub async fn recv_text(raw: &mut Link) -> String {
    match raw.receiver.recv().await {
        LinkEvent::Frame(frame) => String::from_utf8(frame).expect("frame is UTF-8"),
        other => panic!("expected a frame, got {:?}", other),
    }
}

pub async fn send_text(raw: &Link, text: &str) {
    raw.sender.send(text.as_bytes().to_vec()).await.expect("link open");
}

pub async fn send_json(raw: &Link, frame: Value) {
    raw.sender
        .send(serde_json::to_vec(&frame).expect("serializable"))
        .await
        .expect("link open");
}

/// Wait for the first event matching `pred`
pub async fn wait_for_event<F>(events: &mut broadcast::Receiver<ProtocolEvent>, pred: F) -> ProtocolEvent
where
    F: Fn(&ProtocolEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event bus closed: {}", e),
            }
        }
    })
    .await
    .expect("event in time")
}
