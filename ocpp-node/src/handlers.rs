//! Default action handlers
//!
//! Just enough business behavior for a node to be useful on its own: a
//! central system that registers every station, and a station that accepts
//! resets. Anything else is answered NotImplemented by the dispatcher.

use chrono::Utc;
use ocpp_core::{ActionDispatcher, ErrorCode, HandlerError, Payload, PeerIdentity};
use serde_json::json;
use tracing::info;

/// Heartbeat interval handed to stations in BootNotification answers (seconds)
pub const DEFAULT_HEARTBEAT_INTERVAL: i64 = 300;

fn now() -> String {
    Utc::now().to_rfc3339()
}

pub fn install_central_handlers(dispatcher: &ActionDispatcher, heartbeat_interval: i64) {
    dispatcher.register("BootNotification", move |peer, payload| {
        boot_notification(peer, payload, heartbeat_interval)
    });
    dispatcher.register("Heartbeat", heartbeat);
    dispatcher.register("StatusNotification", status_notification);
    dispatcher.register("MeterValues", acknowledge);
    dispatcher.register("DataTransfer", data_transfer);
}

pub fn install_station_handlers(dispatcher: &ActionDispatcher) {
    dispatcher.register("Reset", reset);
    dispatcher.register("DataTransfer", data_transfer);
}

async fn boot_notification(peer: PeerIdentity, payload: Payload, interval: i64) -> Result<Payload, HandlerError> {
    info!("BootNotification from {}: {}", peer, payload);
    Ok(json!({
        "status": "Accepted",
        "currentTime": now(),
        "interval": interval,
    }))
}

async fn heartbeat(_peer: PeerIdentity, _payload: Payload) -> Result<Payload, HandlerError> {
    Ok(json!({ "currentTime": now() }))
}

async fn status_notification(peer: PeerIdentity, payload: Payload) -> Result<Payload, HandlerError> {
    info!("Status from {}: {}", peer, payload);
    Ok(json!({}))
}

async fn acknowledge(_peer: PeerIdentity, _payload: Payload) -> Result<Payload, HandlerError> {
    Ok(json!({}))
}

async fn data_transfer(_peer: PeerIdentity, _payload: Payload) -> Result<Payload, HandlerError> {
    Ok(json!({ "status": "UnknownVendorId" }))
}

async fn reset(peer: PeerIdentity, payload: Payload) -> Result<Payload, HandlerError> {
    if payload.get("type").is_none() {
        return Err(HandlerError::new(
            ErrorCode::OccurrenceConstraintViolation,
            "Reset without type",
        ));
    }
    info!("Reset requested by {}", peer);
    Ok(json!({ "status": "Accepted" }))
}
