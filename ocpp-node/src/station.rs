//! Charging station session
//!
//! Keeps one connection to the central system alive:
//! - Connect (OCPP-J or OCPP-S), reconnecting with exponential backoff
//! - BootNotification until accepted
//! - Heartbeat at the interval the central system hands out

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ocpp_core::transport::{soap, websocket};
use ocpp_core::{CloseReason, Connection, EngineContext, Payload, PeerIdentity, ProtocolVersion, TransportKind};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Session state in the station's connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No connection
    Disconnected,
    /// Connected but not registered
    Connected,
    /// Central system answered Pending; boot is retried
    BootPending,
    /// Registered with the central system
    Registered,
    /// Registration rejected, will retry
    Rejected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    BootAccepted { interval: i64 },
    BootPending { interval: i64 },
    BootRejected { interval: i64 },
    HeartbeatSent,
}

#[derive(Debug)]
pub struct Session {
    pub identity: PeerIdentity,
    pub vendor: String,
    pub model: String,
    pub state: SessionState,
    pub registered_at: Option<DateTime<Utc>>,
    /// Seconds between heartbeats, or between boot attempts while not registered
    pub interval: i64,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(identity: PeerIdentity, vendor: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            identity,
            vendor: vendor.into(),
            model: model.into(),
            state: SessionState::Disconnected,
            registered_at: None,
            interval: 300,
            last_heartbeat: None,
        }
    }

    pub fn handle_event(&mut self, event: SessionEvent) {
        debug!("{} session event: {:?}", self.identity, event);

        match event {
            SessionEvent::Connected => {
                self.state = SessionState::Connected;
                info!("{} connected, will send BootNotification", self.identity);
            }
            SessionEvent::Disconnected => {
                self.state = SessionState::Disconnected;
                self.registered_at = None;
                warn!("{} disconnected", self.identity);
            }
            SessionEvent::BootAccepted { interval } => {
                self.state = SessionState::Registered;
                self.registered_at = Some(Utc::now());
                self.interval = interval;
                info!("{} registered, heartbeat interval: {}s", self.identity, interval);
            }
            SessionEvent::BootPending { interval } => {
                self.state = SessionState::BootPending;
                self.interval = interval;
                info!("{} boot pending, will retry in {}s", self.identity, interval);
            }
            SessionEvent::BootRejected { interval } => {
                self.state = SessionState::Rejected;
                self.interval = interval;
                warn!("{} boot rejected by central system", self.identity);
            }
            SessionEvent::HeartbeatSent => {
                self.last_heartbeat = Some(Utc::now());
            }
        }
    }

    pub fn is_registered(&self) -> bool {
        self.state == SessionState::Registered
    }

    /// Wait before the next heartbeat or boot attempt; never zero
    pub fn next_wakeup(&self) -> Duration {
        Duration::from_secs(self.interval.max(1) as u64)
    }

    /// BootNotification payload in the layout of `protocol`
    pub fn boot_payload(&self, protocol: ProtocolVersion) -> Value {
        match protocol {
            ProtocolVersion::Ocpp15 | ProtocolVersion::Ocpp16 => json!({
                "chargePointVendor": self.vendor,
                "chargePointModel": self.model,
            }),
            ProtocolVersion::Ocpp201 | ProtocolVersion::Ocpp21 => json!({
                "chargingStation": {
                    "vendorName": self.vendor,
                    "model": self.model,
                },
                "reason": "PowerUp",
            }),
        }
    }
}

/// Session event for a BootNotification answer
pub fn boot_outcome(response: &Payload) -> SessionEvent {
    let interval = response
        .get("interval")
        .and_then(Value::as_i64)
        .unwrap_or(300);
    match response.get("status").and_then(Value::as_str) {
        Some("Accepted") => SessionEvent::BootAccepted { interval },
        Some("Pending") => SessionEvent::BootPending { interval },
        _ => SessionEvent::BootRejected { interval },
    }
}

#[derive(Debug, Clone)]
pub struct StationOptions {
    /// Central system URL (WebSocket base URL or SOAP endpoint)
    pub endpoint: String,
    pub transport: TransportKind,
    /// Node id of the central system
    pub upstream: PeerIdentity,
    pub vendor: String,
    pub model: String,
}

/// Run the station forever, reconnecting after every loss
pub async fn run(ctx: Arc<EngineContext>, options: StationOptions) {
    let config = ctx.config.clone();
    let identity = PeerIdentity::from(config.node_id.as_str());
    let mut session = Session::new(identity.clone(), options.vendor.clone(), options.model.clone());
    let mut reconnect_delay = config.reconnect_delay;

    loop {
        let connected = match options.transport {
            TransportKind::Json => websocket::connect(&config, &options.endpoint, &identity).await,
            TransportKind::Soap => {
                soap::connect(&config, &options.endpoint, &identity).map(|link| (link, config.soap.protocol))
            }
        };

        match connected {
            Ok((link, protocol)) => {
                reconnect_delay = config.reconnect_delay;
                let (connection, task) = ctx.open_with(link, options.upstream.clone(), protocol);
                session.handle_event(SessionEvent::Connected);
                let reason = drive(&connection, task, &mut session, protocol).await;
                info!("Connection to {} ended: {}", options.upstream, reason);
                session.handle_event(SessionEvent::Disconnected);
            }
            Err(e) => error!("Connection to {} failed: {}", options.endpoint, e),
        }

        // Exponential backoff
        info!("Reconnecting in {:?}", reconnect_delay);
        tokio::time::sleep(reconnect_delay).await;
        reconnect_delay = std::cmp::min(reconnect_delay * 2, config.max_reconnect_delay);
    }
}

/// Boot and heartbeat over one connection until it closes
async fn drive(
    connection: &Connection,
    mut task: JoinHandle<CloseReason>,
    session: &mut Session,
    protocol: ProtocolVersion,
) -> CloseReason {
    loop {
        let registered = session.is_registered();
        let boot = session.boot_payload(protocol);
        let step = async move {
            if registered {
                connection
                    .send_request("Heartbeat", json!({}))
                    .await
                    .map(|_| SessionEvent::HeartbeatSent)
            } else {
                connection
                    .send_request_with_retry("BootNotification", boot)
                    .await
                    .map(|response| boot_outcome(&response))
            }
        };

        tokio::select! {
            reason = &mut task => return reason.unwrap_or(CloseReason::Local),
            outcome = step => match outcome {
                Ok(event) => session.handle_event(event),
                Err(e) if e.is_network_error() => {
                    connection.close();
                    return (&mut task).await.unwrap_or(CloseReason::Local);
                }
                Err(e) => warn!("Request to central system failed: {}", e),
            },
        }

        tokio::select! {
            reason = &mut task => return reason.unwrap_or(CloseReason::Local),
            _ = tokio::time::sleep(session.next_wakeup()) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_lifecycle() {
        let mut session = Session::new("CP001".into(), "Elektrokombinacija", "EK3");
        assert_eq!(session.identity, "CP001");
        assert_eq!(session.state, SessionState::Disconnected);

        session.handle_event(SessionEvent::Connected);
        assert_eq!(session.state, SessionState::Connected);

        session.handle_event(SessionEvent::BootAccepted { interval: 60 });
        assert!(session.is_registered());
        assert_eq!(session.next_wakeup(), Duration::from_secs(60));

        session.handle_event(SessionEvent::Disconnected);
        assert_eq!(session.state, SessionState::Disconnected);
        assert!(session.registered_at.is_none());
    }

    #[test]
    fn test_boot_outcome() {
        assert_eq!(
            boot_outcome(&json!({"status": "Accepted", "interval": 30, "currentTime": "x"})),
            SessionEvent::BootAccepted { interval: 30 }
        );
        assert_eq!(
            boot_outcome(&json!({"status": "Pending", "interval": 10})),
            SessionEvent::BootPending { interval: 10 }
        );
        assert_eq!(
            boot_outcome(&json!({"status": "Rejected"})),
            SessionEvent::BootRejected { interval: 300 }
        );
    }

    #[test]
    fn test_boot_payload_per_protocol() {
        let session = Session::new("CP001".into(), "EK", "M1");
        assert_eq!(
            session.boot_payload(ProtocolVersion::Ocpp16),
            json!({"chargePointVendor": "EK", "chargePointModel": "M1"})
        );
        assert_eq!(
            session.boot_payload(ProtocolVersion::Ocpp201)["chargingStation"]["model"],
            "M1"
        );
    }

    #[test]
    fn test_zero_interval_does_not_spin() {
        let mut session = Session::new("CP001".into(), "EK", "M1");
        session.handle_event(SessionEvent::BootPending { interval: 0 });
        assert_eq!(session.next_wakeup(), Duration::from_secs(1));
    }
}
