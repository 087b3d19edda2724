//! Configuration for the protocol engine
//!
//! One `OcppConfig` is built at startup and shared by every connection.

use std::time::Duration;

use crate::role::Side;
use crate::types::{NodeId, ProtocolVersion};

/// Complete engine configuration
#[derive(Debug, Clone)]
pub struct OcppConfig {
    // Node identity
    pub node_id: NodeId,
    pub side: Side,

    /// Deadline for a response to each outbound request
    pub request_timeout: Duration,

    /// How often overdue requests are swept
    pub expiry_sweep_interval: Duration,

    /// Longest a handler may run before its Call is answered with InternalError
    pub handler_timeout: Duration,

    /// Extra attempts `send_request_with_retry` makes after a timeout
    pub max_retries: u32,

    /// Reject Calls for actions the schema table does not know
    pub strict_schema: bool,

    /// Initial reconnect delay
    pub reconnect_delay: Duration,

    /// Maximum reconnect delay (exponential backoff cap)
    pub max_reconnect_delay: Duration,

    /// Credentials for the WebSocket handshake and SOAP POSTs
    pub basic_auth: Option<BasicAuth>,

    /// Capacity of the observer event bus
    pub event_capacity: usize,

    pub websocket: WebSocketSettings,
    pub soap: SoapSettings,
}

/// OCPP-J transport settings
#[derive(Debug, Clone)]
pub struct WebSocketSettings {
    /// Transport keep-alive, independent of protocol Heartbeats
    pub ping_interval: Duration,

    pub max_message_size: usize,
    pub max_frame_size: usize,

    /// Sub-protocols in preference order
    pub subprotocols: Vec<ProtocolVersion>,
}

/// OCPP-S transport settings
#[derive(Debug, Clone)]
pub struct SoapSettings {
    /// How often a station asks for queued central-system requests
    pub poll_interval: Duration,

    /// XML namespace of the OCPP service elements
    pub service_namespace: String,

    /// OCPP-S only exists for 1.5 and 1.6
    pub protocol: ProtocolVersion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl BasicAuth {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl Default for OcppConfig {
    fn default() -> Self {
        Self {
            node_id: "ocpp-node".to_string(),
            side: Side::CentralSystem,
            request_timeout: Duration::from_secs(30),
            expiry_sweep_interval: Duration::from_secs(1),
            handler_timeout: Duration::from_secs(60),
            max_retries: 0,
            strict_schema: false,
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_delay: Duration::from_secs(300),
            basic_auth: None,
            event_capacity: 256,
            websocket: WebSocketSettings::default(),
            soap: SoapSettings::default(),
        }
    }
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            max_message_size: 64 * 1024,
            max_frame_size: 16 * 1024,
            subprotocols: vec![ProtocolVersion::Ocpp201, ProtocolVersion::Ocpp16],
        }
    }
}

impl Default for SoapSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            service_namespace: crate::codec::soap::DEFAULT_SERVICE_NS.to_string(),
            protocol: ProtocolVersion::Ocpp16,
        }
    }
}

impl OcppConfig {
    /// Create config with basic parameters
    pub fn new(node_id: impl Into<NodeId>, side: Side) -> Self {
        Self {
            node_id: node_id.into(),
            side,
            ..Default::default()
        }
    }

    /// Set request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.expiry_sweep_interval = interval;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_strict_schema(mut self, strict: bool) -> Self {
        self.strict_schema = strict;
        self
    }

    /// Set reconnect backoff bounds
    pub fn with_reconnect(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_delay = initial;
        self.max_reconnect_delay = max;
        self
    }

    pub fn with_basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.basic_auth = Some(BasicAuth::new(username, password));
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.websocket.ping_interval = interval;
        self
    }

    /// Replace the offered/accepted sub-protocols
    pub fn with_subprotocols(mut self, versions: Vec<ProtocolVersion>) -> Self {
        self.websocket.subprotocols = versions;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.soap.poll_interval = interval;
        self
    }

    pub fn with_service_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.soap.service_namespace = namespace.into();
        self
    }

    /// Most preferred protocol version
    pub fn preferred_protocol(&self) -> ProtocolVersion {
        self.websocket
            .subprotocols
            .first()
            .copied()
            .unwrap_or(ProtocolVersion::Ocpp16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = OcppConfig::new("CSMS", Side::CentralSystem)
            .with_request_timeout(Duration::from_secs(5))
            .with_max_retries(2)
            .with_basic_auth("cs1", "secret")
            .with_subprotocols(vec![ProtocolVersion::Ocpp16]);

        assert_eq!(config.node_id, "CSMS");
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.basic_auth, Some(BasicAuth::new("cs1", "secret")));
        assert_eq!(config.preferred_protocol(), ProtocolVersion::Ocpp16);
        assert_eq!(config.websocket.max_frame_size, 16 * 1024);
    }

    #[test]
    fn test_defaults() {
        let config = OcppConfig::default();
        assert!(!config.strict_schema);
        assert_eq!(config.preferred_protocol(), ProtocolVersion::Ocpp201);
        assert_eq!(config.soap.service_namespace, "urn://Ocpp/Cs/2012/06/");
    }
}
