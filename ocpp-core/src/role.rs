//! Who is the Caller of an exchange on a given connection

use crate::codec::TransportKind;
use crate::messages::Message;
use crate::types::{NodeId, PeerIdentity, ProtocolVersion};

/// Which end of the protocol a node plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Side {
    ChargingStation,
    CentralSystem,
    /// Forwards messages between the other two; may also terminate some
    NetworkingNode,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::ChargingStation => f.write_str("charging-station"),
            Side::CentralSystem => f.write_str("central-system"),
            Side::NetworkingNode => f.write_str("networking-node"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeRole {
    /// Allocated the correlation id
    Caller,
    Callee,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// How this side's Calls reach the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initiation {
    /// Written to the wire immediately
    Direct,
    /// Held until the peer polls for it (central system over SOAP)
    Queued,
}

/// Static facts about one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleBinding {
    pub local: NodeId,
    pub remote: PeerIdentity,
    pub side: Side,
    pub transport: TransportKind,
    pub protocol: ProtocolVersion,
}

impl RoleBinding {
    pub fn new(
        local: impl Into<NodeId>,
        remote: PeerIdentity,
        side: Side,
        transport: TransportKind,
        protocol: ProtocolVersion,
    ) -> Self {
        Self {
            local: local.into(),
            remote,
            side,
            transport,
            protocol,
        }
    }

    /// Our role in the exchange `message` belongs to.
    ///
    /// Whoever sends a Call is its Caller; whoever sends a response is the Callee.
    /// Over WebSocket both ends are Caller of their own exchanges at the same
    /// time, each in its own id space.
    pub fn role_for(&self, message: &Message, direction: Direction) -> ExchangeRole {
        match (message.is_call(), direction) {
            (true, Direction::Outbound) | (false, Direction::Inbound) => ExchangeRole::Caller,
            (true, Direction::Inbound) | (false, Direction::Outbound) => ExchangeRole::Callee,
        }
    }

    /// The station is always the Caller of exchanges it starts over SOAP;
    /// anything the central side starts only travels when polled.
    pub fn initiation(&self) -> Initiation {
        match (self.transport, self.side) {
            (TransportKind::Soap, Side::CentralSystem) => Initiation::Queued,
            _ => Initiation::Direct,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Call, CallResult};
    use serde_json::json;

    fn binding(side: Side, transport: TransportKind) -> RoleBinding {
        RoleBinding::new("LOCAL", "PEER".into(), side, transport, ProtocolVersion::Ocpp16)
    }

    #[test]
    fn test_role_for_messages() {
        let b = binding(Side::CentralSystem, TransportKind::Json);
        let call: Message = Call::new("1", "Reset", json!({})).into();
        let result: Message = CallResult::new("1", json!({})).into();

        assert_eq!(b.role_for(&call, Direction::Outbound), ExchangeRole::Caller);
        assert_eq!(b.role_for(&call, Direction::Inbound), ExchangeRole::Callee);
        assert_eq!(b.role_for(&result, Direction::Inbound), ExchangeRole::Caller);
        assert_eq!(b.role_for(&result, Direction::Outbound), ExchangeRole::Callee);
    }

    #[test]
    fn test_soap_central_side_is_queued() {
        assert_eq!(
            binding(Side::CentralSystem, TransportKind::Soap).initiation(),
            Initiation::Queued
        );
        assert_eq!(
            binding(Side::ChargingStation, TransportKind::Soap).initiation(),
            Initiation::Direct
        );
        assert_eq!(
            binding(Side::CentralSystem, TransportKind::Json).initiation(),
            Initiation::Direct
        );
    }
}
