//! Core identifiers shared by every layer of the engine

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Action payloads are opaque structured data to the engine
pub type Payload = serde_json::Value;

/// Identifier of a node in a (possibly multi-hop) OCPP network
pub type NodeId = String;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }
    };
}

string_id!(
    /// Opaque token linking a CallResult/CallError to its Call.
    ///
    /// Unique among the currently outstanding requests of one side of a
    /// connection; may be reused once the original exchange is resolved.
    CorrelationId
);

string_id!(
    /// Name of the remote operation, case-sensitive and exchanged verbatim
    Action
);

string_id!(
    /// Logical identity of a charging station (charge box), stable across reconnects
    PeerIdentity
);

impl CorrelationId {
    /// Fresh random id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl PeerIdentity {
    pub fn node_id(&self) -> NodeId {
        self.0.clone()
    }
}

/// OCPP protocol versions the engine can speak
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolVersion {
    /// OCPP 1.5, SOAP only
    Ocpp15,
    Ocpp16,
    Ocpp201,
    Ocpp21,
}

impl ProtocolVersion {
    /// WebSocket sub-protocol token
    pub fn subprotocol(&self) -> &'static str {
        match self {
            ProtocolVersion::Ocpp15 => "ocpp1.5",
            ProtocolVersion::Ocpp16 => "ocpp1.6",
            ProtocolVersion::Ocpp201 => "ocpp2.0.1",
            ProtocolVersion::Ocpp21 => "ocpp2.1",
        }
    }

    pub fn from_subprotocol(token: &str) -> Option<Self> {
        match token.trim() {
            "ocpp1.5" => Some(ProtocolVersion::Ocpp15),
            "ocpp1.6" => Some(ProtocolVersion::Ocpp16),
            "ocpp2.0.1" => Some(ProtocolVersion::Ocpp201),
            "ocpp2.1" => Some(ProtocolVersion::Ocpp21),
            _ => None,
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.subprotocol())
    }
}

/// Ordered hops a forwarded message has traversed, originator first.
///
/// Append-only while a Call travels forward; read in reverse to route the
/// answer back. An empty path means a direct exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkPath(Vec<NodeId>);

impl NetworkPath {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn from_hops<I, S>(hops: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        Self(hops.into_iter().map(Into::into).collect())
    }

    pub fn hops(&self) -> &[NodeId] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn push(&mut self, node: impl Into<NodeId>) {
        self.0.push(node.into());
    }

    pub fn contains(&self, node: &str) -> bool {
        self.0.iter().any(|hop| hop == node)
    }

    pub fn position(&self, node: &str) -> Option<usize> {
        self.0.iter().position(|hop| hop == node)
    }

    pub fn originator(&self) -> Option<&NodeId> {
        self.0.first()
    }

    pub fn last(&self) -> Option<&NodeId> {
        self.0.last()
    }

    /// The hop recorded just before `node`, i.e. where an answer goes next
    pub fn previous_hop(&self, node: &str) -> Option<&NodeId> {
        match self.position(node) {
            Some(idx) if idx > 0 => self.0.get(idx - 1),
            _ => None,
        }
    }

    /// First node identifier that occurs more than once
    pub fn first_repeated(&self) -> Option<&NodeId> {
        self.0
            .iter()
            .enumerate()
            .find(|(idx, hop)| self.0[..*idx].contains(hop))
            .map(|(_, hop)| hop)
    }
}

impl fmt::Display for NetworkPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("(direct)");
        }
        f.write_str(&self.0.join(" -> "))
    }
}

/// Multi-hop routing header carried by forwarded messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub destination: NodeId,
    #[serde(default)]
    pub network_path: NetworkPath,
}

impl Route {
    pub fn new(destination: impl Into<NodeId>, network_path: NetworkPath) -> Self {
        Self {
            destination: destination.into(),
            network_path,
        }
    }

    /// Route for a Call leaving its originator
    pub fn originate(destination: impl Into<NodeId>, origin: impl Into<NodeId>) -> Self {
        let mut network_path = NetworkPath::new();
        network_path.push(origin);
        Self::new(destination, network_path)
    }

    /// Route for the answer to a Call that arrived with this route: same
    /// path, addressed back to the originator. `None` when no path was recorded.
    pub fn reply(&self) -> Option<Route> {
        self.network_path
            .originator()
            .map(|origin| Route::new(origin.clone(), self.network_path.clone()))
    }
}
