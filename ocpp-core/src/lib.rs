//! OCPP protocol engine
//!
//! Transport-neutral core of an OCPP node: message framing for OCPP-J
//! (JSON over WebSocket) and OCPP-S (SOAP over HTTP), request/response
//! correlation, action dispatch and multi-hop routing through networking
//! nodes.
//!
//! ```text
//!   business layer ── send_request / handlers
//!        │
//!   ┌────▼───────────────────────────────────────────────┐
//!   │ Connection  (RoleBinding, CorrelationTable)        │
//!   │    │                        ▲                      │
//!   │    ▼                        │                      │
//!   │ WireCodec ─ json | soap   Router ─▶ neighbors      │
//!   │    │                        ▲        (PeerRegistry)│
//!   └────┼────────────────────────┼──────────────────────┘
//!        ▼                        │
//!      Link ─ channel | websocket | soap     ActionDispatcher
//! ```
//!
//! Every inbound Call gets exactly one CallResult or CallError, every
//! outbound request resolves exactly once (answer, error, timeout or
//! connection loss), and a connection that goes away fails all of its
//! pending requests before it is discarded.

pub mod codec;
pub mod config;
pub mod connection;
pub mod correlation;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod messages;
pub mod registry;
pub mod role;
pub mod router;
pub mod schema;
pub mod transport;
pub mod types;

pub use codec::{TransportKind, WireCodec};
pub use config::{BasicAuth, OcppConfig};
pub use connection::{Connection, EngineContext};
pub use correlation::{CorrelationTable, PendingResponse};
pub use dispatcher::{ActionDispatcher, Handler};
pub use error::{
    CloseReason, CodecError, CorrelationError, DecodeError, DispatchError, HandlerError, RequestError,
    RoutingError, TransportError,
};
pub use events::{EventBus, ProtocolEvent};
pub use messages::{Call, CallError, CallResult, Envelope, ErrorCode, Message, MessageType};
pub use registry::PeerRegistry;
pub use role::{Direction, ExchangeRole, Initiation, RoleBinding, Side};
pub use router::{RouteDecision, Router};
pub use schema::{ActionSchema, FieldKind, SchemaRegistry};
pub use transport::{Accepted, Link, LinkEvent};
pub use types::{Action, CorrelationId, NetworkPath, NodeId, Payload, PeerIdentity, ProtocolVersion, Route};
