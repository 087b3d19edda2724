//! Wire encodings
//!
//! - `json`: OCPP-J, one JSON array per WebSocket text frame
//! - `soap`: OCPP-S, a SOAP 1.2 envelope per HTTP body
//!
//! Both satisfy `decode(encode(m)) == m` for well-formed envelopes (for
//! OCPP-S, payloads the schema describes).
//!
//! Decoding only reads the frame. Whether a Call's payload fits its action
//! is checked separately with [`WireCodec::validate_call`], once the Call is
//! known to be addressed to this node; forwarded Calls are never interpreted.

pub mod json;
pub mod soap;

use std::sync::Arc;

pub use json::JsonCodec;
pub use soap::{SoapCodec, SoapContext, SoapHeader};

use crate::error::{CodecError, DecodeError};
use crate::messages::{Envelope, Message, MessageType};
use crate::schema::{Rejection, SchemaRegistry};

/// Physical encoding family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// JSON over WebSocket
    Json,
    /// SOAP/XML over HTTP
    Soap,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Json => f.write_str("OCPP-J"),
            TransportKind::Soap => f.write_str("OCPP-S"),
        }
    }
}

/// Codec bound to one connection
#[derive(Debug, Clone)]
pub enum WireCodec {
    Json(JsonCodec),
    Soap(SoapCodec),
}

impl WireCodec {
    pub fn json(schema: Arc<SchemaRegistry>) -> Self {
        WireCodec::Json(JsonCodec::new(schema))
    }

    pub fn soap(context: SoapContext, schema: Arc<SchemaRegistry>) -> Self {
        WireCodec::Soap(SoapCodec::new(context, schema))
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            WireCodec::Json(_) => TransportKind::Json,
            WireCodec::Soap(_) => TransportKind::Soap,
        }
    }

    pub fn schema(&self) -> &SchemaRegistry {
        match self {
            WireCodec::Json(c) => c.schema(),
            WireCodec::Soap(c) => c.schema(),
        }
    }

    pub fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
        match self {
            WireCodec::Json(c) => c.encode(envelope),
            WireCodec::Soap(c) => c.encode(envelope),
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Envelope, DecodeError> {
        match self {
            WireCodec::Json(c) => c.decode(bytes),
            WireCodec::Soap(c) => c.decode(bytes),
        }
    }

    /// Check a Call addressed to this node against the schema. Answers
    /// and direct frames of other kinds always pass.
    pub fn validate_call(&self, envelope: &Envelope) -> Result<(), DecodeError> {
        let Message::Call(call) = &envelope.message else {
            return Ok(());
        };
        self.schema()
            .validate_request(&call.action, &call.payload)
            .map_err(|rejection| match rejection {
                Rejection::UnknownAction => DecodeError::UnknownAction {
                    action: call.action.clone(),
                    correlation_id: call.correlation_id.clone(),
                    route: envelope.route.clone(),
                },
                Rejection::Invalid(violation) => DecodeError::InvalidPayload {
                    action: call.action.clone(),
                    violation,
                    message_type: MessageType::Call,
                    correlation_id: call.correlation_id.clone(),
                    route: envelope.route.clone(),
                },
            })
    }
}

/// Encode with a lenient empty schema and default SOAP context
pub fn encode(envelope: &Envelope, kind: TransportKind) -> Result<Vec<u8>, CodecError> {
    default_codec(kind).encode(envelope)
}

/// Decode with a lenient empty schema and default SOAP context
pub fn decode(bytes: &[u8], kind: TransportKind) -> Result<Envelope, DecodeError> {
    default_codec(kind).decode(bytes)
}

fn default_codec(kind: TransportKind) -> WireCodec {
    let schema = Arc::new(SchemaRegistry::new());
    match kind {
        TransportKind::Json => WireCodec::json(schema),
        TransportKind::Soap => WireCodec::soap(SoapContext::default(), schema),
    }
}
