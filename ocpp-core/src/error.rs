//! Error taxonomy of the protocol engine

use std::fmt;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::messages::{CallError, Envelope, ErrorCode, MessageType};
use crate::types::{Action, CorrelationId, NetworkPath, NodeId, Route};

/// Why a payload failed validation against its action schema
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadViolation {
    NotAnObject,
    MissingField(String),
    WrongType {
        field: String,
        expected: &'static str,
    },
}

impl fmt::Display for PayloadViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadViolation::NotAnObject => f.write_str("payload is not an object"),
            PayloadViolation::MissingField(field) => write!(f, "required field '{}' is missing", field),
            PayloadViolation::WrongType { field, expected } => {
                write!(f, "field '{}' must be {}", field, expected)
            }
        }
    }
}

/// Inbound frame could not be turned into a message
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("malformed envelope: {reason}")]
    Malformed {
        reason: String,
        /// Kind of the frame, when it could be read
        message_type: Option<MessageType>,
        correlation_id: Option<CorrelationId>,
        route: Option<Route>,
    },

    #[error("unsupported message type {tag}")]
    UnsupportedType {
        tag: i64,
        correlation_id: Option<CorrelationId>,
    },

    #[error("unknown action '{action}'")]
    UnknownAction {
        action: Action,
        correlation_id: CorrelationId,
        route: Option<Route>,
    },

    #[error("invalid {action} payload: {violation}")]
    InvalidPayload {
        action: Action,
        violation: PayloadViolation,
        message_type: MessageType,
        correlation_id: CorrelationId,
        route: Option<Route>,
    },
}

impl DecodeError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        DecodeError::Malformed {
            reason: reason.into(),
            message_type: None,
            correlation_id: None,
            route: None,
        }
    }

    /// Error code used when answering the offending Call
    pub fn error_code(&self) -> ErrorCode {
        match self {
            DecodeError::Malformed { .. } => ErrorCode::RpcFrameworkError,
            DecodeError::UnsupportedType { .. } => ErrorCode::MessageTypeNotSupported,
            DecodeError::UnknownAction { .. } => ErrorCode::NotImplemented,
            DecodeError::InvalidPayload { violation, .. } => match violation {
                PayloadViolation::NotAnObject => ErrorCode::FormatViolation,
                PayloadViolation::MissingField(_) => ErrorCode::OccurrenceConstraintViolation,
                PayloadViolation::WrongType { .. } => ErrorCode::TypeConstraintViolation,
            },
        }
    }

    /// CALLERROR answering the frame. Only Calls with a readable id (and
    /// frames of an unsupported type) can be answered; failed responses are
    /// local-only.
    pub fn answer(&self) -> Option<CallError> {
        let correlation_id = match self {
            DecodeError::Malformed {
                message_type: Some(MessageType::Call),
                correlation_id: Some(id),
                ..
            } => id,
            DecodeError::UnsupportedType {
                correlation_id: Some(id),
                ..
            } => id,
            DecodeError::UnknownAction { correlation_id, .. } => correlation_id,
            DecodeError::InvalidPayload {
                message_type: MessageType::Call,
                correlation_id,
                ..
            } => correlation_id,
            _ => return None,
        };
        Some(CallError::new(
            correlation_id.clone(),
            self.error_code(),
            self.to_string(),
        ))
    }

    /// Answer ready to send: the CALLERROR, addressed back along the
    /// offending Call's path when it was forwarded here
    pub fn reply(&self) -> Option<Envelope> {
        let answer = self.answer()?;
        let envelope = Envelope::direct(answer).with_route(self.route().and_then(Route::reply));
        Some(match self.action() {
            Some(action) => envelope.with_action(action.clone()),
            None => envelope,
        })
    }

    pub fn action(&self) -> Option<&Action> {
        match self {
            DecodeError::UnknownAction { action, .. } | DecodeError::InvalidPayload { action, .. } => Some(action),
            _ => None,
        }
    }

    /// Routing header of the offending frame, when it could be read
    pub fn route(&self) -> Option<&Route> {
        match self {
            DecodeError::Malformed { route, .. }
            | DecodeError::UnknownAction { route, .. }
            | DecodeError::InvalidPayload { route, .. } => route.as_ref(),
            DecodeError::UnsupportedType { .. } => None,
        }
    }

    /// Id of a CallResult/CallError that arrived but could not be decoded
    pub fn failed_response(&self) -> Option<&CorrelationId> {
        match self {
            DecodeError::Malformed {
                message_type: Some(MessageType::CallResult | MessageType::CallError),
                correlation_id: Some(id),
                ..
            } => Some(id),
            DecodeError::InvalidPayload {
                message_type: MessageType::CallResult | MessageType::CallError,
                correlation_id,
                ..
            } => Some(correlation_id),
            _ => None,
        }
    }
}

/// Outbound message could not be serialized
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("JSON encode error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("XML encode error: {0}")]
    Xml(String),

    #[error("SOAP response {0} does not name the action it answers")]
    MissingAction(CorrelationId),
}

/// Physical channel failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("connection reset: {0}")]
    Reset(String),

    #[error("HTTP status {0}")]
    HttpStatus(u16),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

/// Response that matches no pending request
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CorrelationError {
    #[error("no pending request for correlation id {0}")]
    Unknown(CorrelationId),

    #[error("correlation id {0} is already pending")]
    Duplicate(CorrelationId),
}

/// Multi-hop forwarding failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("routing loop: {node} repeats in path {path}")]
    Loop { node: NodeId, path: NetworkPath },

    #[error("no next hop configured towards {0}")]
    NoRoute(NodeId),

    #[error("next hop {0} is not connected")]
    HopUnavailable(NodeId),

    #[error("no return path in {0}")]
    NoReturnPath(NetworkPath),
}

/// Business error declared by a handler
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{code}: {description}")]
pub struct HandlerError {
    pub code: ErrorCode,
    pub description: String,
    pub details: Value,
}

impl HandlerError {
    pub fn new(code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            details: Value::Object(serde_json::Map::new()),
        }
    }

    pub fn generic(description: impl Into<String>) -> Self {
        Self::new(ErrorCode::GenericError, description)
    }

    pub fn not_supported(description: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotSupported, description)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// Failure while invoking a handler; always becomes exactly one CALLERROR
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Business(#[from] HandlerError),

    #[error("no handler registered for {0}")]
    NotImplemented(Action),

    #[error("handler fault: {0}")]
    Fault(String),

    #[error("handler timed out after {0:?}")]
    TimedOut(Duration),
}

impl DispatchError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            DispatchError::Business(e) => e.code.clone(),
            DispatchError::NotImplemented(_) => ErrorCode::NotImplemented,
            DispatchError::Fault(_) | DispatchError::TimedOut(_) => ErrorCode::InternalError,
        }
    }

    pub fn into_call_error(self, correlation_id: CorrelationId) -> CallError {
        match self {
            DispatchError::Business(e) => {
                CallError::new(correlation_id, e.code, e.description).with_details(e.details)
            }
            other => {
                let code = other.error_code();
                CallError::new(correlation_id, code, other.to_string())
            }
        }
    }
}

/// Why a connection went away
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by this side
    Local,
    /// Closed by the peer
    PeerClosed,
    /// A newer connection for the same identity took over
    Replaced,
    Transport(TransportError),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Local => f.write_str("closed locally"),
            CloseReason::PeerClosed => f.write_str("closed by peer"),
            CloseReason::Replaced => f.write_str("replaced by a newer connection"),
            CloseReason::Transport(e) => write!(f, "transport failure: {}", e),
        }
    }
}

/// Outcome seen by a caller of `send_request` when no result payload arrives
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RequestError {
    #[error("OCPP error from peer: {code} - {description}")]
    Remote {
        code: ErrorCode,
        description: String,
        details: Value,
    },

    #[error("timeout waiting for response")]
    Timeout,

    #[error("connection closed: {0}")]
    ConnectionClosed(CloseReason),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("routing failed: {0}")]
    Routing(#[from] RoutingError),
}

impl RequestError {
    /// Uniform "network error" class seen by the business layer
    pub fn is_network_error(&self) -> bool {
        matches!(self, RequestError::ConnectionClosed(_))
    }
}

impl From<CallError> for RequestError {
    fn from(e: CallError) -> Self {
        RequestError::Remote {
            code: e.error_code,
            description: e.error_description,
            details: e.error_details,
        }
    }
}

impl From<CodecError> for RequestError {
    fn from(e: CodecError) -> Self {
        RequestError::Encode(e.to_string())
    }
}

impl From<TransportError> for RequestError {
    fn from(e: TransportError) -> Self {
        RequestError::ConnectionClosed(CloseReason::Transport(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error_answers_calls_only() {
        let call_err = DecodeError::InvalidPayload {
            action: "BootNotification".into(),
            violation: PayloadViolation::MissingField("reason".into()),
            message_type: MessageType::Call,
            correlation_id: "7".into(),
            route: None,
        };
        let answer = call_err.answer().unwrap();
        assert_eq!(answer.correlation_id, "7");
        assert_eq!(answer.error_code, ErrorCode::OccurrenceConstraintViolation);

        let result_err = DecodeError::InvalidPayload {
            action: "BootNotification".into(),
            violation: PayloadViolation::NotAnObject,
            message_type: MessageType::CallResult,
            correlation_id: "8".into(),
            route: None,
        };
        assert!(result_err.answer().is_none());
        assert_eq!(result_err.failed_response().map(CorrelationId::as_str), Some("8"));

        assert!(DecodeError::malformed("not json").answer().is_none());
    }

    #[test]
    fn test_reply_walks_back_to_originator() {
        let err = DecodeError::UnknownAction {
            action: "Foo".into(),
            correlation_id: "3".into(),
            route: Some(Route::new("CP7", NetworkPath::from_hops(["CSMS", "NN1"]))),
        };
        let reply = err.reply().unwrap();
        assert_eq!(reply.action, Some(Action::from("Foo")));
        assert_eq!(
            reply.route,
            Some(Route::new("CSMS", NetworkPath::from_hops(["CSMS", "NN1"])))
        );
        assert_eq!(reply.correlation_id(), "3");

        let direct = DecodeError::UnknownAction {
            action: "Foo".into(),
            correlation_id: "4".into(),
            route: None,
        };
        assert!(direct.reply().unwrap().route.is_none());
    }

    #[test]
    fn test_decode_error_codes_are_distinct() {
        let malformed = DecodeError::Malformed {
            reason: "bad".into(),
            message_type: Some(MessageType::Call),
            correlation_id: Some("1".into()),
            route: None,
        };
        let unknown = DecodeError::UnknownAction {
            action: "Foo".into(),
            correlation_id: "1".into(),
            route: None,
        };
        let invalid = DecodeError::InvalidPayload {
            action: "Heartbeat".into(),
            violation: PayloadViolation::NotAnObject,
            message_type: MessageType::Call,
            correlation_id: "1".into(),
            route: None,
        };
        let codes = [malformed.error_code(), unknown.error_code(), invalid.error_code()];
        assert_eq!(codes[0], ErrorCode::RpcFrameworkError);
        assert_eq!(codes[1], ErrorCode::NotImplemented);
        assert_eq!(codes[2], ErrorCode::FormatViolation);
    }

    #[test]
    fn test_dispatch_error_preserves_business_code() {
        let err: DispatchError = HandlerError::new(ErrorCode::SecurityError, "bad token")
            .with_details(serde_json::json!({"hint": "renew"}))
            .into();
        let call_error = err.into_call_error("9".into());
        assert_eq!(call_error.error_code, ErrorCode::SecurityError);
        assert_eq!(call_error.error_description, "bad token");
        assert_eq!(call_error.error_details["hint"], "renew");

        let fault = DispatchError::Fault("panicked".into()).into_call_error("10".into());
        assert_eq!(fault.error_code, ErrorCode::InternalError);
    }
}
