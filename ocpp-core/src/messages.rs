//! OCPP message model
//!
//! Every exchange is one of three message kinds:
//! - CALL: request naming an action
//! - CALLRESULT: success response
//! - CALLERROR: error response
//!
//! The wire shape of each kind is owned by [`crate::codec`].

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::types::{Action, CorrelationId, Payload, Route};

/// OCPP-J message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

impl MessageType {
    pub fn from_tag(tag: i64) -> Option<Self> {
        match tag {
            2 => Some(MessageType::Call),
            3 => Some(MessageType::CallResult),
            4 => Some(MessageType::CallError),
            _ => None,
        }
    }

    pub fn tag(self) -> i64 {
        self as i64
    }
}

/// OCPP error codes.
///
/// Codes not known to this engine are preserved verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    FormatViolation,
    /// OCPP 1.6 spelling of `FormatViolation`
    FormationViolation,
    GenericError,
    InternalError,
    MessageTypeNotSupported,
    NotImplemented,
    NotSupported,
    OccurrenceConstraintViolation,
    PropertyConstraintViolation,
    ProtocolError,
    RpcFrameworkError,
    SecurityError,
    TypeConstraintViolation,
    /// A networking node could not route the message
    RoutingFailure,
    Other(String),
}

impl ErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::FormatViolation => "FormatViolation",
            ErrorCode::FormationViolation => "FormationViolation",
            ErrorCode::GenericError => "GenericError",
            ErrorCode::InternalError => "InternalError",
            ErrorCode::MessageTypeNotSupported => "MessageTypeNotSupported",
            ErrorCode::NotImplemented => "NotImplemented",
            ErrorCode::NotSupported => "NotSupported",
            ErrorCode::OccurrenceConstraintViolation => "OccurrenceConstraintViolation",
            ErrorCode::PropertyConstraintViolation => "PropertyConstraintViolation",
            ErrorCode::ProtocolError => "ProtocolError",
            ErrorCode::RpcFrameworkError => "RpcFrameworkError",
            ErrorCode::SecurityError => "SecurityError",
            ErrorCode::TypeConstraintViolation => "TypeConstraintViolation",
            ErrorCode::RoutingFailure => "RoutingFailure",
            ErrorCode::Other(code) => code,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "FormatViolation" => ErrorCode::FormatViolation,
            "FormationViolation" => ErrorCode::FormationViolation,
            "GenericError" => ErrorCode::GenericError,
            "InternalError" => ErrorCode::InternalError,
            "MessageTypeNotSupported" => ErrorCode::MessageTypeNotSupported,
            "NotImplemented" => ErrorCode::NotImplemented,
            "NotSupported" => ErrorCode::NotSupported,
            "OccurrenceConstraintViolation" => ErrorCode::OccurrenceConstraintViolation,
            "PropertyConstraintViolation" => ErrorCode::PropertyConstraintViolation,
            "ProtocolError" => ErrorCode::ProtocolError,
            "RpcFrameworkError" => ErrorCode::RpcFrameworkError,
            "SecurityError" => ErrorCode::SecurityError,
            "TypeConstraintViolation" => ErrorCode::TypeConstraintViolation,
            "RoutingFailure" => ErrorCode::RoutingFailure,
            other => ErrorCode::Other(other.to_string()),
        })
    }
}

impl From<&str> for ErrorCode {
    fn from(value: &str) -> Self {
        match value.parse() {
            Ok(code) => code,
            Err(never) => match never {},
        }
    }
}

/// OCPP CALL message (request)
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub correlation_id: CorrelationId,
    pub action: Action,
    pub payload: Payload,
}

impl Call {
    pub fn new(
        correlation_id: impl Into<CorrelationId>,
        action: impl Into<Action>,
        payload: Payload,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            action: action.into(),
            payload,
        }
    }
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub correlation_id: CorrelationId,
    pub payload: Payload,
}

impl CallResult {
    pub fn new(correlation_id: impl Into<CorrelationId>, payload: Payload) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            payload,
        }
    }
}

/// OCPP CALLERROR message (error response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub correlation_id: CorrelationId,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

impl CallError {
    /// Create a CALLERROR with empty details
    pub fn new(
        correlation_id: impl Into<CorrelationId>,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(serde_json::Map::new()),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.error_details = details;
        self
    }
}

/// Parsed OCPP message (any kind)
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl Message {
    pub fn correlation_id(&self) -> &CorrelationId {
        match self {
            Message::Call(c) => &c.correlation_id,
            Message::CallResult(r) => &r.correlation_id,
            Message::CallError(e) => &e.correlation_id,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Call(_) => MessageType::Call,
            Message::CallResult(_) => MessageType::CallResult,
            Message::CallError(_) => MessageType::CallError,
        }
    }

    pub fn is_call(&self) -> bool {
        matches!(self, Message::Call(_))
    }
}

impl From<Call> for Message {
    fn from(call: Call) -> Self {
        Message::Call(call)
    }
}

impl From<CallResult> for Message {
    fn from(result: CallResult) -> Self {
        Message::CallResult(result)
    }
}

impl From<CallError> for Message {
    fn from(error: CallError) -> Self {
        Message::CallError(error)
    }
}

/// A message together with the transport-neutral metadata the codecs need.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub message: Message,
    /// Multi-hop header; `None` for a direct exchange
    pub route: Option<Route>,
    /// Action answered by a CallResult/CallError. OCPP-S needs it to name the
    /// response element; OCPP-J does not carry it.
    pub action: Option<Action>,
}

impl Envelope {
    pub fn direct(message: impl Into<Message>) -> Self {
        Self {
            message: message.into(),
            route: None,
            action: None,
        }
    }

    pub fn routed(message: impl Into<Message>, route: Route) -> Self {
        Self {
            message: message.into(),
            route: Some(route),
            action: None,
        }
    }

    pub fn with_route(mut self, route: Option<Route>) -> Self {
        self.route = route;
        self
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.action = Some(action);
        self
    }

    /// Action of a Call, or the answered action of a response when known
    pub fn action(&self) -> Option<&Action> {
        match &self.message {
            Message::Call(call) => Some(&call.action),
            _ => self.action.as_ref(),
        }
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        self.message.correlation_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_preserves_unknown() {
        let code: ErrorCode = "VendorSpecificFailure".into();
        assert_eq!(code, ErrorCode::Other("VendorSpecificFailure".to_string()));
        assert_eq!(code.as_str(), "VendorSpecificFailure");

        let known: ErrorCode = "NotImplemented".into();
        assert_eq!(known, ErrorCode::NotImplemented);
        assert_eq!(known.to_string(), "NotImplemented");
    }

    #[test]
    fn test_message_type_tags() {
        assert_eq!(MessageType::from_tag(2), Some(MessageType::Call));
        assert_eq!(MessageType::from_tag(4), Some(MessageType::CallError));
        assert_eq!(MessageType::from_tag(5), None);
        assert_eq!(MessageType::CallResult.tag(), 3);
    }

    #[test]
    fn test_envelope_action() {
        let call = Call::new("1", "Heartbeat", serde_json::json!({}));
        assert_eq!(Envelope::direct(call).action().map(Action::as_str), Some("Heartbeat"));

        let result = CallResult::new("1", serde_json::json!({}));
        let env = Envelope::direct(result.clone());
        assert!(env.action().is_none());
        let env = env.with_action(Action::from("Heartbeat"));
        assert_eq!(env.action().map(Action::as_str), Some("Heartbeat"));
    }
}
