//! OCPP-J framing
//!
//! - CALL: `[2, messageId, action, payload]`
//! - CALLRESULT: `[3, messageId, payload]`
//! - CALLERROR: `[4, messageId, errorCode, errorDescription, errorDetails]`
//!
//! A forwarded message carries one trailing routing object
//! (`{"destination": .., "networkPath": [..]}`) after the standard elements.

use std::sync::Arc;

use serde_json::Value;

use crate::error::{CodecError, DecodeError};
use crate::messages::{Call, CallError, CallResult, Envelope, ErrorCode, Message, MessageType};
use crate::schema::SchemaRegistry;
use crate::types::{Action, CorrelationId, Route};

#[derive(Debug, Clone)]
pub struct JsonCodec {
    schema: Arc<SchemaRegistry>,
}

impl JsonCodec {
    pub fn new(schema: Arc<SchemaRegistry>) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &SchemaRegistry {
        &self.schema
    }

    /// Serialize to the OCPP-J array form
    pub fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
        let mut array = match &envelope.message {
            Message::Call(c) => vec![
                Value::from(MessageType::Call.tag()),
                Value::from(c.correlation_id.as_str()),
                Value::from(c.action.as_str()),
                c.payload.clone(),
            ],
            Message::CallResult(r) => vec![
                Value::from(MessageType::CallResult.tag()),
                Value::from(r.correlation_id.as_str()),
                r.payload.clone(),
            ],
            Message::CallError(e) => vec![
                Value::from(MessageType::CallError.tag()),
                Value::from(e.correlation_id.as_str()),
                Value::from(e.error_code.as_str()),
                Value::from(e.error_description.as_str()),
                e.error_details.clone(),
            ],
        };
        if let Some(route) = &envelope.route {
            array.push(serde_json::to_value(route)?);
        }
        Ok(serde_json::to_vec(&Value::Array(array))?)
    }

    /// Parse an OCPP-J frame. Call payloads are not checked here; see
    /// [`super::WireCodec::validate_call`].
    pub fn decode(&self, bytes: &[u8]) -> Result<Envelope, DecodeError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| DecodeError::malformed(format!("not JSON: {}", e)))?;
        let array = value
            .as_array()
            .ok_or_else(|| DecodeError::malformed("frame is not a JSON array"))?;

        let tag = array
            .first()
            .and_then(Value::as_i64)
            .ok_or_else(|| DecodeError::malformed("missing message type"))?;

        let correlation_id = array
            .get(1)
            .and_then(Value::as_str)
            .map(CorrelationId::from);

        let message_type = match MessageType::from_tag(tag) {
            Some(t) => t,
            None => {
                return Err(DecodeError::UnsupportedType {
                    tag,
                    correlation_id,
                })
            }
        };

        let correlation_id = correlation_id.ok_or_else(|| DecodeError::Malformed {
            reason: "message id is not a string".into(),
            message_type: Some(message_type),
            correlation_id: None,
            route: None,
        })?;

        let (base_len, route) = match message_type {
            MessageType::Call => (4, array.get(4)),
            MessageType::CallResult => (3, array.get(3)),
            MessageType::CallError => (5, array.get(5)),
        };
        let malformed = |reason: &str, route: Option<&Route>| DecodeError::Malformed {
            reason: reason.to_string(),
            message_type: Some(message_type),
            correlation_id: Some(correlation_id.clone()),
            route: route.cloned(),
        };
        if array.len() != base_len && array.len() != base_len + 1 {
            return Err(malformed("wrong number of elements", None));
        }
        let route: Option<Route> = match route {
            Some(v) => Some(
                serde_json::from_value(v.clone()).map_err(|_| malformed("invalid routing header", None))?,
            ),
            None => None,
        };

        let message = match message_type {
            MessageType::Call => {
                let action = array[2]
                    .as_str()
                    .map(Action::from)
                    .ok_or_else(|| malformed("action is not a string", route.as_ref()))?;
                Message::Call(Call {
                    correlation_id,
                    action,
                    payload: array[3].clone(),
                })
            }
            MessageType::CallResult => Message::CallResult(CallResult {
                correlation_id,
                payload: array[2].clone(),
            }),
            MessageType::CallError => {
                let error_code = array[2]
                    .as_str()
                    .map(ErrorCode::from)
                    .ok_or_else(|| malformed("error code is not a string", route.as_ref()))?;
                let error_description = array[3]
                    .as_str()
                    .ok_or_else(|| malformed("error description is not a string", route.as_ref()))?
                    .to_string();
                Message::CallError(CallError {
                    correlation_id,
                    error_code,
                    error_description,
                    error_details: array[4].clone(),
                })
            }
        };

        Ok(Envelope {
            message,
            route,
            action: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::WireCodec;
    use crate::error::PayloadViolation;
    use crate::types::{NetworkPath, ProtocolVersion};
    use serde_json::json;

    fn codec() -> JsonCodec {
        JsonCodec::new(Arc::new(SchemaRegistry::for_protocol(ProtocolVersion::Ocpp201)))
    }

    #[test]
    fn test_call_result_exact_bytes() {
        let env = Envelope::direct(CallResult::new("42", json!({"status": "Accepted"})));
        let bytes = codec().encode(&env).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), r#"[3,"42",{"status":"Accepted"}]"#);
    }

    #[test]
    fn test_call_parsing() {
        let json = r#"[2, "msg-123", "Heartbeat", {}]"#;
        let env = codec().decode(json.as_bytes()).unwrap();

        match env.message {
            Message::Call(call) => {
                assert_eq!(call.correlation_id, "msg-123");
                assert_eq!(call.action, "Heartbeat");
            }
            _ => panic!("Expected Call"),
        }
        assert!(env.route.is_none());
    }

    #[test]
    fn test_call_error_parsing() {
        let json = r#"[4, "msg-123", "NotImplemented", "Action not supported", {}]"#;
        let env = codec().decode(json.as_bytes()).unwrap();

        match env.message {
            Message::CallError(error) => {
                assert_eq!(error.correlation_id, "msg-123");
                assert_eq!(error.error_code, ErrorCode::NotImplemented);
                assert_eq!(error.error_description, "Action not supported");
            }
            _ => panic!("Expected CallError"),
        }
    }

    #[test]
    fn test_routed_frame() {
        let route = Route::new("CS1", NetworkPath::from_hops(["CSMS", "NN1"]));
        let env = Envelope::routed(Call::new("9", "Reset", json!({"type": "Immediate"})), route.clone());
        let bytes = codec().encode(&env).unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.ends_with(r#"{"destination":"CS1","networkPath":["CSMS","NN1"]}]"#));

        let decoded = codec().decode(&bytes).unwrap();
        assert_eq!(decoded.route, Some(route));
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_malformed_frames() {
        assert!(matches!(
            codec().decode(b"not json"),
            Err(DecodeError::Malformed { correlation_id: None, .. })
        ));
        assert!(matches!(
            codec().decode(br#"{"a": 1}"#),
            Err(DecodeError::Malformed { .. })
        ));
        // readable id, wrong arity: answerable
        let err = codec().decode(br#"[2, "5", "Heartbeat"]"#).unwrap_err();
        assert_eq!(err.answer().unwrap().error_code, ErrorCode::RpcFrameworkError);
    }

    #[test]
    fn test_unsupported_type_is_answered() {
        let err = codec().decode(br#"[7, "5", "Heartbeat", {}]"#).unwrap_err();
        let answer = err.answer().unwrap();
        assert_eq!(answer.correlation_id, "5");
        assert_eq!(answer.error_code, ErrorCode::MessageTypeNotSupported);
    }

    #[test]
    fn test_invalid_payload_classified() {
        let codec = WireCodec::Json(codec());
        let env = codec
            .decode(br#"[2, "6", "BootNotification", {"reason": "PowerUp"}]"#)
            .unwrap();
        let err = codec.validate_call(&env).unwrap_err();
        match &err {
            DecodeError::InvalidPayload { violation, .. } => {
                assert_eq!(violation, &PayloadViolation::MissingField("chargingStation".into()))
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(err.answer().unwrap().error_code, ErrorCode::OccurrenceConstraintViolation);
    }

    #[test]
    fn test_unknown_action_in_strict_mode() {
        let strict = WireCodec::json(Arc::new(
            SchemaRegistry::for_protocol(ProtocolVersion::Ocpp201).strict(true),
        ));
        let env = strict.decode(br#"[2, "7", "Foo", {}]"#).unwrap();
        let err = strict.validate_call(&env).unwrap_err();
        assert_eq!(err.answer().unwrap().error_code, ErrorCode::NotImplemented);

        // lenient codecs let it through to the dispatcher
        let lenient = WireCodec::Json(codec());
        assert!(lenient.validate_call(&env).is_ok());
    }

    #[test]
    fn test_decode_does_not_interpret_payloads() {
        // a forwarded Call whose payload this node's schema would reject
        let frame = br#"[2, "8", "Reset", {}, {"destination": "CP7", "networkPath": ["CSMS"]}]"#;
        let env = codec().decode(frame).unwrap();
        assert_eq!(env.route.as_ref().map(|r| r.destination.as_str()), Some("CP7"));

        let err = WireCodec::Json(codec()).validate_call(&env).unwrap_err();
        let reply = err.reply().unwrap();
        assert_eq!(reply.route.unwrap().destination, "CSMS");
        assert_eq!(reply.action, Some(Action::from("Reset")));
    }

    #[test]
    fn test_malformed_routed_call_keeps_route() {
        let err = codec()
            .decode(br#"[2, "9", 17, {}, {"destination": "CP7", "networkPath": ["CSMS", "NN1"]}]"#)
            .unwrap_err();
        assert_eq!(err.route().map(|r| r.network_path.len()), Some(2));
        assert_eq!(err.reply().unwrap().route.unwrap().destination, "CSMS");
    }
}
