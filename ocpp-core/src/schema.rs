//! Payload schema table keyed by action name
//!
//! The engine never interprets payloads. It only needs enough structure to
//! classify decode failures and to map OCPP-S element names:
//! - required top-level fields and their JSON kinds
//! - fields that are always lists (XML cannot tell a one-element list apart)
//! - request/response element names

use std::collections::HashMap;

use serde_json::Value;

use crate::error::PayloadViolation;
use crate::messages::MessageType;
use crate::types::{Action, ProtocolVersion};

/// JSON kind a field must have
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
    Any,
}

impl FieldKind {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Integer => value.is_i64() || value.is_u64(),
            FieldKind::Number => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Object => value.is_object(),
            FieldKind::Array => value.is_array(),
            FieldKind::Any => true,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FieldKind::String => "a string",
            FieldKind::Integer => "an integer",
            FieldKind::Number => "a number",
            FieldKind::Boolean => "a boolean",
            FieldKind::Object => "an object",
            FieldKind::Array => "an array",
            FieldKind::Any => "any value",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
}

/// Shape of one action's request and response payloads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionSchema {
    pub action: Action,
    pub request: Vec<FieldSpec>,
    pub response: Vec<FieldSpec>,
    pub list_fields: Vec<String>,
}

impl ActionSchema {
    pub fn new(action: impl Into<Action>) -> Self {
        Self {
            action: action.into(),
            request: Vec::new(),
            response: Vec::new(),
            list_fields: Vec::new(),
        }
    }

    /// Required request field
    pub fn requires(mut self, name: &str, kind: FieldKind) -> Self {
        self.request.push(FieldSpec {
            name: name.to_string(),
            kind,
        });
        if kind == FieldKind::Array {
            self.list_fields.push(name.to_string());
        }
        self
    }

    /// Required response field
    pub fn responds_with(mut self, name: &str, kind: FieldKind) -> Self {
        self.response.push(FieldSpec {
            name: name.to_string(),
            kind,
        });
        if kind == FieldKind::Array {
            self.list_fields.push(name.to_string());
        }
        self
    }

    /// Field (at any depth) that is always a list
    pub fn lists(mut self, name: &str) -> Self {
        self.list_fields.push(name.to_string());
        self
    }

    pub fn request_element(&self) -> String {
        request_element(&self.action)
    }

    pub fn response_element(&self) -> String {
        response_element(&self.action)
    }
}

/// OCPP-S body element of a request, e.g. `bootNotificationRequest`
pub fn request_element(action: &Action) -> String {
    format!("{}Request", lower_first(action.as_str()))
}

/// OCPP-S body element of a response, e.g. `bootNotificationResponse`
pub fn response_element(action: &Action) -> String {
    format!("{}Response", lower_first(action.as_str()))
}

/// Recover action and message kind from an OCPP-S body element name
pub fn parse_element(local_name: &str) -> Option<(Action, MessageType)> {
    let (stem, kind) = if let Some(stem) = local_name.strip_suffix("Request") {
        (stem, MessageType::Call)
    } else if let Some(stem) = local_name.strip_suffix("Response") {
        (stem, MessageType::CallResult)
    } else {
        return None;
    };
    if stem.is_empty() {
        return None;
    }
    Some((Action::new(upper_first(stem)), kind))
}

fn lower_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn upper_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Request rejected before reaching a handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    UnknownAction,
    Invalid(PayloadViolation),
}

/// Schema table for one protocol version.
///
/// Lenient (the default) lets actions without a schema through untouched;
/// strict rejects them as unknown.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<Action, ActionSchema>,
    strict: bool,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in catalogue for a protocol version
    pub fn for_protocol(version: ProtocolVersion) -> Self {
        let mut registry = Self::new();
        let catalogue = match version {
            ProtocolVersion::Ocpp15 | ProtocolVersion::Ocpp16 => ocpp16_catalogue(),
            ProtocolVersion::Ocpp201 | ProtocolVersion::Ocpp21 => ocpp201_catalogue(),
        };
        for schema in catalogue {
            registry.register(schema);
        }
        registry
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Add or replace the schema of an action
    pub fn register(&mut self, schema: ActionSchema) -> Option<ActionSchema> {
        self.schemas.insert(schema.action.clone(), schema)
    }

    pub fn get(&self, action: &Action) -> Option<&ActionSchema> {
        self.schemas.get(action)
    }

    pub fn knows(&self, action: &Action) -> bool {
        self.schemas.contains_key(action)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    pub fn validate_request(&self, action: &Action, payload: &Value) -> Result<(), Rejection> {
        match self.schemas.get(action) {
            Some(schema) => check_fields(&schema.request, payload).map_err(Rejection::Invalid),
            None if self.strict => Err(Rejection::UnknownAction),
            None => check_fields(&[], payload).map_err(Rejection::Invalid),
        }
    }

    pub fn validate_response(&self, action: &Action, payload: &Value) -> Result<(), PayloadViolation> {
        match self.schemas.get(action) {
            Some(schema) => check_fields(&schema.response, payload),
            None => check_fields(&[], payload),
        }
    }

    /// Whether `field` of `action` payloads is always a list
    pub fn is_list_field(&self, action: Option<&Action>, field: &str) -> bool {
        action
            .and_then(|a| self.schemas.get(a))
            .map(|schema| schema.list_fields.iter().any(|f| f == field))
            .unwrap_or(false)
    }
}

fn check_fields(fields: &[FieldSpec], payload: &Value) -> Result<(), PayloadViolation> {
    let object = payload.as_object().ok_or(PayloadViolation::NotAnObject)?;
    for field in fields {
        match object.get(&field.name) {
            None => return Err(PayloadViolation::MissingField(field.name.clone())),
            Some(value) if !field.kind.matches(value) => {
                return Err(PayloadViolation::WrongType {
                    field: field.name.clone(),
                    expected: field.kind.name(),
                })
            }
            Some(_) => {}
        }
    }
    Ok(())
}

fn ocpp16_catalogue() -> Vec<ActionSchema> {
    use FieldKind::*;
    vec![
        ActionSchema::new("Authorize")
            .requires("idTag", String)
            .responds_with("idTagInfo", Object),
        ActionSchema::new("BootNotification")
            .requires("chargePointVendor", String)
            .requires("chargePointModel", String)
            .responds_with("status", String)
            .responds_with("currentTime", String)
            .responds_with("interval", Integer),
        ActionSchema::new("Heartbeat").responds_with("currentTime", String),
        ActionSchema::new("StatusNotification")
            .requires("connectorId", Integer)
            .requires("errorCode", String)
            .requires("status", String),
        ActionSchema::new("MeterValues")
            .requires("connectorId", Integer)
            .requires("meterValue", Array)
            .lists("sampledValue"),
        ActionSchema::new("StartTransaction")
            .requires("connectorId", Integer)
            .requires("idTag", String)
            .requires("meterStart", Integer)
            .requires("timestamp", String)
            .responds_with("idTagInfo", Object)
            .responds_with("transactionId", Integer),
        ActionSchema::new("StopTransaction")
            .requires("meterStop", Integer)
            .requires("timestamp", String)
            .requires("transactionId", Integer)
            .lists("transactionData")
            .lists("sampledValue"),
        ActionSchema::new("DataTransfer")
            .requires("vendorId", String)
            .responds_with("status", String),
        ActionSchema::new("RemoteStartTransaction")
            .requires("idTag", String)
            .responds_with("status", String),
        ActionSchema::new("RemoteStopTransaction")
            .requires("transactionId", Integer)
            .responds_with("status", String),
        ActionSchema::new("Reset")
            .requires("type", String)
            .responds_with("status", String),
        ActionSchema::new("ChangeConfiguration")
            .requires("key", String)
            .requires("value", String)
            .responds_with("status", String),
        ActionSchema::new("GetConfiguration")
            .lists("key")
            .lists("configurationKey")
            .lists("unknownKey"),
    ]
}

fn ocpp201_catalogue() -> Vec<ActionSchema> {
    use FieldKind::*;
    vec![
        ActionSchema::new("Authorize")
            .requires("idToken", Object)
            .responds_with("idTokenInfo", Object),
        ActionSchema::new("BootNotification")
            .requires("chargingStation", Object)
            .requires("reason", String)
            .responds_with("currentTime", String)
            .responds_with("interval", Integer)
            .responds_with("status", String),
        ActionSchema::new("Heartbeat").responds_with("currentTime", String),
        ActionSchema::new("StatusNotification")
            .requires("timestamp", String)
            .requires("connectorStatus", String)
            .requires("evseId", Integer)
            .requires("connectorId", Integer),
        ActionSchema::new("MeterValues")
            .requires("evseId", Integer)
            .requires("meterValue", Array)
            .lists("sampledValue"),
        ActionSchema::new("TransactionEvent")
            .requires("eventType", String)
            .requires("timestamp", String)
            .requires("triggerReason", String)
            .requires("seqNo", Integer)
            .requires("transactionInfo", Object)
            .lists("meterValue")
            .lists("sampledValue"),
        ActionSchema::new("DataTransfer")
            .requires("vendorId", String)
            .responds_with("status", String),
        ActionSchema::new("SetVariables")
            .requires("setVariableData", Array)
            .responds_with("setVariableResult", Array),
        ActionSchema::new("GetVariables")
            .requires("getVariableData", Array)
            .responds_with("getVariableResult", Array),
        ActionSchema::new("Reset")
            .requires("type", String)
            .responds_with("status", String),
        ActionSchema::new("RequestStartTransaction")
            .requires("idToken", Object)
            .requires("remoteStartId", Integer)
            .responds_with("status", String),
        ActionSchema::new("RequestStopTransaction")
            .requires("transactionId", String)
            .responds_with("status", String),
        ActionSchema::new("SetChargingProfile")
            .requires("evseId", Integer)
            .requires("chargingProfile", Object)
            .responds_with("status", String)
            .lists("chargingSchedule")
            .lists("chargingSchedulePeriod"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_element_names() {
        let action = Action::from("BootNotification");
        assert_eq!(request_element(&action), "bootNotificationRequest");
        assert_eq!(response_element(&action), "bootNotificationResponse");

        assert_eq!(
            parse_element("bootNotificationRequest"),
            Some((Action::from("BootNotification"), MessageType::Call))
        );
        assert_eq!(
            parse_element("heartbeatResponse"),
            Some((Action::from("Heartbeat"), MessageType::CallResult))
        );
        assert_eq!(parse_element("Fault"), None);
        assert_eq!(parse_element("Request"), None);
    }

    #[test]
    fn test_validate_request() {
        let registry = SchemaRegistry::for_protocol(ProtocolVersion::Ocpp201);
        let boot = Action::from("BootNotification");

        let ok = json!({"chargingStation": {"model": "X", "vendorName": "Y"}, "reason": "PowerUp"});
        assert!(registry.validate_request(&boot, &ok).is_ok());

        let missing = json!({"reason": "PowerUp"});
        assert_eq!(
            registry.validate_request(&boot, &missing),
            Err(Rejection::Invalid(PayloadViolation::MissingField("chargingStation".into())))
        );

        let wrong = json!({"chargingStation": "X", "reason": "PowerUp"});
        assert!(matches!(
            registry.validate_request(&boot, &wrong),
            Err(Rejection::Invalid(PayloadViolation::WrongType { .. }))
        ));

        assert_eq!(
            registry.validate_request(&boot, &json!([1, 2])),
            Err(Rejection::Invalid(PayloadViolation::NotAnObject))
        );
    }

    #[test]
    fn test_strict_rejects_unknown_actions() {
        let lenient = SchemaRegistry::for_protocol(ProtocolVersion::Ocpp16);
        assert!(lenient.validate_request(&"Foo".into(), &json!({})).is_ok());

        let strict = SchemaRegistry::for_protocol(ProtocolVersion::Ocpp16).strict(true);
        assert_eq!(
            strict.validate_request(&"Foo".into(), &json!({})),
            Err(Rejection::UnknownAction)
        );
    }

    #[test]
    fn test_list_fields() {
        let registry = SchemaRegistry::for_protocol(ProtocolVersion::Ocpp16);
        let meter = Action::from("MeterValues");
        assert!(registry.is_list_field(Some(&meter), "meterValue"));
        assert!(registry.is_list_field(Some(&meter), "sampledValue"));
        assert!(!registry.is_list_field(Some(&meter), "connectorId"));
        assert!(!registry.is_list_field(None, "meterValue"));
    }
}
