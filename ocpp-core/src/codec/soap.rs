//! OCPP-S framing: SOAP 1.2 envelopes with WS-Addressing headers
//!
//! ```text
//! <s:Envelope>
//!   <s:Header>
//!     <ocpp:chargeBoxIdentity>CB1</ocpp:chargeBoxIdentity>
//!     <wsa:MessageID>..</wsa:MessageID>     (requests)
//!     <wsa:RelatesTo>..</wsa:RelatesTo>     (responses and faults)
//!     <wsa:Action>/BootNotification</wsa:Action>
//!     <nn:route>..</nn:route>               (forwarded messages only)
//!   </s:Header>
//!   <s:Body><ocpp:bootNotificationRequest>..</ocpp:bootNotificationRequest></s:Body>
//! </s:Envelope>
//! ```
//!
//! Payload mapping:
//! - object fields become child elements, arrays become repeated elements
//! - non-string scalars carry `xsi:type` so they decode to the same JSON kind
//! - nulls and empty arrays are omitted
//! - an untyped element without content decodes as `{}`
//!
//! XML cannot tell a one-element array from a single child, so a repeated
//! field decodes as an array only when the schema lists it as one. The
//! round trip is therefore exact only for payloads the schema describes:
//! no nulls, no empty arrays, and every list field registered.
//!
//! Correlation ids are read trimmed from the header.

use std::fmt::Display;
use std::sync::Arc;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use serde_json::{Map, Number, Value};

use crate::error::{CodecError, DecodeError};
use crate::messages::{Call, CallError, CallResult, Envelope, ErrorCode, Message, MessageType};
use crate::schema::{parse_element, request_element, response_element, SchemaRegistry};
use crate::types::{Action, CorrelationId, NetworkPath, PeerIdentity, Route};

pub const SOAP_ENV_NS: &str = "http://www.w3.org/2003/05/soap-envelope";
pub const WSA_NS: &str = "http://www.w3.org/2005/08/addressing";
pub const XSI_NS: &str = "http://www.w3.org/2001/XMLSchema-instance";
pub const XSD_NS: &str = "http://www.w3.org/2001/XMLSchema";
pub const ROUTING_NS: &str = "urn://Ocpp/NetworkNode/2024/";
pub const DEFAULT_SERVICE_NS: &str = "urn://Ocpp/Cs/2012/06/";

/// HTTP content type of every OCPP-S body
pub const CONTENT_TYPE: &str = "application/soap+xml; charset=utf-8";

/// `wsa:Action` of a header-only poll envelope
pub const POLL_ACTION: &str = "/Poll";

/// Per-connection values written into every outgoing header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoapContext {
    pub service_namespace: String,
    pub charge_box_identity: Option<PeerIdentity>,
    /// Own endpoint, written as `wsa:From` and `wsa:ReplyTo`
    pub from_address: Option<String>,
    pub to_address: Option<String>,
}

impl Default for SoapContext {
    fn default() -> Self {
        Self {
            service_namespace: DEFAULT_SERVICE_NS.to_string(),
            charge_box_identity: None,
            from_address: None,
            to_address: None,
        }
    }
}

impl SoapContext {
    pub fn for_identity(identity: PeerIdentity) -> Self {
        Self {
            charge_box_identity: Some(identity),
            ..Default::default()
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.service_namespace = namespace.into();
        self
    }

    pub fn with_from(mut self, address: impl Into<String>) -> Self {
        self.from_address = Some(address.into());
        self
    }

    pub fn with_to(mut self, address: impl Into<String>) -> Self {
        self.to_address = Some(address.into());
        self
    }
}

/// Header fields readable without decoding the body
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SoapHeader {
    pub charge_box_identity: Option<PeerIdentity>,
    pub message_id: Option<CorrelationId>,
    pub relates_to: Option<CorrelationId>,
    /// Raw `wsa:Action`, e.g. `/BootNotification`
    pub action: Option<String>,
    pub from_address: Option<String>,
    pub route: Option<Route>,
    pub has_body: bool,
    pub is_fault: bool,
}

impl SoapHeader {
    /// Header-only envelope asking for queued central-system requests
    pub fn is_poll(&self) -> bool {
        !self.has_body
    }

    /// Answers carry `wsa:RelatesTo`
    pub fn is_response(&self) -> bool {
        self.has_body && self.relates_to.is_some()
    }

    /// Action named by a `/XResponse` header
    pub fn answered_action(&self) -> Option<Action> {
        self.action
            .as_deref()
            .map(|a| a.trim_start_matches('/'))
            .and_then(|a| a.strip_suffix("Response"))
            .filter(|a| !a.is_empty())
            .map(Action::from)
    }
}

/// Read the header of an envelope
pub fn peek_header(bytes: &[u8]) -> Result<SoapHeader, DecodeError> {
    let root = parse_document(bytes)?;
    read_header(&root)
}

#[derive(Debug, Clone)]
pub struct SoapCodec {
    context: SoapContext,
    schema: Arc<SchemaRegistry>,
}

impl SoapCodec {
    pub fn new(context: SoapContext, schema: Arc<SchemaRegistry>) -> Self {
        Self { context, schema }
    }

    pub fn context(&self) -> &SoapContext {
        &self.context
    }

    pub fn schema(&self) -> &SchemaRegistry {
        &self.schema
    }

    pub fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
        let mut out = XmlOut::new();
        out.open_envelope(&self.context.service_namespace)?;

        out.start("s:Header", &[])?;
        self.write_identity(&mut out)?;
        let wsa_action = match &envelope.message {
            Message::Call(call) => {
                out.leaf("wsa:MessageID", &[], call.correlation_id.as_str())?;
                Some(format!("/{}", call.action))
            }
            other => {
                out.leaf("wsa:RelatesTo", &[], other.correlation_id().as_str())?;
                envelope.action.as_ref().map(|a| format!("/{}Response", a))
            }
        };
        if let Some(action) = wsa_action {
            out.leaf("wsa:Action", &[], &action)?;
        }
        self.write_addressing(&mut out, envelope.message.is_call())?;
        if let Some(route) = &envelope.route {
            out.start("nn:route", &[])?;
            out.leaf("nn:destination", &[], &route.destination)?;
            for hop in route.network_path.hops() {
                out.leaf("nn:node", &[], hop)?;
            }
            out.end("nn:route")?;
        }
        out.end("s:Header")?;

        out.start("s:Body", &[])?;
        match &envelope.message {
            Message::Call(call) => {
                out.payload(&format!("ocpp:{}", request_element(&call.action)), &call.payload)?
            }
            Message::CallResult(result) => {
                let action = envelope
                    .action
                    .as_ref()
                    .ok_or_else(|| CodecError::MissingAction(result.correlation_id.clone()))?;
                out.payload(&format!("ocpp:{}", response_element(action)), &result.payload)?
            }
            Message::CallError(error) => out.fault(error)?,
        }
        out.end("s:Body")?;
        out.end("s:Envelope")?;
        Ok(out.finish())
    }

    /// Header-only envelope a station posts to collect queued requests
    pub fn encode_poll(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = XmlOut::new();
        out.open_envelope(&self.context.service_namespace)?;
        out.start("s:Header", &[])?;
        self.write_identity(&mut out)?;
        out.leaf("wsa:MessageID", &[], CorrelationId::generate().as_str())?;
        out.leaf("wsa:Action", &[], POLL_ACTION)?;
        self.write_addressing(&mut out, false)?;
        out.end("s:Header")?;
        out.empty("s:Body", &[])?;
        out.end("s:Envelope")?;
        Ok(out.finish())
    }

    fn write_identity(&self, out: &mut XmlOut) -> Result<(), CodecError> {
        if let Some(identity) = &self.context.charge_box_identity {
            out.leaf("ocpp:chargeBoxIdentity", &[], identity.as_str())?;
        }
        Ok(())
    }

    fn write_addressing(&self, out: &mut XmlOut, is_call: bool) -> Result<(), CodecError> {
        if let Some(from) = &self.context.from_address {
            out.start("wsa:From", &[])?;
            out.leaf("wsa:Address", &[], from)?;
            out.end("wsa:From")?;
            if is_call {
                out.start("wsa:ReplyTo", &[])?;
                out.leaf("wsa:Address", &[], from)?;
                out.end("wsa:ReplyTo")?;
            }
        }
        if let Some(to) = &self.context.to_address {
            out.leaf("wsa:To", &[], to)?;
        }
        Ok(())
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Envelope, DecodeError> {
        let root = parse_document(bytes)?;
        let header = read_header(&root)?;
        let element = root
            .child("Body")
            .and_then(|body| body.children.first())
            .ok_or_else(|| DecodeError::malformed("SOAP body is empty"))?;

        if element.name == "Fault" {
            return self.decode_fault(element, header);
        }

        let (action, kind) = parse_element(&element.name).ok_or_else(|| {
            DecodeError::malformed(format!("unexpected body element '{}'", element.name))
        })?;

        match kind {
            MessageType::Call => {
                let correlation_id = header.message_id.ok_or_else(|| DecodeError::Malformed {
                    reason: "request without wsa:MessageID".into(),
                    message_type: Some(MessageType::Call),
                    correlation_id: None,
                    route: header.route.clone(),
                })?;
                let payload = node_to_value(element, Some(&action), &self.schema).map_err(|reason| {
                    DecodeError::Malformed {
                        reason,
                        message_type: Some(MessageType::Call),
                        correlation_id: Some(correlation_id.clone()),
                        route: header.route.clone(),
                    }
                })?;

                Ok(Envelope {
                    message: Message::Call(Call {
                        correlation_id,
                        action,
                        payload,
                    }),
                    route: header.route,
                    action: None,
                })
            }
            _ => {
                let correlation_id = header.relates_to.ok_or_else(|| DecodeError::Malformed {
                    reason: "response without wsa:RelatesTo".into(),
                    message_type: Some(MessageType::CallResult),
                    correlation_id: None,
                    route: header.route.clone(),
                })?;
                let payload = node_to_value(element, Some(&action), &self.schema).map_err(|reason| {
                    DecodeError::Malformed {
                        reason,
                        message_type: Some(MessageType::CallResult),
                        correlation_id: Some(correlation_id.clone()),
                        route: header.route.clone(),
                    }
                })?;
                Ok(Envelope {
                    message: Message::CallResult(CallResult {
                        correlation_id,
                        payload,
                    }),
                    route: header.route,
                    action: Some(action),
                })
            }
        }
    }

    fn decode_fault(&self, fault: &XmlNode, header: SoapHeader) -> Result<Envelope, DecodeError> {
        let correlation_id = header.relates_to.clone().ok_or_else(|| DecodeError::Malformed {
            reason: "fault without wsa:RelatesTo".into(),
            message_type: Some(MessageType::CallError),
            correlation_id: None,
            route: header.route.clone(),
        })?;
        let action = header.answered_action();

        let error_code = fault
            .child("Code")
            .and_then(|code| code.child("Subcode"))
            .and_then(|sub| sub.child("Value"))
            .map(|value| ErrorCode::from(value.text.trim()))
            .unwrap_or(ErrorCode::GenericError);
        let error_description = fault
            .child("Reason")
            .and_then(|reason| reason.child("Text"))
            .map(|text| text.text.clone())
            .unwrap_or_default();
        let error_details = match fault.child("Detail") {
            Some(detail) => node_to_value(detail, action.as_ref(), &self.schema).map_err(|reason| {
                DecodeError::Malformed {
                    reason,
                    message_type: Some(MessageType::CallError),
                    correlation_id: Some(correlation_id.clone()),
                    route: header.route.clone(),
                }
            })?,
            None => Value::Object(Map::new()),
        };

        Ok(Envelope {
            message: Message::CallError(CallError {
                correlation_id,
                error_code,
                error_description,
                error_details,
            }),
            route: header.route,
            action,
        })
    }
}

/// SOAP 1.2 fault role: `Sender` when the request itself was at fault
fn fault_role(code: &ErrorCode) -> &'static str {
    match code {
        ErrorCode::FormatViolation
        | ErrorCode::FormationViolation
        | ErrorCode::MessageTypeNotSupported
        | ErrorCode::OccurrenceConstraintViolation
        | ErrorCode::PropertyConstraintViolation
        | ErrorCode::ProtocolError
        | ErrorCode::RpcFrameworkError
        | ErrorCode::SecurityError
        | ErrorCode::TypeConstraintViolation => "s:Sender",
        _ => "s:Receiver",
    }
}

fn xml_err(e: impl Display) -> CodecError {
    CodecError::Xml(e.to_string())
}

struct XmlOut {
    writer: Writer<Vec<u8>>,
}

impl XmlOut {
    fn new() -> Self {
        Self {
            writer: Writer::new(Vec::new()),
        }
    }

    fn finish(self) -> Vec<u8> {
        self.writer.into_inner()
    }

    fn open_envelope(&mut self, service_namespace: &str) -> Result<(), CodecError> {
        self.writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(xml_err)?;
        self.start(
            "s:Envelope",
            &[
                ("xmlns:s", SOAP_ENV_NS),
                ("xmlns:wsa", WSA_NS),
                ("xmlns:ocpp", service_namespace),
                ("xmlns:xsi", XSI_NS),
                ("xmlns:xsd", XSD_NS),
                ("xmlns:nn", ROUTING_NS),
            ],
        )
    }

    fn element(name: &str, attrs: &[(&str, &str)]) -> BytesStart<'static> {
        let mut start = BytesStart::new(name.to_string());
        for attr in attrs {
            start.push_attribute(*attr);
        }
        start
    }

    fn start(&mut self, name: &str, attrs: &[(&str, &str)]) -> Result<(), CodecError> {
        self.writer
            .write_event(Event::Start(Self::element(name, attrs)))
            .map_err(xml_err)
    }

    fn empty(&mut self, name: &str, attrs: &[(&str, &str)]) -> Result<(), CodecError> {
        self.writer
            .write_event(Event::Empty(Self::element(name, attrs)))
            .map_err(xml_err)
    }

    fn end(&mut self, name: &str) -> Result<(), CodecError> {
        self.writer
            .write_event(Event::End(BytesEnd::new(name.to_string())))
            .map_err(xml_err)
    }

    fn leaf(&mut self, name: &str, attrs: &[(&str, &str)], text: &str) -> Result<(), CodecError> {
        self.start(name, attrs)?;
        if !text.is_empty() {
            self.writer
                .write_event(Event::Text(BytesText::new(text)))
                .map_err(xml_err)?;
        }
        self.end(name)
    }

    /// Body element of a request or response
    fn payload(&mut self, name: &str, payload: &Value) -> Result<(), CodecError> {
        match payload {
            Value::Null => self.leaf(name, &[], ""),
            Value::Array(_) => Err(CodecError::Xml("payload must not be a list".into())),
            other => self.field(name, other),
        }
    }

    fn field(&mut self, name: &str, value: &Value) -> Result<(), CodecError> {
        match value {
            Value::Null => Ok(()),
            Value::Array(items) => {
                for item in items {
                    self.field(name, item)?;
                }
                Ok(())
            }
            Value::Object(fields) => {
                self.start(name, &[])?;
                for (key, value) in fields {
                    self.field(&format!("ocpp:{}", key), value)?;
                }
                self.end(name)
            }
            // blank strings would otherwise read back as empty objects
            Value::String(s) if s.trim().is_empty() => {
                self.leaf(name, &[("xsi:type", "xsd:string")], s)
            }
            Value::String(s) => self.leaf(name, &[], s),
            Value::Bool(b) => self.leaf(
                name,
                &[("xsi:type", "xsd:boolean")],
                if *b { "true" } else { "false" },
            ),
            Value::Number(n) => {
                let xsi_type = if n.is_f64() { "xsd:double" } else { "xsd:long" };
                self.leaf(name, &[("xsi:type", xsi_type)], &n.to_string())
            }
        }
    }

    fn fault(&mut self, error: &CallError) -> Result<(), CodecError> {
        self.start("s:Fault", &[])?;
        self.start("s:Code", &[])?;
        self.leaf("s:Value", &[], fault_role(&error.error_code))?;
        self.start("s:Subcode", &[])?;
        self.leaf("s:Value", &[], error.error_code.as_str())?;
        self.end("s:Subcode")?;
        self.end("s:Code")?;
        self.start("s:Reason", &[])?;
        self.leaf("s:Text", &[("xml:lang", "en")], &error.error_description)?;
        self.end("s:Reason")?;
        self.field("s:Detail", &error.error_details)?;
        self.end("s:Fault")
    }
}

/// Element tree keyed by local names; namespaces are not resolved
#[derive(Debug, Clone, Default)]
struct XmlNode {
    name: String,
    attrs: Vec<(String, String)>,
    text: String,
    children: Vec<XmlNode>,
}

impl XmlNode {
    fn open(start: &BytesStart<'_>) -> Result<Self, DecodeError> {
        let name = utf8(start.local_name().as_ref())?.to_string();
        let mut attrs = Vec::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| DecodeError::malformed(format!("bad attribute: {}", e)))?;
            let key = utf8(attr.key.local_name().as_ref())?.to_string();
            let value = attr
                .unescape_value()
                .map_err(|e| DecodeError::malformed(format!("bad attribute value: {}", e)))?
                .into_owned();
            attrs.push((key, value));
        }
        Ok(Self {
            name,
            attrs,
            ..Default::default()
        })
    }

    fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.name == name)
    }

    fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlNode> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    fn trimmed_text(&self) -> Option<String> {
        let text = self.text.trim();
        (!text.is_empty()).then(|| text.to_string())
    }
}

fn utf8(bytes: &[u8]) -> Result<&str, DecodeError> {
    std::str::from_utf8(bytes).map_err(|_| DecodeError::malformed("XML name is not UTF-8"))
}

fn parse_document(bytes: &[u8]) -> Result<XmlNode, DecodeError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| DecodeError::malformed("SOAP message is not UTF-8"))?;
    let mut reader = Reader::from_str(text);
    let mut stack: Vec<XmlNode> = Vec::new();
    let mut root: Option<XmlNode> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| DecodeError::malformed(format!("XML error: {}", e)))?;
        match event {
            Event::Start(start) => stack.push(XmlNode::open(&start)?),
            Event::Empty(start) => {
                let node = XmlNode::open(&start)?;
                attach(&mut stack, &mut root, node)?;
            }
            Event::End(_) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| DecodeError::malformed("unbalanced end tag"))?;
                attach(&mut stack, &mut root, node)?;
            }
            Event::Text(text) => {
                if let Some(top) = stack.last_mut() {
                    let text = text
                        .unescape()
                        .map_err(|e| DecodeError::malformed(format!("bad text: {}", e)))?;
                    top.text.push_str(&text);
                }
            }
            Event::CData(data) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(utf8(&data)?);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(DecodeError::malformed("unterminated element"));
    }
    let root = root.ok_or_else(|| DecodeError::malformed("empty document"))?;
    if root.name != "Envelope" {
        return Err(DecodeError::malformed(format!(
            "expected SOAP Envelope, found '{}'",
            root.name
        )));
    }
    Ok(root)
}

fn attach(
    stack: &mut [XmlNode],
    root: &mut Option<XmlNode>,
    node: XmlNode,
) -> Result<(), DecodeError> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(node),
        None if root.is_some() => return Err(DecodeError::malformed("multiple root elements")),
        None => *root = Some(node),
    }
    Ok(())
}

fn read_header(root: &XmlNode) -> Result<SoapHeader, DecodeError> {
    let body_child = root.child("Body").and_then(|body| body.children.first());
    let mut header = SoapHeader {
        has_body: body_child.is_some(),
        is_fault: body_child.map(|c| c.name == "Fault").unwrap_or(false),
        ..Default::default()
    };

    let Some(node) = root.child("Header") else {
        return Ok(header);
    };

    for field in &node.children {
        match field.name.as_str() {
            "chargeBoxIdentity" => {
                header.charge_box_identity = field.trimmed_text().map(PeerIdentity::from)
            }
            "MessageID" => header.message_id = field.trimmed_text().map(CorrelationId::from),
            "RelatesTo" => header.relates_to = field.trimmed_text().map(CorrelationId::from),
            "Action" => header.action = field.trimmed_text(),
            "From" => {
                header.from_address = field.child("Address").and_then(XmlNode::trimmed_text)
            }
            "route" => {
                let destination = field
                    .child("destination")
                    .and_then(XmlNode::trimmed_text)
                    .ok_or_else(|| DecodeError::malformed("routing header without destination"))?;
                let hops = field.children_named("node").filter_map(XmlNode::trimmed_text);
                header.route = Some(Route::new(destination, NetworkPath::from_hops(hops)));
            }
            _ => {}
        }
    }
    Ok(header)
}

fn node_to_value(
    node: &XmlNode,
    action: Option<&Action>,
    schema: &SchemaRegistry,
) -> Result<Value, String> {
    if node.children.is_empty() {
        return scalar(node);
    }

    let mut fields = Map::new();
    for child in &node.children {
        let value = node_to_value(child, action, schema)?;
        // single elements never decode to arrays, so an array here was built by us
        let merged = match fields.remove(&child.name) {
            Some(Value::Array(mut items)) => {
                items.push(value);
                Value::Array(items)
            }
            Some(previous) => Value::Array(vec![previous, value]),
            None if schema.is_list_field(action, &child.name) => Value::Array(vec![value]),
            None => value,
        };
        fields.insert(child.name.clone(), merged);
    }
    Ok(Value::Object(fields))
}

fn scalar(node: &XmlNode) -> Result<Value, String> {
    let xsi_type = node
        .attr("type")
        .map(|t| t.split_once(':').map(|(_, local)| local).unwrap_or(t));
    let text = node.text.as_str();

    match xsi_type {
        Some("boolean") => match text.trim() {
            "true" | "1" => Ok(Value::Bool(true)),
            "false" | "0" => Ok(Value::Bool(false)),
            other => Err(format!("'{}' in <{}> is not a boolean", other, node.name)),
        },
        Some("long" | "int" | "integer" | "short" | "unsignedInt" | "unsignedLong") => {
            let trimmed = text.trim();
            trimmed
                .parse::<i64>()
                .map(Value::from)
                .or_else(|_| trimmed.parse::<u64>().map(Value::from))
                .map_err(|_| format!("'{}' in <{}> is not an integer", trimmed, node.name))
        }
        Some("double" | "float" | "decimal") => text
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| format!("'{}' in <{}> is not a number", text.trim(), node.name)),
        Some(_) => Ok(Value::String(text.to_string())),
        None if text.trim().is_empty() => Ok(Value::Object(Map::new())),
        None => Ok(Value::String(text.to_string())),
    }
}
