//! Property tests for the codecs and network paths

use std::sync::Arc;

use ocpp_core::codec::{self, SoapContext};
use ocpp_core::{
    Call, CallError, CallResult, Envelope, ErrorCode, Message, NetworkPath, ProtocolVersion, Route, SchemaRegistry,
    TransportKind, WireCodec,
};
use proptest::prelude::*;
use serde_json::{Map, Value};

const ERROR_CODES: &[&str] = &[
    "NotImplemented",
    "NotSupported",
    "InternalError",
    "ProtocolError",
    "SecurityError",
    "FormatViolation",
    "PropertyConstraintViolation",
    "OccurrenceConstraintViolation",
    "TypeConstraintViolation",
    "GenericError",
    "RoutingFailure",
    "VendorSpecificFailure",
];

fn scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        "[ -~]{0,20}".prop_map(Value::from),
    ]
}

fn object(values: impl Strategy<Value = Value>) -> impl Strategy<Value = Value> {
    prop::collection::btree_map("[a-z][a-zA-Z0-9]{0,8}", values, 0..6)
        .prop_map(|fields| Value::Object(fields.into_iter().collect::<Map<String, Value>>()))
}

/// Objects of scalars, nested at most once
fn payload() -> impl Strategy<Value = Value> {
    object(prop_oneof![3 => scalar(), 1 => object(scalar())])
}

/// Arbitrary JSON without floats; floats do not survive text round trips bit-exactly
fn json_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        ".{0,12}".prop_map(Value::from),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map(".{0,6}", inner, 0..4)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

fn node_id() -> impl Strategy<Value = String> {
    "[A-Z]{2}[0-9]{1,3}"
}

fn route() -> impl Strategy<Value = Option<Route>> {
    prop::option::of(
        (node_id(), prop::collection::vec(node_id(), 0..5))
            .prop_map(|(destination, hops)| Route::new(destination, NetworkPath::from_hops(hops))),
    )
}

fn envelope() -> impl Strategy<Value = Envelope> {
    let id = "[a-zA-Z0-9-]{1,36}";
    // Call payloads are always JSON objects
    let call_payload = prop::collection::btree_map("[a-zA-Z]{1,8}", json_value(), 0..4)
        .prop_map(|m| Value::Object(m.into_iter().collect()));
    let message = prop_oneof![
        (id, "[A-Z][a-zA-Z]{0,20}", call_payload)
            .prop_map(|(id, action, payload)| Message::from(Call::new(id, action, payload))),
        (id, json_value()).prop_map(|(id, payload)| Message::from(CallResult::new(id, payload))),
        (id, prop::sample::select(ERROR_CODES), ".{0,30}", json_value()).prop_map(
            |(id, code, description, details)| {
                Message::from(CallError::new(id, ErrorCode::from(code), description).with_details(details))
            }
        ),
    ];
    (message, route()).prop_map(|(message, route)| Envelope::direct(message).with_route(route))
}

fn soap_codec() -> WireCodec {
    WireCodec::soap(
        SoapContext::for_identity("CB1".into()),
        Arc::new(SchemaRegistry::for_protocol(ProtocolVersion::Ocpp16)),
    )
}

proptest! {
    #[test]
    fn json_frames_round_trip(env in envelope()) {
        let bytes = codec::encode(&env, TransportKind::Json).unwrap();
        let decoded = codec::decode(&bytes, TransportKind::Json).unwrap();
        prop_assert_eq!(decoded, env);
    }

    #[test]
    fn soap_requests_round_trip(id in "[a-z0-9-]{1,36}", payload in payload()) {
        let codec = soap_codec();
        let env = Envelope::direct(Call::new(id, "VendorEcho", payload));
        let bytes = codec.encode(&env).unwrap();
        prop_assert_eq!(codec.decode(&bytes).unwrap(), env);
    }

    #[test]
    fn soap_responses_round_trip(id in "[a-z0-9-]{1,36}", payload in payload()) {
        let codec = soap_codec();
        let env = Envelope::direct(CallResult::new(id, payload)).with_action("VendorEcho".into());
        let bytes = codec.encode(&env).unwrap();
        prop_assert_eq!(codec.decode(&bytes).unwrap(), env);
    }

    #[test]
    fn reply_walks_the_path_backwards(hops in prop::collection::hash_set(node_id(), 1..8)) {
        let hops: Vec<String> = hops.into_iter().collect();
        let path = NetworkPath::from_hops(hops.iter().cloned());
        let reply = Route::new("DEST", path.clone()).reply().unwrap();

        prop_assert_eq!(&reply.destination, &hops[0]);
        // every hop but the originator hands the answer to its predecessor
        for window in hops.windows(2) {
            prop_assert_eq!(reply.network_path.previous_hop(&window[1]), Some(&window[0]));
        }
        prop_assert_eq!(reply.network_path.previous_hop(&hops[0]), None);
        prop_assert!(path.first_repeated().is_none());
    }

    #[test]
    fn repeated_hop_is_detected(hops in prop::collection::vec(node_id(), 1..6), pick in any::<prop::sample::Index>()) {
        let mut hops = hops;
        let repeated = pick.get(&hops).clone();
        hops.push(repeated);
        let path = NetworkPath::from_hops(hops);
        prop_assert!(path.first_repeated().is_some());
    }
}
