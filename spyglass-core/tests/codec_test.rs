use fixture_service::FILE_DESCRIPTOR_SET;
use prost_reflect::{DescriptorPool, DynamicMessage, MessageDescriptor, Value};
use serde_json::json;
use spyglass_core::codec::{
    self, CodecError, CodecOptions, PathSegment, decode_bytes, decode_message, encode_json,
    encode_text, encode_to_vec, split_messages,
};

fn message(name: &str) -> MessageDescriptor {
    DescriptorPool::decode(FILE_DESCRIPTOR_SET)
        .expect("Failed to decode descriptors")
        .get_message_by_name(name)
        .expect("Message not found in fixture descriptors")
}

fn sample() -> MessageDescriptor {
    message("playground.Sample")
}

fn encode(desc: &MessageDescriptor, json: serde_json::Value) -> Result<DynamicMessage, CodecError> {
    encode_json(desc, &json, &CodecOptions::default())
}

fn round_trip(desc: &MessageDescriptor, json: serde_json::Value) -> serde_json::Value {
    let bytes = encode_to_vec(desc, &json.to_string(), &CodecOptions::default()).unwrap();
    decode_bytes(desc, &bytes).unwrap()
}

#[test]
fn test_blank_text_is_an_empty_message() {
    let encoded = encode_text(&sample(), "   \n", &CodecOptions::default()).unwrap();
    assert_eq!(decode_message(&encoded).unwrap(), json!({}));
}

#[test]
fn test_parse_errors_carry_a_position() {
    let err = encode_text(&sample(), "{\n  \"label\": }", &CodecOptions::default()).unwrap_err();

    match err {
        CodecError::Parse { line, column, .. } => {
            assert_eq!(line, 2);
            assert!(column > 0);
        }
        other => panic!("Expected a parse error, got {other:?}"),
    }
}

#[test]
fn test_unknown_fields_are_rejected_with_their_path() {
    let err = encode(&sample(), json!({"tree": {"left": {"colour": 1}}})).unwrap_err();

    assert!(matches!(err, CodecError::Type { .. }));
    assert_eq!(err.path().unwrap().to_string(), "tree.left");
    assert!(err.to_string().contains("colour"));
}

#[test]
fn test_type_errors_point_into_collections() {
    let err = encode(&sample(), json!({"tags": ["a", 2]})).unwrap_err();
    assert_eq!(
        err.path().unwrap().segments(),
        [PathSegment::Field("tags".to_string()), PathSegment::Index(1)]
    );

    let err = encode(&sample(), json!({"counts": {"x": "many"}})).unwrap_err();
    assert_eq!(err.path().unwrap().to_string(), "counts[\"x\"]");
}

#[test]
fn test_out_of_range_integers() {
    let err = encode(&sample(), json!({"small": 2147483648i64})).unwrap_err();
    assert!(matches!(err, CodecError::Range { .. }), "{err:?}");

    let err = encode(&sample(), json!({"unsigned": -1})).unwrap_err();
    assert!(matches!(err, CodecError::Range { .. }), "{err:?}");

    let err = encode(&sample(), json!({"small": 1.5})).unwrap_err();
    assert!(matches!(err, CodecError::Type { .. }), "{err:?}");
}

#[test]
fn test_sixty_four_bit_integers_are_strings() {
    let decoded = round_trip(
        &sample(),
        json!({"big": -9007199254740993i64, "huge": "18446744073709551615", "fixed": 5}),
    );

    assert_eq!(decoded["big"], "-9007199254740993");
    assert_eq!(decoded["huge"], "18446744073709551615");
    assert_eq!(decoded["fixed"], "5");
}

#[test]
fn test_defaults_are_omitted_but_presence_is_kept() {
    let decoded = round_trip(
        &sample(),
        json!({"small": 0, "label": "", "flag": false, "note": "", "color": "COLOR_UNSPECIFIED"}),
    );
    assert_eq!(decoded, json!({"note": ""}));

    let lease = message("playground.Lease");
    assert_eq!(round_trip(&lease, json!({"ttl": 0})), json!({"ttl": 0}));
    assert_eq!(round_trip(&lease, json!({})), json!({}));
}

#[test]
fn test_null_clears_a_field() {
    let decoded = round_trip(&sample(), json!({"label": null, "tree": null}));
    assert_eq!(decoded, json!({}));
}

#[test]
fn test_enums_by_name_or_number() {
    let decoded = round_trip(&sample(), json!({"color": 2, "palette": ["COLOR_RED", 7]}));

    assert_eq!(decoded["color"], "COLOR_GREEN");
    // Unknown numbers survive as numbers.
    assert_eq!(decoded["palette"], json!(["COLOR_RED", 7]));

    let err = encode(&sample(), json!({"color": "COLOR_BLUE"})).unwrap_err();
    assert!(err.to_string().contains("COLOR_BLUE"));
}

#[test]
fn test_bytes_are_base64() {
    let decoded = round_trip(&sample(), json!({"blob": "aGVsbG8"}));
    assert_eq!(decoded["blob"], "aGVsbG8=");

    let err = encode(&sample(), json!({"blob": "not base64!"})).unwrap_err();
    assert!(matches!(err, CodecError::Type { .. }));

    let lenient = CodecOptions {
        allow_raw_bytes: true,
    };
    let encoded = encode_json(&sample(), &json!({"blob": "hi!"}), &lenient).unwrap();
    assert_eq!(decode_message(&encoded).unwrap()["blob"], "aGkh");
}

#[test]
fn test_floats() {
    let decoded = round_trip(
        &sample(),
        json!({"ratio": 0.1, "precise": "NaN"}),
    );

    assert_eq!(decoded["ratio"], json!(0.1));
    assert_eq!(decoded["precise"], "NaN");

    let decoded = round_trip(&sample(), json!({"precise": "-Infinity"}));
    assert_eq!(decoded["precise"], "-Infinity");
}

#[test]
fn test_maps_are_sorted_by_key() {
    let decoded = round_trip(
        &sample(),
        json!({
            "names_by_id": {"10": "ten", "-2": "minus two", "3": "three"},
            "switches": {"true": "on", "false": "off"}
        }),
    );

    let ids: Vec<_> = decoded["names_by_id"]
        .as_object()
        .unwrap()
        .keys()
        .cloned()
        .collect();
    assert_eq!(ids, ["-2", "3", "10"]);
    assert_eq!(decoded["switches"], json!({"false": "off", "true": "on"}));

    let err = encode(&sample(), json!({"switches": {"maybe": "?"}})).unwrap_err();
    assert!(matches!(err, CodecError::Type { .. }));
}

#[test]
fn test_last_oneof_member_wins() {
    let encoded = encode(&sample(), json!({"text": "first", "number": 3})).unwrap();

    let choice = sample().get_field_by_name("number").unwrap();
    assert_eq!(encoded.get_field(&choice).as_ref(), &Value::I32(3));
    assert_eq!(decode_message(&encoded).unwrap(), json!({"number": 3}));
}

#[test]
fn test_json_names_are_accepted() {
    let decoded = round_trip(&sample(), json!({"createdAt": "2024-01-02T03:04:05Z", "namesById": {}}));
    assert_eq!(decoded, json!({"created_at": "2024-01-02T03:04:05Z"}));
}

#[test]
fn test_well_known_types() {
    let decoded = round_trip(
        &sample(),
        json!({
            "created_at": "2024-01-02T03:04:05.123456789+02:00",
            "ttl": "90s",
            "nickname": "",
            "quota": "12",
            "attributes": {"b": [1, {"c": null}], "a": "x"},
            "anything": false,
            "mask": "tree.left,namesById"
        }),
    );

    assert_eq!(decoded["created_at"], "2024-01-02T01:04:05.123456789Z");
    assert_eq!(decoded["ttl"], "90s");
    assert_eq!(decoded["nickname"], "");
    assert_eq!(decoded["quota"], "12");
    assert_eq!(decoded["attributes"], json!({"a": "x", "b": [1.0, {"c": null}]}));
    assert_eq!(decoded["anything"], false);
    assert_eq!(decoded["mask"], "tree.left,namesById");
}

#[test]
fn test_durations_render_canonically() {
    assert_eq!(round_trip(&sample(), json!({"ttl": "1.5s"}))["ttl"], "1.500s");
    assert_eq!(round_trip(&sample(), json!({"ttl": "-0.000001s"}))["ttl"], "-0.000001s");
    assert_eq!(round_trip(&sample(), json!({"ttl": 2.25}))["ttl"], "2.250s");

    let err = encode(&sample(), json!({"ttl": "soon"})).unwrap_err();
    assert_eq!(err.path().unwrap().to_string(), "ttl");
}

#[test]
fn test_duration_sums_that_overflow_are_range_errors() {
    let huge = "100000000000000000000000000000000000000ns";
    let err = encode(&sample(), json!({"ttl": format!("{huge}{huge}")})).unwrap_err();
    assert!(matches!(err, CodecError::Range { .. }), "{err:?}");
    assert_eq!(err.path().unwrap().to_string(), "ttl");

    let err = encode(&sample(), json!({"ttl": format!("-{huge}{huge}")})).unwrap_err();
    assert!(matches!(err, CodecError::Range { .. }), "{err:?}");

    let err = encode(&sample(), json!({"ttl": -1e300})).unwrap_err();
    assert!(matches!(err, CodecError::Range { .. }), "{err:?}");
}

#[test]
fn test_timestamps_out_of_range() {
    let err = encode(&sample(), json!({"created_at": "0000-12-31T23:59:59Z"})).unwrap_err();
    assert!(matches!(err, CodecError::Range { .. } | CodecError::Type { .. }));

    let err = encode(&sample(), json!({"created_at": "yesterday"})).unwrap_err();
    assert!(matches!(err, CodecError::Type { .. }));
}

#[test]
fn test_recursive_messages() {
    let tree = message("playground.TreeNode");
    let mut nested = json!({"value": 9});
    for depth in 0..32 {
        nested = json!({"value": depth + 1, "left": nested});
    }

    assert_eq!(round_trip(&tree, nested.clone()), nested);
}

#[test]
fn test_split_messages() {
    assert_eq!(
        split_messages(r#"[{"n": 1}, {"n": 2}]"#)
            .unwrap()
            .iter()
            .map(|m| serde_json::from_str::<serde_json::Value>(m).unwrap())
            .collect::<Vec<_>>(),
        [json!({"n": 1}), json!({"n": 2})]
    );
    assert_eq!(split_messages(r#"{"n": 1}"#).unwrap().len(), 1);
    assert_eq!(split_messages("").unwrap(), [codec::render(&json!({}))]);
    assert!(split_messages("[").is_err());
}
