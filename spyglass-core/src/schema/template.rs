use crate::codec::is_well_known;
use prost_reflect::{FieldDescriptor, Kind, MessageDescriptor};
use serde_json::{Map, Value as Json};
use std::collections::HashSet;

/// Builds a JSON skeleton of `desc` for pre-filling a request editor.
///
/// Every field is present with its zero value. Nested messages are expanded, except when a
/// type is already being expanded further up, where recursion stops with `{}`. Only the
/// first member of each real oneof is included.
pub fn message_template(desc: &MessageDescriptor) -> Json {
    let mut expanding = HashSet::new();
    message(desc, &mut expanding)
}

fn message(desc: &MessageDescriptor, expanding: &mut HashSet<String>) -> Json {
    if is_well_known(desc.full_name()) {
        return well_known(desc.full_name());
    }

    if !expanding.insert(desc.full_name().to_string()) {
        return Json::Object(Map::new());
    }

    let mut object = Map::new();
    for field in desc.fields() {
        if let Some(oneof) = field.containing_oneof()
            && !oneof.is_synthetic()
            && oneof.fields().next().is_some_and(|first| first.number() != field.number())
        {
            continue;
        }

        object.insert(field.name().to_string(), field_value(&field, expanding));
    }

    expanding.remove(desc.full_name());
    Json::Object(object)
}

fn field_value(field: &FieldDescriptor, expanding: &mut HashSet<String>) -> Json {
    if field.is_map() {
        return Json::Object(Map::new());
    }
    if field.is_list() {
        return Json::Array(Vec::new());
    }
    scalar(&field.kind(), expanding)
}

fn scalar(kind: &Kind, expanding: &mut HashSet<String>) -> Json {
    match kind {
        Kind::Double | Kind::Float => Json::from(0.0),
        Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 | Kind::Uint32 | Kind::Fixed32 => {
            Json::from(0)
        }
        Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 | Kind::Uint64 | Kind::Fixed64 => {
            Json::String("0".to_string())
        }
        Kind::Bool => Json::Bool(false),
        Kind::String | Kind::Bytes => Json::String(String::new()),
        Kind::Enum(e) => Json::String(e.default_value().name().to_string()),
        Kind::Message(m) => message(m, expanding),
    }
}

fn well_known(full_name: &str) -> Json {
    match full_name {
        "google.protobuf.Timestamp" => Json::String("1970-01-01T00:00:00Z".to_string()),
        "google.protobuf.Duration" => Json::String("0s".to_string()),
        "google.protobuf.Struct" => Json::Object(Map::new()),
        "google.protobuf.ListValue" => Json::Array(Vec::new()),
        "google.protobuf.FieldMask" => Json::String(String::new()),
        "google.protobuf.Value" => Json::Null,
        "google.protobuf.BoolValue" => Json::Bool(false),
        "google.protobuf.StringValue" | "google.protobuf.BytesValue" => Json::String(String::new()),
        "google.protobuf.Int64Value" | "google.protobuf.UInt64Value" => Json::String("0".to_string()),
        "google.protobuf.DoubleValue" | "google.protobuf.FloatValue" => Json::from(0.0),
        _ => Json::from(0),
    }
}
