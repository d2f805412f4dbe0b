//! Canonical JSON forms of the `google.protobuf` well-known types.
use super::decode::{Decoder, float_json};
use super::encode::{Encoder, describe};
use super::error::{CodecError, PathSegment};
use chrono::{DateTime, SecondsFormat};
use prost_reflect::{DynamicMessage, Kind, MapKey, MessageDescriptor, ReflectMessage, Value};
use serde_json::{Map, Value as Json};
use std::collections::HashMap;

pub(crate) const TIMESTAMP: &str = "google.protobuf.Timestamp";
pub(crate) const DURATION: &str = "google.protobuf.Duration";
pub(crate) const STRUCT: &str = "google.protobuf.Struct";
pub(crate) const VALUE: &str = "google.protobuf.Value";
pub(crate) const LIST_VALUE: &str = "google.protobuf.ListValue";
pub(crate) const NULL_VALUE: &str = "google.protobuf.NullValue";
pub(crate) const FIELD_MASK: &str = "google.protobuf.FieldMask";

const WRAPPERS: &[&str] = &[
    "google.protobuf.DoubleValue",
    "google.protobuf.FloatValue",
    "google.protobuf.Int64Value",
    "google.protobuf.UInt64Value",
    "google.protobuf.Int32Value",
    "google.protobuf.UInt32Value",
    "google.protobuf.BoolValue",
    "google.protobuf.StringValue",
    "google.protobuf.BytesValue",
];

const NANOS_PER_SECOND: i128 = 1_000_000_000;
// 10,000 years, the range allowed by google/protobuf/duration.proto.
const MAX_DURATION_SECONDS: i128 = 315_576_000_000;
// 0001-01-01T00:00:00Z and 9999-12-31T23:59:59Z.
const MIN_TIMESTAMP_SECONDS: i64 = -62_135_596_800;
const MAX_TIMESTAMP_SECONDS: i64 = 253_402_300_799;

const DURATION_UNITS: &[(&str, i128)] = &[
    ("ns", 1),
    ("us", 1_000),
    ("µs", 1_000),
    ("ms", 1_000_000),
    ("s", NANOS_PER_SECOND),
    ("m", 60 * NANOS_PER_SECOND),
    ("h", 3_600 * NANOS_PER_SECOND),
];

/// Returns whether `full_name` has a dedicated JSON form.
pub fn is_well_known(full_name: &str) -> bool {
    matches!(
        full_name,
        TIMESTAMP | DURATION | STRUCT | VALUE | LIST_VALUE | FIELD_MASK
    ) || WRAPPERS.contains(&full_name)
}

pub(crate) fn encode(
    enc: &mut Encoder<'_>,
    desc: &MessageDescriptor,
    json: &Json,
) -> Result<Option<DynamicMessage>, CodecError> {
    let full_name = desc.full_name();
    if !is_well_known(full_name) {
        return Ok(None);
    }

    let mut message = DynamicMessage::new(desc.clone());

    match full_name {
        TIMESTAMP => {
            let Json::String(text) = json else {
                return Err(enc.type_error(format!(
                    "expected an RFC 3339 timestamp string, found {}",
                    describe(json)
                )));
            };
            let parsed = DateTime::parse_from_rfc3339(text)
                .map_err(|e| enc.type_error(format!("invalid RFC 3339 timestamp '{text}': {e}")))?;
            let seconds = parsed.timestamp();
            if !(MIN_TIMESTAMP_SECONDS..=MAX_TIMESTAMP_SECONDS).contains(&seconds) {
                return Err(enc.range_error(format!("timestamp '{text}' is outside 0001-9999")));
            }
            set_i64(&mut message, "seconds", seconds);
            set_i32(&mut message, "nanos", parsed.timestamp_subsec_nanos() as i32);
        }
        DURATION => {
            let total = match json {
                Json::String(text) => parse_duration(text).map_err(|e| match e {
                    DurationError::Malformed(message) => enc.type_error(message),
                    DurationError::OutOfRange(message) => enc.range_error(message),
                })?,
                Json::Number(_) => (enc.double(json)? * NANOS_PER_SECOND as f64).round() as i128,
                other => {
                    return Err(enc.type_error(format!(
                        "expected a duration string such as \"1.5s\", found {}",
                        describe(other)
                    )));
                }
            };
            if total.unsigned_abs() / NANOS_PER_SECOND as u128 > MAX_DURATION_SECONDS as u128 {
                return Err(enc.range_error("duration exceeds 10000 years"));
            }
            set_i64(&mut message, "seconds", (total / NANOS_PER_SECOND) as i64);
            set_i32(&mut message, "nanos", (total % NANOS_PER_SECOND) as i32);
        }
        FIELD_MASK => {
            let Json::String(text) = json else {
                return Err(enc.type_error(format!(
                    "expected a comma separated field mask, found {}",
                    describe(json)
                )));
            };
            let paths = text
                .split(',')
                .map(str::trim)
                .filter(|path| !path.is_empty())
                .map(|path| Value::String(camel_to_snake(path)))
                .collect();
            message.set_field_by_name("paths", Value::List(paths));
        }
        STRUCT => {
            let fields = encode_struct(enc, desc, json)?;
            message.set_field_by_name("fields", fields);
        }
        VALUE => encode_value(enc, &mut message, json)?,
        LIST_VALUE => {
            let values = encode_list(enc, desc, json)?;
            message.set_field_by_name("values", values);
        }
        _ => {
            let Some(field) = desc.get_field_by_name("value") else {
                return Ok(None);
            };
            let value = enc.single(&field.kind(), json)?;
            if value != Value::default_value_for_field(&field) {
                message.set_field(&field, value);
            }
        }
    }

    Ok(Some(message))
}

pub(crate) fn decode(dec: &mut Decoder, message: &DynamicMessage) -> Result<Option<Json>, CodecError> {
    let desc = message.descriptor();
    let full_name = desc.full_name();
    if !is_well_known(full_name) {
        return Ok(None);
    }

    let json = match full_name {
        TIMESTAMP => {
            let seconds = get_i64(message, "seconds");
            let nanos = get_i32(message, "nanos");
            let timestamp = u32::try_from(nanos)
                .ok()
                .and_then(|nanos| DateTime::from_timestamp(seconds, nanos))
                .filter(|_| (MIN_TIMESTAMP_SECONDS..=MAX_TIMESTAMP_SECONDS).contains(&seconds))
                .ok_or_else(|| dec.range_error(format!("invalid timestamp {seconds}s {nanos}ns")))?;
            Json::String(timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true))
        }
        DURATION => {
            let total = i128::from(get_i64(message, "seconds")) * NANOS_PER_SECOND
                + i128::from(get_i32(message, "nanos"));
            Json::String(format_duration(total))
        }
        FIELD_MASK => {
            let paths = match message.get_field_by_name("paths").as_deref() {
                Some(Value::List(paths)) => paths
                    .iter()
                    .filter_map(|path| path.as_str().map(snake_to_camel))
                    .collect::<Vec<_>>(),
                _ => Vec::new(),
            };
            Json::String(paths.join(","))
        }
        STRUCT => decode_struct(dec, message)?,
        VALUE => decode_value(dec, message)?,
        LIST_VALUE => decode_list(dec, message)?,
        _ => match desc.get_field_by_name("value") {
            Some(field) => {
                let value = message.get_field(&field);
                dec.single(&field.kind(), &value)?
            }
            None => return Ok(None),
        },
    };

    Ok(Some(json))
}

fn encode_struct(
    enc: &mut Encoder<'_>,
    desc: &MessageDescriptor,
    json: &Json,
) -> Result<Value, CodecError> {
    let Json::Object(object) = json else {
        return Err(enc.type_error(format!("expected an object, found {}", describe(json))));
    };
    let value_desc = child_message(enc, desc, "fields")?
        .map_entry_value_field()
        .kind()
        .as_message()
        .cloned()
        .ok_or_else(|| enc.type_error("malformed google.protobuf.Struct descriptor"))?;

    let mut fields = HashMap::with_capacity(object.len());
    for (key, item) in object {
        let value = enc.nested(PathSegment::Key(key.clone()), |enc| {
            enc.message(&value_desc, item)
        })?;
        fields.insert(MapKey::String(key.clone()), Value::Message(value));
    }

    Ok(Value::Map(fields))
}

fn encode_list(
    enc: &mut Encoder<'_>,
    desc: &MessageDescriptor,
    json: &Json,
) -> Result<Value, CodecError> {
    let Json::Array(items) = json else {
        return Err(enc.type_error(format!("expected an array, found {}", describe(json))));
    };
    let value_desc = child_message(enc, desc, "values")?;

    let mut values = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let value = enc.nested(PathSegment::Index(index), |enc| enc.message(&value_desc, item))?;
        values.push(Value::Message(value));
    }

    Ok(Value::List(values))
}

fn encode_value(
    enc: &mut Encoder<'_>,
    message: &mut DynamicMessage,
    json: &Json,
) -> Result<(), CodecError> {
    let desc = message.descriptor();
    match json {
        Json::Null => message.set_field_by_name("null_value", Value::EnumNumber(0)),
        Json::Bool(b) => message.set_field_by_name("bool_value", Value::Bool(*b)),
        Json::Number(_) => message.set_field_by_name("number_value", Value::F64(enc.double(json)?)),
        Json::String(s) => message.set_field_by_name("string_value", Value::String(s.clone())),
        Json::Array(_) => {
            let list_desc = child_message(enc, &desc, "list_value")?;
            let mut list = DynamicMessage::new(list_desc.clone());
            list.set_field_by_name("values", encode_list(enc, &list_desc, json)?);
            message.set_field_by_name("list_value", Value::Message(list));
        }
        Json::Object(_) => {
            let struct_desc = child_message(enc, &desc, "struct_value")?;
            let mut object = DynamicMessage::new(struct_desc.clone());
            object.set_field_by_name("fields", encode_struct(enc, &struct_desc, json)?);
            message.set_field_by_name("struct_value", Value::Message(object));
        }
    }
    Ok(())
}

fn decode_struct(dec: &mut Decoder, message: &DynamicMessage) -> Result<Json, CodecError> {
    let mut object = Map::new();
    if let Some(Value::Map(fields)) = message.get_field_by_name("fields").as_deref() {
        let mut entries: Vec<_> = fields.iter().collect();
        entries.sort_by(|a, b| a.0.as_str().cmp(&b.0.as_str()));

        for (key, value) in entries {
            let (MapKey::String(key), Value::Message(value)) = (key, value) else {
                continue;
            };
            object.insert(key.clone(), dec.message(value)?);
        }
    }
    Ok(Json::Object(object))
}

fn decode_list(dec: &mut Decoder, message: &DynamicMessage) -> Result<Json, CodecError> {
    let mut array = Vec::new();
    if let Some(Value::List(values)) = message.get_field_by_name("values").as_deref() {
        for value in values {
            if let Value::Message(value) = value {
                array.push(dec.message(value)?);
            }
        }
    }
    Ok(Json::Array(array))
}

fn decode_value(dec: &mut Decoder, message: &DynamicMessage) -> Result<Json, CodecError> {
    let desc = message.descriptor();
    let Some(field) = desc.fields().find(|field| message.has_field(field)) else {
        return Ok(Json::Null);
    };

    let json = match (field.name(), message.get_field(&field).as_ref()) {
        ("bool_value", Value::Bool(b)) => Json::Bool(*b),
        ("number_value", Value::F64(f)) => float_json(*f),
        ("string_value", Value::String(s)) => Json::String(s.clone()),
        ("list_value" | "struct_value", Value::Message(inner)) => dec.message(inner)?,
        _ => Json::Null,
    };

    Ok(json)
}

fn child_message(
    enc: &Encoder<'_>,
    desc: &MessageDescriptor,
    field: &str,
) -> Result<MessageDescriptor, CodecError> {
    desc.get_field_by_name(field)
        .and_then(|field| match field.kind() {
            Kind::Message(message) => Some(message),
            _ => None,
        })
        .ok_or_else(|| {
            enc.type_error(format!(
                "malformed '{}' descriptor: missing message field '{field}'",
                desc.full_name()
            ))
        })
}

fn set_i64(message: &mut DynamicMessage, name: &str, value: i64) {
    if value != 0 {
        message.set_field_by_name(name, Value::I64(value));
    }
}

fn set_i32(message: &mut DynamicMessage, name: &str, value: i32) {
    if value != 0 {
        message.set_field_by_name(name, Value::I32(value));
    }
}

fn get_i64(message: &DynamicMessage, name: &str) -> i64 {
    message
        .get_field_by_name(name)
        .and_then(|value| value.as_i64())
        .unwrap_or_default()
}

fn get_i32(message: &DynamicMessage, name: &str) -> i32 {
    message
        .get_field_by_name(name)
        .and_then(|value| value.as_i32())
        .unwrap_or_default()
}

#[derive(Debug, PartialEq)]
pub(crate) enum DurationError {
    Malformed(String),
    OutOfRange(String),
}

/// Parses `<number><unit>` sequences such as `1.5s`, `250ms` or `1h30m` into nanoseconds.
pub(crate) fn parse_duration(text: &str) -> Result<i128, DurationError> {
    let malformed = |reason: &str| DurationError::Malformed(format!("duration '{text}' {reason}"));
    let out_of_range = || DurationError::OutOfRange(format!("duration '{text}' is out of range"));

    let trimmed = text.trim();
    let (negative, mut rest) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };

    if rest.is_empty() {
        return Err(malformed("is empty"));
    }

    let mut total: i128 = 0;
    while !rest.is_empty() {
        let end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| malformed("is missing a unit (ns, us, ms, s, m, h)"))?;
        let (number, tail) = rest.split_at(end);

        let (unit, scale) = DURATION_UNITS
            .iter()
            .find(|(unit, _)| tail.starts_with(unit))
            .ok_or_else(|| malformed("has an unknown unit"))?;

        let part = match decimal_nanos(number, *scale) {
            Some(Ok(part)) => part,
            Some(Err(())) => return Err(out_of_range()),
            None => return Err(malformed("is not a number")),
        };
        total = total.checked_add(part).ok_or_else(out_of_range)?;
        rest = &tail[unit.len()..];
    }

    Ok(if negative { -total } else { total })
}

/// `None` when `number` is not a decimal, `Some(Err(()))` when it does not fit in nanoseconds.
fn decimal_nanos(number: &str, scale: i128) -> Option<Result<i128, ()>> {
    let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }
    if !whole.bytes().chain(fraction.bytes()).all(|b| b.is_ascii_digit()) {
        return None;
    }

    let fraction = &fraction[..fraction.len().min(18)];
    let fraction_nanos = if fraction.is_empty() {
        0
    } else {
        let digits: i128 = fraction.parse().ok()?;
        digits * scale / 10_i128.pow(fraction.len() as u32)
    };

    let whole = match whole {
        "" => Some(0),
        digits => digits.parse::<i128>().ok(),
    };
    Some(
        whole
            .and_then(|whole| whole.checked_mul(scale))
            .and_then(|nanos| nanos.checked_add(fraction_nanos))
            .ok_or(()),
    )
}

/// Formats nanoseconds as `<seconds>[.fraction]s` with 0, 3, 6 or 9 fractional digits.
pub(crate) fn format_duration(total_nanos: i128) -> String {
    let sign = if total_nanos < 0 { "-" } else { "" };
    let abs = total_nanos.abs();
    let seconds = abs / NANOS_PER_SECOND;
    let nanos = abs % NANOS_PER_SECOND;

    if nanos == 0 {
        format!("{sign}{seconds}s")
    } else if nanos % 1_000_000 == 0 {
        format!("{sign}{seconds}.{:03}s", nanos / 1_000_000)
    } else if nanos % 1_000 == 0 {
        format!("{sign}{seconds}.{:06}s", nanos / 1_000)
    } else {
        format!("{sign}{seconds}.{nanos:09}s")
    }
}

fn camel_to_snake(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 4);
    for c in path.chars() {
        if c.is_ascii_uppercase() {
            out.push('_');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

fn snake_to_camel(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut upper = false;
    for c in path.chars() {
        if c == '_' {
            upper = true;
        } else if upper {
            out.push(c.to_ascii_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}
