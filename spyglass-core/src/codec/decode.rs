//! `DynamicMessage` -> JSON.
use super::error::{CodecError, FieldPath, PathSegment};
use super::wkt;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use prost_reflect::{DynamicMessage, FieldDescriptor, Kind, MapKey, ReflectMessage, Value};
use serde_json::{Map, Number, Value as Json};
use std::cmp::Ordering;

pub(crate) struct Decoder {
    path: FieldPath,
}

impl Decoder {
    pub(crate) fn new() -> Self {
        Self {
            path: FieldPath::root(),
        }
    }

    pub(crate) fn range_error(&self, message: impl Into<String>) -> CodecError {
        CodecError::Range {
            path: self.path.clone(),
            message: message.into(),
        }
    }

    pub(crate) fn message(&mut self, message: &DynamicMessage) -> Result<Json, CodecError> {
        if let Some(json) = wkt::decode(self, message)? {
            return Ok(json);
        }

        let mut object = Map::new();

        for field in message.descriptor().fields() {
            if !message.has_field(&field) {
                continue;
            }

            let value = message.get_field(&field);
            self.path.push(PathSegment::Field(field.name().to_string()));
            let json = self.field(&field, &value);
            self.path.pop();

            object.insert(field.name().to_string(), json?);
        }

        Ok(Json::Object(object))
    }

    fn field(&mut self, field: &FieldDescriptor, value: &Value) -> Result<Json, CodecError> {
        match value {
            Value::Map(map) => {
                let value_kind = field
                    .kind()
                    .as_message()
                    .map(|entry| entry.map_entry_value_field().kind())
                    .unwrap_or(Kind::String);

                let mut entries: Vec<_> = map.iter().collect();
                entries.sort_by(|a, b| compare_keys(a.0, b.0));

                let mut object = Map::new();
                for (key, value) in entries {
                    let key = key_to_string(key);
                    self.path.push(PathSegment::Key(key.clone()));
                    let json = self.single(&value_kind, value);
                    self.path.pop();
                    object.insert(key, json?);
                }
                Ok(Json::Object(object))
            }
            Value::List(items) => {
                let kind = field.kind();
                let mut array = Vec::with_capacity(items.len());
                for (index, item) in items.iter().enumerate() {
                    self.path.push(PathSegment::Index(index));
                    let json = self.single(&kind, item);
                    self.path.pop();
                    array.push(json?);
                }
                Ok(Json::Array(array))
            }
            single => self.single(&field.kind(), single),
        }
    }

    pub(crate) fn single(&mut self, kind: &Kind, value: &Value) -> Result<Json, CodecError> {
        let json = match value {
            Value::Bool(b) => Json::Bool(*b),
            Value::I32(n) => Json::from(*n),
            Value::U32(n) => Json::from(*n),
            Value::I64(n) => Json::String(n.to_string()),
            Value::U64(n) => Json::String(n.to_string()),
            // Round-trip through the shortest f32 representation so 0.1f32 prints as 0.1.
            Value::F32(f) => float_json(f.to_string().parse::<f64>().unwrap_or(f64::from(*f))),
            Value::F64(f) => float_json(*f),
            Value::String(s) => Json::String(s.clone()),
            Value::Bytes(b) => Json::String(STANDARD.encode(b)),
            Value::EnumNumber(number) => match kind {
                Kind::Enum(desc) if desc.full_name() == wkt::NULL_VALUE => Json::Null,
                Kind::Enum(desc) => desc
                    .get_value(*number)
                    .map(|value| Json::String(value.name().to_string()))
                    .unwrap_or_else(|| Json::from(*number)),
                _ => Json::from(*number),
            },
            Value::Message(message) => self.message(message)?,
            Value::List(_) | Value::Map(_) => {
                return Err(CodecError::Type {
                    path: self.path.clone(),
                    message: "nested collections are not valid Protobuf values".to_string(),
                });
            }
        };

        Ok(json)
    }
}

pub(crate) fn float_json(value: f64) -> Json {
    if value.is_nan() {
        Json::String("NaN".to_string())
    } else if value == f64::INFINITY {
        Json::String("Infinity".to_string())
    } else if value == f64::NEG_INFINITY {
        Json::String("-Infinity".to_string())
    } else {
        Number::from_f64(value).map(Json::Number).unwrap_or(Json::Null)
    }
}

fn key_to_string(key: &MapKey) -> String {
    match key {
        MapKey::Bool(b) => b.to_string(),
        MapKey::I32(n) => n.to_string(),
        MapKey::I64(n) => n.to_string(),
        MapKey::U32(n) => n.to_string(),
        MapKey::U64(n) => n.to_string(),
        MapKey::String(s) => s.clone(),
    }
}

fn compare_keys(a: &MapKey, b: &MapKey) -> Ordering {
    match (a, b) {
        (MapKey::Bool(a), MapKey::Bool(b)) => a.cmp(b),
        (MapKey::I32(a), MapKey::I32(b)) => a.cmp(b),
        (MapKey::I64(a), MapKey::I64(b)) => a.cmp(b),
        (MapKey::U32(a), MapKey::U32(b)) => a.cmp(b),
        (MapKey::U64(a), MapKey::U64(b)) => a.cmp(b),
        (MapKey::String(a), MapKey::String(b)) => a.cmp(b),
        (a, b) => key_to_string(a).cmp(&key_to_string(b)),
    }
}
