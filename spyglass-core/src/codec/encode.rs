//! JSON -> `DynamicMessage`.
use super::CodecOptions;
use super::error::{CodecError, FieldPath, PathSegment};
use super::wkt;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use prost::bytes::Bytes;
use prost_reflect::{
    DynamicMessage, EnumDescriptor, FieldDescriptor, Kind, MapKey, MessageDescriptor, Value,
};
use serde_json::Value as Json;
use std::collections::HashMap;

/// Walks a JSON document alongside a message descriptor, keeping track of the
/// field path for diagnostics.
pub(crate) struct Encoder<'a> {
    options: &'a CodecOptions,
    path: FieldPath,
}

impl<'a> Encoder<'a> {
    pub(crate) fn new(options: &'a CodecOptions) -> Self {
        Self {
            options,
            path: FieldPath::root(),
        }
    }

    pub(crate) fn type_error(&self, message: impl Into<String>) -> CodecError {
        CodecError::Type {
            path: self.path.clone(),
            message: message.into(),
        }
    }

    pub(crate) fn range_error(&self, message: impl Into<String>) -> CodecError {
        CodecError::Range {
            path: self.path.clone(),
            message: message.into(),
        }
    }

    /// Runs `f` with `segment` appended to the current path.
    pub(crate) fn nested<T>(
        &mut self,
        segment: PathSegment,
        f: impl FnOnce(&mut Self) -> Result<T, CodecError>,
    ) -> Result<T, CodecError> {
        self.path.push(segment);
        let result = f(self);
        self.path.pop();
        result
    }

    pub(crate) fn message(
        &mut self,
        desc: &MessageDescriptor,
        json: &Json,
    ) -> Result<DynamicMessage, CodecError> {
        if let Some(message) = wkt::encode(self, desc, json)? {
            return Ok(message);
        }

        let Json::Object(object) = json else {
            return Err(self.type_error(format!(
                "expected an object for message '{}', found {}",
                desc.full_name(),
                describe(json)
            )));
        };

        let mut message = DynamicMessage::new(desc.clone());

        for (key, value) in object {
            let field = desc
                .get_field_by_name(key)
                .or_else(|| desc.get_field_by_json_name(key))
                .ok_or_else(|| {
                    self.type_error(format!(
                        "unknown field '{key}' in message '{}'",
                        desc.full_name()
                    ))
                })?;

            self.nested(PathSegment::Field(field.name().to_string()), |enc| {
                enc.set_field(&mut message, &field, value)
            })?;
        }

        Ok(message)
    }

    fn set_field(
        &mut self,
        message: &mut DynamicMessage,
        field: &FieldDescriptor,
        json: &Json,
    ) -> Result<(), CodecError> {
        if json.is_null() && !accepts_null(field) {
            message.clear_field(field);
            return Ok(());
        }

        let value = self.field_value(field, json)?;

        let omit_default = !field.supports_presence()
            && !field.is_list()
            && !field.is_map()
            && value == Value::default_value_for_field(field);

        if omit_default {
            message.clear_field(field);
            return Ok(());
        }

        // Oneof members clear their siblings, so the last one in document order wins.
        message
            .try_set_field(field, value)
            .map_err(|e| self.type_error(e.to_string()))
    }

    fn field_value(&mut self, field: &FieldDescriptor, json: &Json) -> Result<Value, CodecError> {
        let kind = field.kind();

        if field.is_map() {
            let entry = kind
                .as_message()
                .ok_or_else(|| self.type_error("map field without an entry type"))?;
            let key_kind = entry.map_entry_key_field().kind();
            let value_field = entry.map_entry_value_field();

            let Json::Object(object) = json else {
                return Err(self.type_error(format!("expected an object, found {}", describe(json))));
            };

            let mut map = HashMap::with_capacity(object.len());
            for (key, value) in object {
                let entry = self.nested(PathSegment::Key(key.clone()), |enc| {
                    let map_key = enc.map_key(&key_kind, key)?;
                    let map_value = enc.single(&value_field.kind(), value)?;
                    Ok((map_key, map_value))
                })?;
                map.insert(entry.0, entry.1);
            }

            return Ok(Value::Map(map));
        }

        if field.is_list() {
            let Json::Array(items) = json else {
                return Err(self.type_error(format!("expected an array, found {}", describe(json))));
            };

            let mut list = Vec::with_capacity(items.len());
            for (index, item) in items.iter().enumerate() {
                list.push(self.nested(PathSegment::Index(index), |enc| enc.single(&kind, item))?);
            }

            return Ok(Value::List(list));
        }

        self.single(&kind, json)
    }

    pub(crate) fn single(&mut self, kind: &Kind, json: &Json) -> Result<Value, CodecError> {
        let value = match kind {
            Kind::Double => Value::F64(self.double(json)?),
            Kind::Float => Value::F32(self.float(json)?),
            Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => {
                Value::I32(self.integer(json, "int32")?)
            }
            Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => {
                Value::I64(self.integer(json, "int64")?)
            }
            Kind::Uint32 | Kind::Fixed32 => Value::U32(self.integer(json, "uint32")?),
            Kind::Uint64 | Kind::Fixed64 => Value::U64(self.integer(json, "uint64")?),
            Kind::Bool => match json {
                Json::Bool(b) => Value::Bool(*b),
                other => {
                    return Err(self.type_error(format!("expected a boolean, found {}", describe(other))));
                }
            },
            Kind::String => match json {
                Json::String(s) => Value::String(s.clone()),
                other => {
                    return Err(self.type_error(format!("expected a string, found {}", describe(other))));
                }
            },
            Kind::Bytes => Value::Bytes(self.bytes(json)?),
            Kind::Enum(desc) => Value::EnumNumber(self.enumeration(desc, json)?),
            Kind::Message(desc) => Value::Message(self.message(desc, json)?),
        };

        Ok(value)
    }

    pub(crate) fn integer<T>(&self, json: &Json, type_name: &str) -> Result<T, CodecError>
    where
        T: TryFrom<i128>,
    {
        let wide: i128 = match json {
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    i128::from(i)
                } else if let Some(u) = n.as_u64() {
                    i128::from(u)
                } else {
                    let f = n.as_f64().unwrap_or(f64::NAN);
                    if !f.is_finite() || f.fract() != 0.0 {
                        return Err(self.type_error(format!("expected an integer, found {n}")));
                    }
                    if f.abs() >= 1e38 {
                        return Err(self.range_error(format!("{n} does not fit in {type_name}")));
                    }
                    f as i128
                }
            }
            Json::String(s) => s.trim().parse::<i128>().map_err(|_| {
                self.type_error(format!("expected an integer, found the string \"{s}\""))
            })?,
            other => {
                return Err(self.type_error(format!("expected an integer, found {}", describe(other))));
            }
        };

        T::try_from(wide).map_err(|_| self.range_error(format!("{wide} does not fit in {type_name}")))
    }

    pub(crate) fn double(&self, json: &Json) -> Result<f64, CodecError> {
        match json {
            Json::Number(n) => n
                .as_f64()
                .ok_or_else(|| self.type_error(format!("expected a number, found {n}"))),
            Json::String(s) => match s.as_str() {
                "NaN" => Ok(f64::NAN),
                "Infinity" => Ok(f64::INFINITY),
                "-Infinity" => Ok(f64::NEG_INFINITY),
                other => other.trim().parse::<f64>().map_err(|_| {
                    self.type_error(format!("expected a number, found the string \"{other}\""))
                }),
            },
            other => Err(self.type_error(format!("expected a number, found {}", describe(other)))),
        }
    }

    fn float(&self, json: &Json) -> Result<f32, CodecError> {
        let value = self.double(json)?;
        if value.is_finite() && value.abs() > f64::from(f32::MAX) {
            return Err(self.range_error(format!("{value} does not fit in float")));
        }
        Ok(value as f32)
    }

    fn bytes(&self, json: &Json) -> Result<Bytes, CodecError> {
        let Json::String(text) = json else {
            return Err(self.type_error(format!(
                "expected a base64 string, found {}",
                describe(json)
            )));
        };

        let decoded = [STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD]
            .iter()
            .find_map(|engine| engine.decode(text).ok());

        match decoded {
            Some(bytes) => Ok(Bytes::from(bytes)),
            None if self.options.allow_raw_bytes => Ok(Bytes::from(text.clone().into_bytes())),
            None => Err(self.type_error("expected base64 encoded bytes")),
        }
    }

    fn enumeration(&self, desc: &EnumDescriptor, json: &Json) -> Result<i32, CodecError> {
        match json {
            Json::String(name) => desc
                .get_value_by_name(name)
                .map(|value| value.number())
                .ok_or_else(|| {
                    self.type_error(format!(
                        "unknown value '{name}' for enum '{}'",
                        desc.full_name()
                    ))
                }),
            Json::Number(_) => self.integer(json, "enum"),
            Json::Null if desc.full_name() == wkt::NULL_VALUE => Ok(0),
            other => Err(self.type_error(format!(
                "expected an enum name or number, found {}",
                describe(other)
            ))),
        }
    }

    fn map_key(&self, kind: &Kind, key: &str) -> Result<MapKey, CodecError> {
        let text = Json::String(key.to_string());
        let key = match kind {
            Kind::String => MapKey::String(key.to_string()),
            Kind::Bool => match key {
                "true" => MapKey::Bool(true),
                "false" => MapKey::Bool(false),
                other => {
                    return Err(self.type_error(format!("expected \"true\" or \"false\", found \"{other}\"")));
                }
            },
            Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => MapKey::I32(self.integer(&text, "int32")?),
            Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => MapKey::I64(self.integer(&text, "int64")?),
            Kind::Uint32 | Kind::Fixed32 => MapKey::U32(self.integer(&text, "uint32")?),
            Kind::Uint64 | Kind::Fixed64 => MapKey::U64(self.integer(&text, "uint64")?),
            other => return Err(self.type_error(format!("{other:?} cannot be used as a map key"))),
        };
        Ok(key)
    }
}

fn accepts_null(field: &FieldDescriptor) -> bool {
    if field.is_list() || field.is_map() {
        return false;
    }
    match field.kind() {
        Kind::Message(desc) => desc.full_name() == wkt::VALUE,
        Kind::Enum(desc) => desc.full_name() == wkt::NULL_VALUE,
        _ => false,
    }
}

pub(crate) fn describe(json: &Json) -> &'static str {
    match json {
        Json::Null => "null",
        Json::Bool(_) => "a boolean",
        Json::Number(_) => "a number",
        Json::String(_) => "a string",
        Json::Array(_) => "an array",
        Json::Object(_) => "an object",
    }
}
