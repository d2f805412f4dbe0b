//! # Dynamic Codec
//!
//! Converts between the JSON-shaped request text users edit and `DynamicMessage`
//! values built from descriptors fetched at runtime.
//!
//! ## Text -> wire
//!
//! * Fields are matched by their proto name or their JSON (camelCase) name.
//! * 64-bit integers accept decimal strings; every integer is range checked for its kind.
//! * Floats accept `"NaN"`, `"Infinity"` and `"-Infinity"`.
//! * Bytes are base64 (standard, URL-safe, padded or not).
//! * Enums accept the symbolic name or the number.
//! * `null` clears a field, except for `google.protobuf.Value` where it means `NullValue`.
//! * Zero values of fields without presence are not emitted.
//! * For oneofs the last member in document order wins.
//!
//! ## Wire -> text
//!
//! Fields are emitted with their proto names in descriptor order. Enums are printed by name
//! (by number when the value is unknown), 64-bit integers as strings, bytes as base64, and
//! well-known types in their canonical form (RFC 3339 timestamps, `"1.500s"` durations, ...).
//!
//! Every error carries a [`FieldPath`] pointing at the offending value.
use prost::Message;
use prost_reflect::{DynamicMessage, MessageDescriptor};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

mod decode;
mod encode;
mod error;
mod wkt;

pub use error::{CodecError, FieldPath, PathSegment};
pub use wkt::is_well_known;

/// Knobs for the text -> wire direction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecOptions {
    /// Accept text that is not valid base64 in `bytes` fields, using its UTF-8 bytes verbatim.
    #[serde(default)]
    pub allow_raw_bytes: bool,
}

/// Parses request text into JSON. Blank text is treated as an empty object.
pub fn parse_text(text: &str) -> Result<Json, CodecError> {
    if text.trim().is_empty() {
        return Ok(Json::Object(serde_json::Map::new()));
    }
    serde_json::from_str(text).map_err(|e| CodecError::parse(&e))
}

/// Splits the request text of a streaming call into one text per message.
///
/// A JSON array yields one message per element; any other document is a single message.
pub fn split_messages(text: &str) -> Result<Vec<String>, CodecError> {
    match parse_text(text)? {
        Json::Array(items) => Ok(items.iter().map(render).collect()),
        other => Ok(vec![render(&other)]),
    }
}

/// Builds a message of type `desc` from a JSON document.
///
/// # Arguments
///
/// * `desc` - The message descriptor the document must conform to.
/// * `json` - The document.
/// * `options` - Encoding options.
pub fn encode_json(
    desc: &MessageDescriptor,
    json: &Json,
    options: &CodecOptions,
) -> Result<DynamicMessage, CodecError> {
    encode::Encoder::new(options).message(desc, json)
}

/// Parses `text` and builds a message of type `desc` from it.
pub fn encode_text(
    desc: &MessageDescriptor,
    text: &str,
    options: &CodecOptions,
) -> Result<DynamicMessage, CodecError> {
    encode_json(desc, &parse_text(text)?, options)
}

/// Parses `text` straight to wire bytes.
pub fn encode_to_vec(
    desc: &MessageDescriptor,
    text: &str,
    options: &CodecOptions,
) -> Result<Vec<u8>, CodecError> {
    Ok(encode_text(desc, text, options)?.encode_to_vec())
}

/// Converts a message into its JSON form.
pub fn decode_message(message: &DynamicMessage) -> Result<Json, CodecError> {
    decode::Decoder::new().message(message)
}

/// Converts a message into pretty-printed JSON text.
pub fn decode_to_text(message: &DynamicMessage) -> Result<String, CodecError> {
    Ok(render(&decode_message(message)?))
}

/// Decodes raw wire bytes of type `desc` into JSON.
pub fn decode_bytes(desc: &MessageDescriptor, bytes: &[u8]) -> Result<Json, CodecError> {
    let message = DynamicMessage::decode(desc.clone(), bytes).map_err(|e| CodecError::Parse {
        line: 0,
        column: 0,
        message: format!("invalid '{}' wire message: {e}", desc.full_name()),
    })?;
    decode_message(&message)
}

/// Renders JSON with two-space indentation.
pub fn render(json: &Json) -> String {
    serde_json::to_string_pretty(json).unwrap_or_else(|_| json.to_string())
}
