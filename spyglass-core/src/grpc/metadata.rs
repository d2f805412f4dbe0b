//! Conversion between ordered `(key, value)` pairs and tonic's `MetadataMap`.
//!
//! Keys ending in `-bin` are binary: their values are base64 text on our side and raw bytes
//! on the wire.
use super::client::GrpcRequestError;
use crate::Metadata;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use std::str::FromStr;
use tonic::metadata::{
    AsciiMetadataKey, AsciiMetadataValue, BinaryMetadataKey, BinaryMetadataValue, KeyAndValueRef,
    MetadataMap,
};

/// Appends every pair to `map`, preserving order and duplicates.
pub(crate) fn append(map: &mut MetadataMap, headers: &[(String, String)]) -> Result<(), GrpcRequestError> {
    for (k, v) in headers {
        let key_text = k.trim().to_ascii_lowercase();

        if key_text.ends_with("-bin") {
            let key = BinaryMetadataKey::from_str(&key_text).map_err(|source| {
                GrpcRequestError::InvalidMetadataKey {
                    key: k.clone(),
                    source,
                }
            })?;
            let bytes = STANDARD
                .decode(v.trim())
                .or_else(|_| STANDARD_NO_PAD.decode(v.trim()))
                .map_err(|source| GrpcRequestError::InvalidBinaryMetadata {
                    key: k.clone(),
                    source,
                })?;
            map.append_bin(key, BinaryMetadataValue::from_bytes(&bytes));
        } else {
            let key = AsciiMetadataKey::from_str(&key_text).map_err(|source| {
                GrpcRequestError::InvalidMetadataKey {
                    key: k.clone(),
                    source,
                }
            })?;
            let val = AsciiMetadataValue::from_str(v).map_err(|source| {
                GrpcRequestError::InvalidMetadataValue {
                    key: k.clone(),
                    source,
                }
            })?;
            map.append(key, val);
        }
    }
    Ok(())
}

/// Flattens `map` into ordered pairs. Binary values are base64 encoded, and values that are
/// not valid text are skipped.
pub fn to_pairs(map: &MetadataMap) -> Metadata {
    map.iter()
        .filter_map(|entry| match entry {
            KeyAndValueRef::Ascii(key, value) => value
                .to_str()
                .ok()
                .map(|value| (key.as_str().to_string(), value.to_string())),
            KeyAndValueRef::Binary(key, value) => value
                .to_bytes()
                .ok()
                .map(|bytes| (key.as_str().to_string(), STANDARD.encode(bytes))),
        })
        .collect()
}
