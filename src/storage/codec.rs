//! Record codec - opaque blob encoding for attributes and keys
//!
//! Each map serializes to a single self-describing JSON blob. An empty map
//! encodes to SQL NULL so that "no attributes" survives a round trip distinct
//! from "empty object". Decoding is defensive: a malformed blob may originate
//! from an older physical format mid-migration, so it decodes to the empty map
//! instead of failing the whole read.

use crate::identity::RecordIdentity;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;

/// Encode an attribute map to its blob form (`None` when empty)
pub fn encode_attributes(attributes: &BTreeMap<String, Value>) -> Option<String> {
    encode_map(attributes)
}

/// Encode an external-key map to its blob form (`None` when empty)
pub fn encode_keys(keys: &BTreeMap<String, String>) -> Option<String> {
    encode_map(keys)
}

/// Decode an attribute blob, substituting the empty map for NULL or garbage
pub fn decode_attributes(blob: Option<&str>, identity: &RecordIdentity) -> BTreeMap<String, Value> {
    decode_map(blob, identity, "attributes")
}

/// Decode an external-key blob, substituting the empty map for NULL or garbage
pub fn decode_keys(blob: Option<&str>, identity: &RecordIdentity) -> BTreeMap<String, String> {
    decode_map(blob, identity, "keys")
}

fn encode_map<V: Serialize>(map: &BTreeMap<String, V>) -> Option<String> {
    if map.is_empty() {
        return None;
    }
    // BTreeMap of JSON scalars cannot fail to serialize
    serde_json::to_string(map).ok()
}

fn decode_map<V: DeserializeOwned>(
    blob: Option<&str>,
    identity: &RecordIdentity,
    column: &str,
) -> BTreeMap<String, V> {
    let Some(blob) = blob else {
        return BTreeMap::new();
    };
    match serde_json::from_str(blob) {
        Ok(map) => map,
        Err(e) => {
            tracing::warn!("Discarding malformed {} blob for {}: {}", column, identity, e);
            BTreeMap::new()
        }
    }
}
