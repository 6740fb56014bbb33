//! Content digests used for change detection.
//!
//! The canonical form sorts object keys recursively and orders array elements
//! by their own canonical encoding, so two payloads that differ only in field
//! order or in the order of nested collections produce the same digest.

use serde_json::{Map, Value as JsonValue};
use sha2::{Digest, Sha256};

/// Stateless digest calculator for normalized payloads.
pub struct ChangeDetector;

impl ChangeDetector {
    /// SHA-256 of the canonical payload encoding, hex-encoded (64 chars).
    pub fn hash(payload: &Map<String, JsonValue>) -> String {
        let mut canonical = String::new();
        write_object(payload, &mut canonical);
        Self::sha256_hex(canonical.as_bytes())
    }

    pub fn canonical_json(value: &JsonValue) -> String {
        let mut out = String::new();
        write_canonical(value, &mut out);
        out
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }
}

fn write_canonical(value: &JsonValue, out: &mut String) {
    match value {
        JsonValue::Object(map) => write_object(map, out),
        JsonValue::Array(items) => {
            let mut encoded: Vec<String> = items
                .iter()
                .map(ChangeDetector::canonical_json)
                .collect();
            encoded.sort_unstable();
            out.push('[');
            out.push_str(&encoded.join(","));
            out.push(']');
        }
        // Scalars already have a single JSON spelling.
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn write_object(map: &Map<String, JsonValue>, out: &mut String) {
    let mut entries: Vec<(&String, &JsonValue)> = map.iter().collect();
    entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
    out.push('{');
    for (idx, (key, value)) in entries.into_iter().enumerate() {
        if idx > 0 {
            out.push(',');
        }
        out.push_str(&JsonValue::String(key.clone()).to_string());
        out.push(':');
        write_canonical(value, out);
    }
    out.push('}');
}
