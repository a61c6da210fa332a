//! Hashing - SHA-256 Digests
//!
//! Artifacts and layouts are identified by stable digests so an export
//! summary can be checked against the files on disk.

use std::fmt::Write;

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::field::Field;

/// Lowercase hex SHA-256
pub fn sha256_hex(data: &[u8]) -> String {
    Sha256::digest(data)
        .iter()
        .fold(String::with_capacity(64), |mut hex, byte| {
            let _ = write!(hex, "{:02x}", byte);
            hex
        })
}

/// Compact JSON with object keys in lexical order at every depth
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let mut value = serde_json::to_value(value)?;
    sort_keys(&mut value);
    serde_json::to_string(&value)
}

fn sort_keys(value: &mut Value) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = std::mem::take(map).into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            for (_, child) in entries.iter_mut() {
                sort_keys(child);
            }
            *map = entries.into_iter().collect::<Map<String, Value>>();
        }
        Value::Array(items) => items.iter_mut().for_each(sort_keys),
        _ => {}
    }
}

/// Digest of an ordered field list; order matters
pub fn compute_layout_hash(fields: &[Field]) -> Result<String, serde_json::Error> {
    let canonical = canonical_json(&fields)?;
    Ok(sha256_hex(canonical.as_bytes()))
}
