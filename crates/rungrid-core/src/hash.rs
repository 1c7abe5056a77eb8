//! Content hashing for runner templates and credentials.

use std::collections::BTreeMap;

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Length of the hex template hash stored in labels.
const TEMPLATE_HASH_LEN: usize = 16;

/// Hash any serializable value into a short hex digest.
///
/// Used as the template hash that drives rolling replacement: two templates
/// with the same JSON form hash the same.
pub fn content_hash<T: Serialize>(value: &T) -> anyhow::Result<String> {
    let bytes = serde_json::to_vec(value)?;
    let digest = hex::encode(Sha256::digest(&bytes));
    Ok(digest[..TEMPLATE_HASH_LEN].to_string())
}

/// Hash a key/value map. Keys are visited in sorted order so insertion
/// order never changes the result. Every key and value is length-prefixed,
/// so no split of the same bytes into different entries collides.
pub fn map_hash(data: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (k, v) in data {
        for part in [k, v] {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part.as_bytes());
        }
    }
    hex::encode(hasher.finalize())
}
