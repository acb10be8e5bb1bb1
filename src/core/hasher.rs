//! BLAKE3 content hashing for module identity and body dedup.
//!
//! Hashes are short (`blake3:` + 16 hex chars); they only need to tell module
//! instances and rendered bodies apart within one compile.

use indexmap::IndexMap;
use std::collections::BTreeMap;

const HASH_HEX_LEN: usize = 16;

/// Hash raw bytes. Returns `"blake3:{hex16}"`.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let hex = blake3::hash(bytes).to_hex();
    format!("blake3:{}", &hex[..HASH_HEX_LEN])
}

/// Hash a string. Returns `"blake3:{hex16}"`.
pub fn hash_string(s: &str) -> String {
    hash_bytes(s.as_bytes())
}

/// Synthetic source hash for a root module that was not read from a file.
pub fn root_hash(name: &str) -> String {
    hash_string(name)
}

/// Identity of a module instance: its source plus the vars it was bound with.
///
/// Vars are serialized with sorted keys, so declaration order does not
/// change the hash.
pub fn env_hash(source_hash: &str, vars: &IndexMap<String, serde_yaml_ng::Value>) -> String {
    let sorted: BTreeMap<&str, &serde_yaml_ng::Value> =
        vars.iter().map(|(k, v)| (k.as_str(), v)).collect();
    let serialized = serde_json::to_string(&sorted).unwrap_or_else(|_| format!("{:?}", sorted));
    let h = hash_string(&format!("{}:{}", source_hash, serialized));
    tracing::trace!(source_hash, env_hash = %h, "env hash");
    h
}
