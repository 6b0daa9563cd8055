//! Determinism helpers: canonical JSON and state hashing.
//!
//! The serialization invariant for every persisted or published envelope is
//! canonical JSON: lexicographically sorted keys, UTF-8, no insignificant
//! whitespace, byte-equal output for byte-equal input. The agent-state hash
//! computed over the same canonical form is the determinism oracle used by
//! the replay property tests.

mod canonical_json;

pub use canonical_json::{canonical_string, to_canonical_json, CanonicalJsonError, MAX_DEPTH};

use serde::Serialize;
use sha2::{Digest, Sha256};

/// SHA-256 hex digest of a value's canonical JSON form.
///
/// # Errors
///
/// Returns [`CanonicalJsonError`] when the value cannot be serialized or is
/// nested deeper than [`MAX_DEPTH`].
pub fn state_hash<T: Serialize>(value: &T) -> Result<String, CanonicalJsonError> {
    let canonical = to_canonical_json(value)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write as _;
        let _ = write!(out, "{byte:02x}");
    }
    Ok(out)
}

/// Short deterministic token derived from a stable identifier.
///
/// Used by system agents that must allocate identifiers (lease tokens)
/// without consulting an RNG.
#[must_use]
pub fn derive_token(seed: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(32);
    for byte in digest.iter().take(16) {
        use std::fmt::Write as _;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_hash_is_stable() {
        let a = serde_json::json!({"b": 1, "a": {"z": "x", "y": 2}});
        let b = serde_json::json!({"a": {"y": 2, "z": "x"}, "b": 1});
        assert_eq!(state_hash(&a).unwrap(), state_hash(&b).unwrap());
    }

    #[test]
    fn state_hash_differs_on_content() {
        let a = serde_json::json!({"a": 1});
        let b = serde_json::json!({"a": 2});
        assert_ne!(state_hash(&a).unwrap(), state_hash(&b).unwrap());
    }

    #[test]
    fn derive_token_is_deterministic() {
        assert_eq!(derive_token("msg-1"), derive_token("msg-1"));
        assert_ne!(derive_token("msg-1"), derive_token("msg-2"));
        assert_eq!(derive_token("msg-1").len(), 32);
    }
}
