//! Canonical JSON emission.
//!
//! Canonical form sorts object keys in lexicographic byte order, emits no
//! whitespace between tokens, and uses minimal string escaping, so that
//! byte-equal input always produces byte-equal output. Numbers keep
//! `serde_json`'s shortest-round-trip formatting, which is deterministic
//! across platforms.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Maximum nesting depth accepted during canonicalization.
pub const MAX_DEPTH: usize = 128;

/// Errors raised while producing canonical JSON.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CanonicalJsonError {
    /// The value is nested deeper than [`MAX_DEPTH`] levels.
    #[error("max depth exceeded: value nested deeper than {max_depth} levels")]
    MaxDepthExceeded {
        /// The enforced depth limit.
        max_depth: usize,
    },

    /// The value could not be converted to JSON.
    #[error("serialization failed: {message}")]
    Serialize {
        /// Description of the serialization failure.
        message: String,
    },
}

/// Serializes any value to its canonical JSON string.
///
/// # Errors
///
/// Returns [`CanonicalJsonError`] when the value cannot be represented as
/// JSON or exceeds the depth limit.
pub fn to_canonical_json<T: Serialize>(value: &T) -> Result<String, CanonicalJsonError> {
    let value = serde_json::to_value(value).map_err(|e| CanonicalJsonError::Serialize {
        message: e.to_string(),
    })?;
    canonical_string(&value)
}

/// Emits a [`Value`] in canonical form.
///
/// # Errors
///
/// Returns [`CanonicalJsonError::MaxDepthExceeded`] when the value nests
/// deeper than [`MAX_DEPTH`] levels.
pub fn canonical_string(value: &Value) -> Result<String, CanonicalJsonError> {
    let mut out = String::new();
    emit_value(value, &mut out, 0)?;
    Ok(out)
}

fn emit_value(value: &Value, out: &mut String, depth: usize) -> Result<(), CanonicalJsonError> {
    if depth > MAX_DEPTH {
        return Err(CanonicalJsonError::MaxDepthExceeded {
            max_depth: MAX_DEPTH,
        });
    }
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => emit_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                emit_value(item, out, depth + 1)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            // serde_json maps iterate in insertion order only with the
            // preserve_order feature; sort explicitly so the output does not
            // depend on feature unification.
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                emit_string(key, out);
                out.push(':');
                emit_value(&map[key.as_str()], out, depth + 1)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

fn emit_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => {
                use std::fmt::Write as _;
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn keys_are_sorted_and_whitespace_dropped() {
        let value = json!({"z": 1, "a": {"c": true, "b": [1, 2]}});
        assert_eq!(
            canonical_string(&value).unwrap(),
            r#"{"a":{"b":[1,2],"c":true},"z":1}"#
        );
    }

    #[test]
    fn byte_equal_input_gives_byte_equal_output() {
        let a = json!({"k": "v", "n": 42, "list": [null, false]});
        let b = json!({"n": 42, "list": [null, false], "k": "v"});
        assert_eq!(canonical_string(&a).unwrap(), canonical_string(&b).unwrap());
    }

    #[test]
    fn control_characters_are_escaped() {
        let value = json!({"s": "a\"b\\c\nd\u{01}"});
        assert_eq!(
            canonical_string(&value).unwrap(),
            "{\"s\":\"a\\\"b\\\\c\\nd\\u0001\"}"
        );
    }

    #[test]
    fn depth_limit_is_enforced() {
        let mut value = json!(0);
        for _ in 0..(MAX_DEPTH + 2) {
            value = json!([value]);
        }
        assert!(matches!(
            canonical_string(&value),
            Err(CanonicalJsonError::MaxDepthExceeded { .. })
        ));
    }
}
