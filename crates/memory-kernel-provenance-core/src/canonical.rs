//! Canonical JSON encoding for hashed payloads.
//!
//! The encoding is a pure function of the logical content:
//! - object keys are NFC-normalized and emitted in byte order,
//! - strings are NFC-normalized,
//! - numbers must be integers representable as `i64` or `u64`,
//! - no insignificant whitespace is emitted.
//!
//! Raw binary must be carried as hex strings or external content hashes.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::Serialize;
use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

/// Maximum nesting accepted by [`encode`].
pub const MAX_DEPTH: usize = 128;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum EncodingError {
    #[error("floating-point number at '{path}' is not allowed in canonical payloads")]
    FloatNotAllowed { path: String },
    #[error("key '{key}' at '{path}' collides with another key after NFC normalization")]
    DuplicateKey { key: String, path: String },
    #[error("payload nested deeper than {max_depth} levels")]
    MaxDepthExceeded { max_depth: usize },
    #[error("value is not representable as JSON: {message}")]
    Unrepresentable { message: String },
}

/// Encodes a JSON value into its canonical byte form.
///
/// # Errors
/// Returns [`EncodingError`] when the value contains floats, keys that collide
/// after normalization, or nesting beyond [`MAX_DEPTH`].
pub fn encode(value: &Value) -> Result<Vec<u8>, EncodingError> {
    Ok(encode_to_string(value)?.into_bytes())
}

/// Same as [`encode`] but returns the UTF-8 text.
///
/// # Errors
/// Returns [`EncodingError`] under the same conditions as [`encode`].
pub fn encode_to_string(value: &Value) -> Result<String, EncodingError> {
    let mut output = String::new();
    emit_value(value, "$", 0, &mut output)?;
    Ok(output)
}

/// `SHA-256(encode(value))`, lowercase hex.
///
/// # Errors
/// Returns [`EncodingError`] when the value cannot be canonically encoded.
pub fn hash(value: &Value) -> Result<String, EncodingError> {
    Ok(hash_bytes(&encode(value)?))
}

/// Encodes any serializable value through its `serde_json` representation.
///
/// # Errors
/// Returns [`EncodingError`] when serialization fails or the resulting value
/// is not canonicalizable.
pub fn encode_serializable<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, EncodingError> {
    encode(&to_value(value)?)
}

/// Hashes any serializable value through its canonical encoding.
///
/// # Errors
/// Returns [`EncodingError`] when serialization fails or the resulting value
/// is not canonicalizable.
pub fn hash_serializable<T: Serialize + ?Sized>(value: &T) -> Result<String, EncodingError> {
    hash(&to_value(value)?)
}

/// Converts a serializable value into a `serde_json::Value`.
///
/// # Errors
/// Returns [`EncodingError::Unrepresentable`] when serialization fails.
pub fn to_value<T: Serialize + ?Sized>(value: &T) -> Result<Value, EncodingError> {
    serde_json::to_value(value).map_err(|err| EncodingError::Unrepresentable {
        message: err.to_string(),
    })
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// True when `value` looks like a lowercase hex SHA-256 digest.
#[must_use]
pub fn is_digest(value: &str) -> bool {
    value.len() == 64
        && value
            .bytes()
            .all(|byte| byte.is_ascii_digit() || (b'a'..=b'f').contains(&byte))
}

fn emit_value(
    value: &Value,
    path: &str,
    depth: usize,
    output: &mut String,
) -> Result<(), EncodingError> {
    if depth > MAX_DEPTH {
        return Err(EncodingError::MaxDepthExceeded {
            max_depth: MAX_DEPTH,
        });
    }

    match value {
        Value::Null => output.push_str("null"),
        Value::Bool(flag) => output.push_str(if *flag { "true" } else { "false" }),
        Value::Number(number) => emit_number(number, path, output)?,
        Value::String(text) => emit_string(&text.nfc().collect::<String>(), output),
        Value::Array(items) => {
            output.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    output.push(',');
                }
                emit_value(item, &format!("{path}[{index}]"), depth + 1, output)?;
            }
            output.push(']');
        }
        Value::Object(map) => emit_object(map, path, depth, output)?,
    }

    Ok(())
}

fn emit_object(
    map: &Map<String, Value>,
    path: &str,
    depth: usize,
    output: &mut String,
) -> Result<(), EncodingError> {
    let mut sorted: BTreeMap<String, &Value> = BTreeMap::new();
    for (key, value) in map {
        let normalized: String = key.nfc().collect();
        if sorted.insert(normalized, value).is_some() {
            return Err(EncodingError::DuplicateKey {
                key: key.clone(),
                path: path.to_string(),
            });
        }
    }

    output.push('{');
    for (index, (key, value)) in sorted.iter().enumerate() {
        if index > 0 {
            output.push(',');
        }
        emit_string(key, output);
        output.push(':');
        emit_value(value, &format!("{path}.{key}"), depth + 1, output)?;
    }
    output.push('}');

    Ok(())
}

fn emit_number(number: &Number, path: &str, output: &mut String) -> Result<(), EncodingError> {
    if let Some(value) = number.as_i64() {
        let _ = write!(output, "{value}");
        return Ok(());
    }
    if let Some(value) = number.as_u64() {
        let _ = write!(output, "{value}");
        return Ok(());
    }

    Err(EncodingError::FloatNotAllowed {
        path: path.to_string(),
    })
}

fn emit_string(text: &str, output: &mut String) {
    output.push('"');
    for ch in text.chars() {
        match ch {
            '"' => output.push_str("\\\""),
            '\\' => output.push_str("\\\\"),
            '\u{0008}' => output.push_str("\\b"),
            '\u{000C}' => output.push_str("\\f"),
            '\n' => output.push_str("\\n"),
            '\r' => output.push_str("\\r"),
            '\t' => output.push_str("\\t"),
            ch if ch <= '\u{001F}' => {
                let _ = write!(output, "\\u{:04x}", u32::from(ch));
            }
            ch => output.push(ch),
        }
    }
    output.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn keys_are_sorted_and_whitespace_is_dropped() {
        let value = json!({"b": 1, "a": {"z": true, "y": null}, "c": [3, "x"]});
        let encoded = must_ok(encode_to_string(&value));
        assert_eq!(encoded, r#"{"a":{"y":null,"z":true},"b":1,"c":[3,"x"]}"#);
    }

    #[test]
    fn insertion_order_does_not_change_bytes() {
        let mut first = Map::new();
        first.insert("alpha".to_string(), json!(1));
        first.insert("beta".to_string(), json!(2));
        let mut second = Map::new();
        second.insert("beta".to_string(), json!(2));
        second.insert("alpha".to_string(), json!(1));

        assert_eq!(
            must_ok(encode(&Value::Object(first))),
            must_ok(encode(&Value::Object(second)))
        );
    }

    #[test]
    fn floats_are_rejected_with_path() {
        let value = json!({"outer": {"ratio": 0.5}});
        match encode(&value) {
            Err(EncodingError::FloatNotAllowed { path }) => assert_eq!(path, "$.outer.ratio"),
            other => panic!("expected FloatNotAllowed, got {other:?}"),
        }
    }

    #[test]
    fn integral_float_is_still_a_float() {
        assert!(matches!(
            encode(&json!([1.0])),
            Err(EncodingError::FloatNotAllowed { .. })
        ));
    }

    #[test]
    fn large_integers_are_kept_exact() {
        let value = json!({"max_u": u64::MAX, "min_i": i64::MIN});
        let encoded = must_ok(encode_to_string(&value));
        assert_eq!(
            encoded,
            format!(r#"{{"max_u":{},"min_i":{}}}"#, u64::MAX, i64::MIN)
        );
    }

    #[test]
    fn strings_are_nfc_normalized() {
        let decomposed = json!({"name": "Cafe\u{0301}"});
        let composed = json!({"name": "Caf\u{00e9}"});
        assert_eq!(must_ok(hash(&decomposed)), must_ok(hash(&composed)));
    }

    #[test]
    fn keys_colliding_after_normalization_are_rejected() {
        let mut map = Map::new();
        map.insert("e\u{0301}".to_string(), json!(1));
        map.insert("\u{00e9}".to_string(), json!(2));
        assert!(matches!(
            encode(&Value::Object(map)),
            Err(EncodingError::DuplicateKey { .. })
        ));
    }

    #[test]
    fn control_characters_are_escaped() {
        let encoded = must_ok(encode_to_string(&json!("a\u{0001}\n\"")));
        assert_eq!(encoded, r#""a\u0001\n\"""#);
    }

    #[test]
    fn excessive_nesting_is_rejected() {
        let mut value = json!(0);
        for _ in 0..=MAX_DEPTH {
            value = json!([value]);
        }
        assert_eq!(
            encode(&value),
            Err(EncodingError::MaxDepthExceeded {
                max_depth: MAX_DEPTH
            })
        );
    }

    #[test]
    fn hash_bytes_matches_known_digest() {
        assert_eq!(
            hash_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(is_digest(&hash_bytes(b"")));
        assert!(!is_digest("ABC"));
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            "[a-zA-Z0-9 \\u{00e9}\\u{0301}]{0,12}".prop_map(Value::String),
        ];
        leaf.prop_recursive(4, 48, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..6)
                    .prop_map(|map| Value::Object(map.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn encoding_is_deterministic(value in arb_value()) {
            let first = must_ok(encode(&value));
            let second = must_ok(encode(&value.clone()));
            prop_assert_eq!(&first, &second);

            let reparsed: Value = must_ok(serde_json::from_slice(&first));
            prop_assert_eq!(must_ok(encode(&reparsed)), first);
        }
    }
}
