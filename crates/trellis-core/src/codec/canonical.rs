//! Canonical JSON serialization.
//!
//! Produces compact JSON with object keys sorted lexicographically at every
//! nesting level. Every JSON value the codec, the attic, and the content
//! hash see goes through here, so the same logical value always produces the
//! same byte sequence.
//!
//! Rules:
//! - Compact: no whitespace between tokens.
//! - Object keys sorted lexicographically (recursive at every depth).
//! - Arrays preserve element order.
//! - Numbers, strings, booleans, and null serialized normally.

use serde_json::Value;

/// Produce a canonical JSON string from a [`serde_json::Value`].
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use trellis_core::codec::canonical::canonicalize_json;
///
/// let val = json!({"z": 1, "a": {"c": 3, "b": 2}});
/// assert_eq!(canonicalize_json(&val), r#"{"a":{"b":2,"c":3},"z":1}"#);
/// ```
#[must_use]
pub fn canonicalize_json(value: &Value) -> String {
    let mut buf = String::new();
    write_canonical(value, &mut buf);
    buf
}

fn write_canonical(value: &Value, buf: &mut String) {
    match value {
        Value::Null => buf.push_str("null"),
        Value::Bool(b) => buf.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => buf.push_str(&n.to_string()),
        Value::String(s) => write_string(s, buf),
        Value::Array(arr) => {
            buf.push('[');
            for (i, item) in arr.iter().enumerate() {
                if i > 0 {
                    buf.push(',');
                }
                write_canonical(item, buf);
            }
            buf.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            buf.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    buf.push(',');
                }
                write_string(key, buf);
                buf.push(':');
                if let Some(val) = map.get(*key) {
                    write_canonical(val, buf);
                }
            }
            buf.push('}');
        }
    }
}

fn write_string(s: &str, buf: &mut String) {
    // `Value`'s Display is serde_json's compact serializer.
    buf.push_str(&Value::from(s).to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalars() {
        assert_eq!(canonicalize_json(&json!(null)), "null");
        assert_eq!(canonicalize_json(&json!(true)), "true");
        assert_eq!(canonicalize_json(&json!(42)), "42");
        assert_eq!(canonicalize_json(&json!("hello")), "\"hello\"");
    }

    #[test]
    fn string_escapes_match_serde_json() {
        for s in ["he said \"hi\"", "tab\there", "line\nbreak", "bell\u{7}", "snow ☃", "back\\slash"] {
            assert_eq!(
                canonicalize_json(&json!(s)),
                serde_json::to_string(s).unwrap(),
                "escaping differs for {s:?}"
            );
        }
    }

    #[test]
    fn array_preserves_order() {
        assert_eq!(canonicalize_json(&json!([3, 1, 2])), "[3,1,2]");
        assert_eq!(canonicalize_json(&json!([])), "[]");
    }

    #[test]
    fn nested_keys_are_sorted() {
        let val = json!({"b": {"y": [1, {"d": 1, "c": 2}], "x": null}, "a": {}});
        assert_eq!(
            canonicalize_json(&val),
            r#"{"a":{},"b":{"x":null,"y":[1,{"c":2,"d":1}]}}"#
        );
    }

    #[test]
    fn output_reparses_to_same_value() {
        let val = json!({"k": ["a", 1.5, false, {"z": "\u{1}"}]});
        let text = canonicalize_json(&val);
        let back: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(back, val);
        assert_eq!(canonicalize_json(&back), text);
    }
}
