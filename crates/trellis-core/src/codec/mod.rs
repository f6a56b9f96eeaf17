//! Record codec: the canonical text form of an [`Issue`] and its content hash.
//!
//! # Record format
//!
//! ```text
//! # trellis issue v1
//! id: "01J9ZQ4Y7G0000000000000000"
//! alias: "tr-4kx"
//! version: 3
//! ...
//! stamps: {"priority":"2026-01-02T03:04:05.000006Z"}
//! ```
//!
//! - One `name: value` line per [`Field`], always in [`Field::ALL`] order.
//! - Every value is canonical JSON: absent optional values are `null`, empty
//!   collections are `[]`/`{}`, nothing is ever omitted.
//! - LF line endings, trailing newline, no trailing whitespace.
//!
//! [`decode`] accepts exactly the bytes [`encode`] writes. Anything else is
//! rejected with the offending field named, so a file touched by hand either
//! still means exactly one record or fails loudly.

pub mod canonical;

use serde_json::Value;

use chrono::{DateTime, Utc};

use self::canonical::canonicalize_json;
use crate::model::{Alias, Field, Issue, IssueId, ParseEnumError};

/// First line of every record file.
pub const RECORD_HEADER: &str = "# trellis issue v1";

/// Prefix of every content hash.
pub const HASH_PREFIX: &str = "blake3:";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why some bytes are not a canonical record (or alias map).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("record is not valid UTF-8")]
    NotUtf8,

    #[error("record must use LF line endings and end with a newline")]
    LineEnding,

    #[error("line 1: expected header `{expected}`")]
    Header { expected: &'static str },

    #[error("line {line}: missing field `{field}`")]
    MissingField { field: Field, line: usize },

    #[error("line {line}: expected field `{expected}`, found `{found}`")]
    UnexpectedField {
        expected: Field,
        found: String,
        line: usize,
    },

    #[error("field `{field}`: {reason}")]
    InvalidValue { field: Field, reason: String },

    #[error("field `{field}`: value is not in canonical form")]
    NonCanonical { field: Field },

    #[error("line {line}: unexpected content after the last field")]
    TrailingContent { line: usize },

    #[error("alias map line {line}: {reason}")]
    AliasMap { line: usize, reason: String },
}

impl DecodeError {
    /// The record field the error is about, when there is one.
    #[must_use]
    pub const fn field(&self) -> Option<Field> {
        match self {
            Self::MissingField { field, .. }
            | Self::UnexpectedField {
                expected: field, ..
            }
            | Self::InvalidValue { field, .. }
            | Self::NonCanonical { field } => Some(*field),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Serialize a record to its canonical bytes.
#[must_use]
pub fn encode(issue: &Issue) -> Vec<u8> {
    encode_string(issue).into_bytes()
}

/// [`encode`], as text.
#[must_use]
pub fn encode_string(issue: &Issue) -> String {
    let mut out = String::with_capacity(512);
    out.push_str(RECORD_HEADER);
    out.push('\n');
    for field in Field::ALL {
        out.push_str(field.name());
        out.push_str(": ");
        out.push_str(&canonicalize_json(&field.value(issue)));
        out.push('\n');
    }
    out
}

/// Parse canonical record bytes.
///
/// # Errors
///
/// Returns a [`DecodeError`] naming the first offending line or field.
pub fn decode(bytes: &[u8]) -> Result<Issue, DecodeError> {
    let text = std::str::from_utf8(bytes).map_err(|_| DecodeError::NotUtf8)?;
    let body = text
        .strip_suffix('\n')
        .filter(|_| !text.contains('\r'))
        .ok_or(DecodeError::LineEnding)?;

    let mut lines = body.split('\n');
    if lines.next() != Some(RECORD_HEADER) {
        return Err(DecodeError::Header {
            expected: RECORD_HEADER,
        });
    }

    let mut values = Vec::with_capacity(Field::ALL.len());
    for (idx, field) in Field::ALL.into_iter().enumerate() {
        let line = idx + 2;
        let raw = lines.next().ok_or(DecodeError::MissingField { field, line })?;
        let (key, value) = raw.split_once(": ").unwrap_or((raw, ""));
        if key != field.name() {
            return Err(DecodeError::UnexpectedField {
                expected: field,
                found: key.to_string(),
                line,
            });
        }
        let parsed: Value =
            serde_json::from_str(value).map_err(|e| DecodeError::InvalidValue {
                field,
                reason: e.to_string(),
            })?;
        if canonicalize_json(&parsed) != value {
            return Err(DecodeError::NonCanonical { field });
        }
        values.push((field, parsed));
    }

    if lines.next().is_some() {
        return Err(DecodeError::TrailingContent {
            line: Field::ALL.len() + 2,
        });
    }

    // Identity first, then let every field (identity included) overwrite the
    // skeleton; each assignment validates its own value.
    let id = identifier(Field::Id, &values[0].1, IssueId::parse)?;
    let alias = identifier(Field::Alias, &values[1].1, Alias::parse)?;
    let mut issue = Issue::new(id, alias, "-", "-", DateTime::<Utc>::default());
    for (field, value) in values {
        field
            .assign(&mut issue, value)
            .map_err(|reason| DecodeError::InvalidValue { field, reason })?;
    }
    Ok(issue)
}

/// Content hash of a record: `blake3:<hex>` of its canonical encoding.
///
/// Equal for two records exactly when their field values are equal.
#[must_use]
pub fn content_hash(issue: &Issue) -> String {
    format!("{HASH_PREFIX}{}", blake3::hash(&encode(issue)).to_hex())
}

/// Hash of a single canonical JSON value. Used as the deterministic
/// tie-break between two competing field values.
#[must_use]
pub fn value_hash(value: &Value) -> String {
    format!(
        "{HASH_PREFIX}{}",
        blake3::hash(canonicalize_json(value).as_bytes()).to_hex()
    )
}

/// A whole record as one JSON object keyed by field name. Used for
/// whole-record conflict remnants.
#[must_use]
pub fn record_value(issue: &Issue) -> Value {
    Value::Object(
        Field::ALL
            .into_iter()
            .map(|field| (field.name().to_string(), field.value(issue)))
            .collect(),
    )
}

/// Inverse of [`record_value`].
///
/// # Errors
///
/// Returns a [`DecodeError`] naming the missing or invalid field.
pub fn record_from_value(value: &Value) -> Result<Issue, DecodeError> {
    let Some(map) = value.as_object() else {
        return Err(DecodeError::InvalidValue {
            field: Field::Id,
            reason: "expected a record object".into(),
        });
    };
    let get = |field: Field| {
        map.get(field.name())
            .cloned()
            .ok_or(DecodeError::MissingField { field, line: 0 })
    };
    let id = identifier(Field::Id, &get(Field::Id)?, IssueId::parse)?;
    let alias = identifier(Field::Alias, &get(Field::Alias)?, Alias::parse)?;
    let mut issue = Issue::new(id, alias, "-", "-", DateTime::<Utc>::default());
    for field in Field::ALL {
        field
            .assign(&mut issue, get(field)?)
            .map_err(|reason| DecodeError::InvalidValue { field, reason })?;
    }
    Ok(issue)
}

fn identifier<T>(
    field: Field,
    value: &Value,
    parse: fn(&str) -> Result<T, ParseEnumError>,
) -> Result<T, DecodeError> {
    let raw = value.as_str().ok_or_else(|| DecodeError::InvalidValue {
        field,
        reason: format!("expected a string, found {value}"),
    })?;
    parse(raw).map_err(|e| DecodeError::InvalidValue {
        field,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::time::parse_timestamp;
    use crate::model::{DepKind, Priority, Status};
    use serde_json::json;

    fn sample() -> Issue {
        let ts = parse_timestamp("2026-01-01T00:00:00.000000Z").unwrap();
        let mut issue = Issue::new(
            IssueId::parse("01J9ZQ4Y7G0000000000000000").unwrap(),
            Alias::parse("tr-abc").unwrap(),
            "Fix login",
            "alice",
            ts,
        );
        issue.labels.insert("backend".into());
        issue.labels.insert("auth".into());
        issue.deps.insert(
            IssueId::parse("01J9ZQ4Y7G0000000000000001").unwrap(),
            DepKind::Blocks,
        );
        issue.description = Some("line one\nline two".into());
        issue.extra.insert("estimate".into(), json!({"unit": "h", "value": 3}));
        issue.priority = Priority::new(1).unwrap();
        issue.status = Status::InProgress;
        issue
    }

    #[test]
    fn encoding_is_line_per_field_in_order() {
        let text = encode_string(&sample());
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], RECORD_HEADER);
        assert_eq!(lines.len(), Field::ALL.len() + 1);
        for (line, field) in lines[1..].iter().zip(Field::ALL) {
            assert!(line.starts_with(&format!("{}: ", field.name())), "{line}");
            assert_eq!(line.trim_end(), *line);
        }
        assert!(text.contains("labels: [\"auth\",\"backend\"]\n"));
        assert!(text.contains("assignee: null\n"));
        assert!(text.contains("extra: {\"estimate\":{\"unit\":\"h\",\"value\":3}}\n"));
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn decode_inverts_encode() {
        let issue = sample();
        let bytes = encode(&issue);
        let back = decode(&bytes).unwrap();
        assert_eq!(back, issue);
        assert_eq!(encode(&back), bytes);
    }

    #[test]
    fn decode_rejects_crlf_and_missing_newline() {
        let text = encode_string(&sample());
        assert_eq!(
            decode(text.replace('\n', "\r\n").as_bytes()),
            Err(DecodeError::LineEnding)
        );
        assert_eq!(
            decode(text.trim_end().as_bytes()),
            Err(DecodeError::LineEnding)
        );
    }

    #[test]
    fn decode_rejects_non_canonical_values() {
        let text = encode_string(&sample()).replace("version: 1", "version:  1");
        let err = decode(text.as_bytes()).unwrap_err();
        assert_eq!(err.field(), Some(Field::Version));

        let text = encode_string(&sample())
            .replace("{\"unit\":\"h\",\"value\":3}", "{\"value\":3,\"unit\":\"h\"}");
        assert_eq!(
            decode(text.as_bytes()),
            Err(DecodeError::NonCanonical {
                field: Field::Extra
            })
        );
    }

    #[test]
    fn decode_rejects_reordered_and_missing_fields() {
        let text = encode_string(&sample());
        let mut lines: Vec<&str> = text.lines().collect();
        lines.swap(4, 5);
        let swapped = format!("{}\n", lines.join("\n"));
        assert!(matches!(
            decode(swapped.as_bytes()),
            Err(DecodeError::UnexpectedField {
                expected: Field::Kind,
                line: 5,
                ..
            })
        ));

        lines.swap(4, 5);
        lines.pop();
        let truncated = format!("{}\n", lines.join("\n"));
        assert_eq!(
            decode(truncated.as_bytes()).unwrap_err().field(),
            Some(Field::Stamps)
        );
    }

    #[test]
    fn decode_rejects_bad_field_values() {
        let text = encode_string(&sample()).replace("priority: 1", "priority: 9");
        assert!(matches!(
            decode(text.as_bytes()),
            Err(DecodeError::InvalidValue {
                field: Field::Priority,
                ..
            })
        ));

        let text = encode_string(&sample()).replace(
            "labels: [\"auth\",\"backend\"]",
            "labels: [\"backend\",\"auth\"]",
        );
        assert_eq!(
            decode(text.as_bytes()).unwrap_err().field(),
            Some(Field::Labels)
        );
    }

    #[test]
    fn decode_rejects_trailing_content_and_bad_header() {
        let mut text = encode_string(&sample());
        text.push_str("body: \"x\"\n");
        assert!(matches!(
            decode(text.as_bytes()),
            Err(DecodeError::TrailingContent { .. })
        ));

        let text = encode_string(&sample()).replace(RECORD_HEADER, "# beads");
        assert!(matches!(
            decode(text.as_bytes()),
            Err(DecodeError::Header { .. })
        ));
        assert_eq!(decode(&[0xff, 0xfe]), Err(DecodeError::NotUtf8));
    }

    #[test]
    fn record_value_roundtrips() {
        let issue = sample();
        let value = record_value(&issue);
        assert_eq!(value["alias"], json!("tr-abc"));
        assert_eq!(record_from_value(&value).unwrap(), issue);
        assert!(record_from_value(&json!({"id": "x"})).is_err());
    }

    #[test]
    fn content_hash_tracks_logical_value() {
        let a = sample();
        let mut b = sample();
        assert_eq!(content_hash(&a), content_hash(&b));
        assert!(content_hash(&a).starts_with(HASH_PREFIX));
        assert_eq!(content_hash(&a).len(), HASH_PREFIX.len() + 64);

        b.labels.insert("zzz".into());
        assert_ne!(content_hash(&a), content_hash(&b));
    }
}
