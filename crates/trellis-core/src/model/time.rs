//! Timestamp normalization shared by the codec, merge engine, and attic.
//!
//! Every persisted timestamp is UTC with exactly microsecond precision, so a
//! value read back from disk compares equal to the value that was written.

use chrono::{DateTime, NaiveDateTime, SubsecRound, TimeZone, Utc};

/// The one textual timestamp format, e.g. `2026-01-02T03:04:05.000006Z`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

/// Current time truncated to the persisted precision.
#[must_use]
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

#[must_use]
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a timestamp, accepting only the exact text [`format_timestamp`]
/// would produce.
#[must_use]
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT).ok()?;
    let ts = Utc.from_utc_datetime(&naive);
    (format_timestamp(ts) == raw).then_some(ts)
}

/// Compact form used in file names: `20260102T030405000006Z`.
#[must_use]
pub fn compact_timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y%m%dT%H%M%S%6fZ").to_string()
}

/// `#[serde(with = "...")]` adapter writing timestamps in [`TIMESTAMP_FORMAT`].
pub mod serde_timestamp {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_timestamp(*ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_timestamp(&raw)
            .ok_or_else(|| D::Error::custom(format!("'{raw}' is not a normalized UTC timestamp")))
    }
}
