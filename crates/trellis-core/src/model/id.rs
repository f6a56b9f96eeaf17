//! Internal ids, human-facing aliases, and the alias map that ties them.
//!
//! Internal ids are ULIDs: 26-character Crockford base32 strings whose first
//! ten characters encode the creation time in milliseconds, so lexical order
//! is creation order. Aliases are short `prefix-xxx` terseid tokens that grow
//! in length as the project grows. Resolution is exact only: an alias is a permanent
//! citation and must never become ambiguous.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use terseid::{IdConfig, IdGenerator};
use tracing::debug;
use ulid::Ulid;

use super::issue::ParseEnumError;
use crate::codec::DecodeError;
use crate::error::{Error, Result};

const CROCKFORD: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Attempts at a fresh internal id before giving up.
pub const MAX_ID_ATTEMPTS: usize = 5;
const MIN_ALIAS_LEN: usize = 3;
const MAX_ALIAS_LEN: usize = 8;

/// Time-sortable, globally unique internal identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IssueId(String);

impl IssueId {
    pub const LEN: usize = 26;

    /// Validate an internal id.
    pub fn parse(raw: &str) -> Result<Self, ParseEnumError> {
        let valid = raw.len() == Self::LEN
            && raw.bytes().all(|b| CROCKFORD.contains(&b))
            && raw.as_bytes()[0] <= b'7';
        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(ParseEnumError {
                expected: "issue id",
                got: raw.to_string(),
            })
        }
    }

    /// Build an id from a creation time and 80 random bits.
    #[must_use]
    pub fn generate(now: DateTime<Utc>, rng: &mut impl Rng) -> Self {
        Self(Ulid::from_datetime_with_source(now.into(), rng).to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IssueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for IssueId {
    type Error = ParseEnumError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<IssueId> for String {
    fn from(value: IssueId) -> Self {
        value.0
    }
}

/// Short human-facing alias, e.g. `tr-4kx`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Alias(String);

impl Alias {
    /// Validate an alias: lowercase ASCII letters, digits and `-`, with a
    /// non-empty prefix and suffix around the last `-`.
    pub fn parse(raw: &str) -> Result<Self, ParseEnumError> {
        let charset_ok = raw
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
        let shape_ok = raw
            .rsplit_once('-')
            .is_some_and(|(prefix, suffix)| !prefix.is_empty() && !suffix.is_empty());
        if charset_ok && shape_ok && raw.len() <= 48 {
            Ok(Self(raw.to_string()))
        } else {
            Err(ParseEnumError {
                expected: "alias",
                got: raw.to_string(),
            })
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Alias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Alias {
    type Error = ParseEnumError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Alias> for String {
    fn from(value: Alias) -> Self {
        value.0
    }
}

/// Injective alias -> id table, persisted next to the records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AliasMap {
    by_alias: BTreeMap<Alias, IssueId>,
    by_id: BTreeMap<IssueId, Alias>,
}

impl AliasMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `alias` to `id`. Rebinding an existing pair is a no-op; binding
    /// either side to something else is rejected.
    pub fn insert(&mut self, alias: Alias, id: IssueId) -> Result<()> {
        match (self.by_alias.get(&alias), self.by_id.get(&id)) {
            (Some(existing), _) if *existing != id => Err(Error::invalid(
                "alias",
                format!("{alias} already names {existing}"),
            )),
            (_, Some(existing)) if *existing != alias => Err(Error::invalid(
                "alias",
                format!("{id} already has alias {existing}"),
            )),
            _ => {
                self.by_alias.insert(alias.clone(), id.clone());
                self.by_id.insert(id, alias);
                Ok(())
            }
        }
    }

    pub fn remove_id(&mut self, id: &IssueId) -> Option<Alias> {
        let alias = self.by_id.remove(id)?;
        self.by_alias.remove(&alias);
        Some(alias)
    }

    #[must_use]
    pub fn id_for(&self, alias: &Alias) -> Option<&IssueId> {
        self.by_alias.get(alias)
    }

    #[must_use]
    pub fn alias_for(&self, id: &IssueId) -> Option<&Alias> {
        self.by_id.get(id)
    }

    #[must_use]
    pub fn contains_alias(&self, alias: &Alias) -> bool {
        self.by_alias.contains_key(alias)
    }

    #[must_use]
    pub fn contains_id(&self, id: &IssueId) -> bool {
        self.by_id.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_alias.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_alias.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Alias, &IssueId)> {
        self.by_alias.iter()
    }

    /// Canonical text form: one `alias id` line per entry, sorted by alias.
    #[must_use]
    pub fn encode(&self) -> String {
        self.by_alias
            .iter()
            .map(|(alias, id)| format!("{alias} {id}\n"))
            .collect()
    }

    /// Parse the canonical text form, rejecting anything [`encode`] would
    /// not have written.
    ///
    /// [`encode`]: AliasMap::encode
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let mut map = Self::new();
        let mut last: Option<Alias> = None;
        if text.contains('\r') || (!text.is_empty() && !text.ends_with('\n')) {
            return Err(DecodeError::LineEnding);
        }
        for (idx, line) in text.lines().enumerate() {
            let line_no = idx + 1;
            let bad = |reason: String| DecodeError::AliasMap {
                line: line_no,
                reason,
            };
            let (alias_raw, id_raw) = line
                .split_once(' ')
                .ok_or_else(|| bad("expected `<alias> <id>`".into()))?;
            let alias = Alias::parse(alias_raw).map_err(|e| bad(e.to_string()))?;
            let id = IssueId::parse(id_raw).map_err(|e| bad(e.to_string()))?;
            if last.as_ref().is_some_and(|prev| *prev >= alias) {
                return Err(bad(format!("{alias} is duplicated or out of order")));
            }
            if let Some(other) = map.alias_for(&id) {
                return Err(bad(format!("{id} is already mapped by {other}")));
            }
            last = Some(alias.clone());
            map.by_alias.insert(alias.clone(), id.clone());
            map.by_id.insert(id, alias);
        }
        Ok(map)
    }
}

/// Allocates fresh ids and aliases and resolves user input, all against one
/// [`AliasMap`].
#[derive(Debug)]
pub struct IdManager {
    map: AliasMap,
    prefix: String,
    rng: StdRng,
}

impl IdManager {
    #[must_use]
    pub fn new(map: AliasMap, prefix: impl Into<String>) -> Self {
        Self::with_rng(map, prefix, StdRng::from_entropy())
    }

    /// Deterministic variant for tests and simulations.
    #[must_use]
    pub fn with_rng(map: AliasMap, prefix: impl Into<String>, rng: StdRng) -> Self {
        Self {
            map,
            prefix: prefix.into(),
            rng,
        }
    }

    #[must_use]
    pub const fn map(&self) -> &AliasMap {
        &self.map
    }

    #[must_use]
    pub fn into_map(self) -> AliasMap {
        self.map
    }

    /// A new internal id not present in the map.
    pub fn new_id(&mut self, now: DateTime<Utc>) -> Result<IssueId> {
        for attempt in 1..=MAX_ID_ATTEMPTS {
            let id = IssueId::generate(now, &mut self.rng);
            if !self.map.contains_id(&id) {
                return Ok(id);
            }
            debug!(%id, attempt, "internal id collision, retrying");
        }
        Err(Error::IdExhausted {
            what: "issue id",
            attempts: MAX_ID_ATTEMPTS,
        })
    }

    /// A new alias not present in the map.
    ///
    /// The length adapts to the current map size and grows on collision.
    pub fn new_alias(&mut self) -> Result<Alias> {
        let sample = format!("{}-a", self.prefix);
        Alias::parse(&sample).map_err(|e| Error::invalid("alias prefix", e.to_string()))?;

        let salt: [u8; 16] = self.rng.r#gen();
        let generator = IdGenerator::new(
            IdConfig::new(self.prefix.as_str())
                .min_hash_length(MIN_ALIAS_LEN)
                .max_hash_length(MAX_ALIAS_LEN),
        );
        let map = &self.map;
        let raw = generator.generate(
            |nonce| {
                let mut seed = salt.to_vec();
                seed.extend_from_slice(&nonce.to_be_bytes());
                seed
            },
            map.len(),
            |candidate| {
                let taken = Alias::parse(candidate).is_ok_and(|alias| map.contains_alias(&alias));
                if taken {
                    debug!(candidate, "alias collision, retrying");
                }
                taken
            },
        );
        Alias::parse(&raw).map_err(|e| Error::invalid("alias", e.to_string()))
    }

    /// Allocate a fresh id and alias pair and record it in the map.
    pub fn allocate(&mut self, now: DateTime<Utc>) -> Result<(IssueId, Alias)> {
        let id = self.new_id(now)?;
        let alias = self.new_alias()?;
        self.map.insert(alias.clone(), id.clone())?;
        Ok((id, alias))
    }

    /// Bind an existing pair, e.g. when importing a record.
    pub fn assign(&mut self, alias: Alias, id: IssueId) -> Result<()> {
        self.map.insert(alias, id)
    }

    /// Exact lookup of an alias or a full internal id. No prefix matching.
    pub fn resolve(&self, input: &str) -> Result<IssueId> {
        let input = input.trim();
        let by_alias = Alias::parse(input)
            .ok()
            .and_then(|alias| self.map.id_for(&alias).cloned());
        let by_id = || IssueId::parse(input).ok().filter(|id| self.map.contains_id(id));
        by_alias
            .or_else(by_id)
            .ok_or_else(|| Error::not_found("issue", input))
    }

}
