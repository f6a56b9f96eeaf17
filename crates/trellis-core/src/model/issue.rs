use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::{fmt, str::FromStr};

use super::field::{Field, Strategy};
use super::id::{Alias, IssueId};

/// The closed set of issue kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Bug,
    Feature,
    Task,
    Epic,
    Chore,
}

impl Kind {
    pub const ALL: [Self; 5] = [Self::Bug, Self::Feature, Self::Task, Self::Epic, Self::Chore];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bug => "bug",
            Self::Feature => "feature",
            Self::Task => "task",
            Self::Epic => "epic",
            Self::Chore => "chore",
        }
    }
}

/// Lifecycle status of an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Open,
    InProgress,
    Blocked,
    Deferred,
    Closed,
}

impl Status {
    pub const ALL: [Self; 5] = [
        Self::Open,
        Self::InProgress,
        Self::Blocked,
        Self::Deferred,
        Self::Closed,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::Deferred => "deferred",
            Self::Closed => "closed",
        }
    }
}

/// Relation carried by a dependency edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DepKind {
    Blocks,
    Related,
    ParentChild,
    DiscoveredFrom,
}

impl DepKind {
    pub const ALL: [Self; 4] = [
        Self::Blocks,
        Self::Related,
        Self::ParentChild,
        Self::DiscoveredFrom,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Blocks => "blocks",
            Self::Related => "related",
            Self::ParentChild => "parent-child",
            Self::DiscoveredFrom => "discovered-from",
        }
    }
}

/// Priority bounded to `0..=4`, 0 being the most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const MAX: u8 = 4;
    pub const DEFAULT: Self = Self(2);

    /// Build a priority, rejecting values above [`Priority::MAX`].
    pub fn new(value: u8) -> Result<Self, ParseEnumError> {
        if value <= Self::MAX {
            Ok(Self(value))
        } else {
            Err(ParseEnumError {
                expected: "priority (0-4)",
                got: value.to_string(),
            })
        }
    }

    #[must_use]
    pub const fn get(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl TryFrom<u8> for Priority {
    type Error = ParseEnumError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(value: Priority) -> Self {
        value.0
    }
}

/// Error returned when parsing an enum value from text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEnumError {
    pub expected: &'static str,
    pub got: String,
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: '{}'", self.expected, self.got)
    }
}

impl std::error::Error for ParseEnumError {}

macro_rules! display_and_parse {
    ($ty:ident, $label:literal) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let normalized = s.trim().to_ascii_lowercase();
                Self::ALL
                    .into_iter()
                    .find(|v| v.as_str() == normalized)
                    .ok_or_else(|| ParseEnumError {
                        expected: $label,
                        got: s.to_string(),
                    })
            }
        }
    };
}

display_and_parse!(Kind, "kind");
display_and_parse!(Status, "status");
display_and_parse!(DepKind, "dependency kind");

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

impl FromStr for Priority {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix('P')
            .or_else(|| trimmed.strip_prefix('p'))
            .unwrap_or(trimmed);
        digits
            .parse::<u8>()
            .map_err(|_| ParseEnumError {
                expected: "priority (0-4)",
                got: s.to_string(),
            })
            .and_then(Self::new)
    }
}

/// One issue record: the unit of storage, sync, and merge.
///
/// Labels and dependencies live in ordered collections so two copies with
/// the same logical content are always structurally equal, which is what
/// keeps the canonical encoding (and hence the content hash) stable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub id: IssueId,
    pub alias: Alias,
    pub version: u64,
    pub kind: Kind,
    pub status: Status,
    pub priority: Priority,
    pub title: String,
    pub description: Option<String>,
    pub notes: Option<String>,
    pub assignee: Option<String>,
    pub parent: Option<IssueId>,
    pub labels: BTreeSet<String>,
    pub deps: BTreeMap<IssueId, DepKind>,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub due_at: Option<DateTime<Utc>>,
    pub defer_until: Option<DateTime<Utc>>,
    /// Last-write time of each LWW field written after creation.
    pub stamps: BTreeMap<Field, DateTime<Utc>>,
    /// Forward-compatible fields this version does not know about.
    pub extra: BTreeMap<String, Value>,
}

impl Issue {
    /// A fresh version-1 record. `now` becomes both creation and update time.
    #[must_use]
    pub fn new(
        id: IssueId,
        alias: Alias,
        title: impl Into<String>,
        created_by: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            alias,
            version: 1,
            kind: Kind::Task,
            status: Status::Open,
            priority: Priority::DEFAULT,
            title: title.into(),
            description: None,
            notes: None,
            assignee: None,
            parent: None,
            labels: BTreeSet::new(),
            deps: BTreeMap::new(),
            created_at: now,
            created_by: created_by.into(),
            updated_at: now,
            closed_at: None,
            due_at: None,
            defer_until: None,
            stamps: BTreeMap::new(),
            extra: BTreeMap::new(),
        }
    }

    /// When `field` was last written. Fields never written since creation
    /// report the creation time.
    #[must_use]
    pub fn stamp(&self, field: Field) -> DateTime<Utc> {
        self.stamps.get(&field).copied().unwrap_or(self.created_at)
    }

    /// Record a persisted mutation of `fields` at `now`.
    ///
    /// Bumps the version, moves `updated_at` forward (never backward), and
    /// refreshes the write stamp of every LWW field in `fields`.
    pub fn touch(&mut self, fields: &[Field], now: DateTime<Utc>) {
        let now = now.max(self.updated_at);
        self.version += 1;
        self.updated_at = now;
        for field in fields {
            if field.strategy() == Strategy::Lww {
                self.stamps.insert(*field, now);
            }
        }
    }

    /// Bring `closed_at` in line with `status`: a closed record carries a
    /// close time (`closed` if it had none), any other status carries none.
    /// Returns whether `closed_at` changed.
    pub fn align_closed_at(&mut self, closed: DateTime<Utc>) -> bool {
        match (self.status == Status::Closed, self.closed_at) {
            (true, None) => {
                self.closed_at = Some(closed);
                true
            }
            (false, Some(_)) => {
                self.closed_at = None;
                true
            }
            _ => false,
        }
    }

    /// Whether this record is the same logical creation as `other`.
    #[must_use]
    pub fn same_origin(&self, other: &Self) -> bool {
        self.id == other.id
            && self.created_at == other.created_at
            && self.created_by == other.created_by
    }

    /// Apply `patch`, returning the fields whose value actually changed.
    ///
    /// Nothing is touched when the patch is a no-op, so callers can tell
    /// "nothing changed" apart from a persisted mutation.
    pub fn apply(&mut self, patch: &IssuePatch, now: DateTime<Utc>) -> Vec<Field> {
        let mut changed = Vec::new();

        macro_rules! set {
            ($field:ident, $variant:expr, $value:expr) => {
                if let Some(value) = $value {
                    if self.$field != *value {
                        self.$field = value.clone();
                        changed.push($variant);
                    }
                }
            };
        }

        set!(title, Field::Title, patch.title.as_ref());
        set!(description, Field::Description, patch.description.as_ref());
        set!(notes, Field::Notes, patch.notes.as_ref());
        set!(kind, Field::Kind, patch.kind.as_ref());
        set!(priority, Field::Priority, patch.priority.as_ref());
        set!(assignee, Field::Assignee, patch.assignee.as_ref());
        set!(parent, Field::Parent, patch.parent.as_ref());
        set!(due_at, Field::DueAt, patch.due_at.as_ref());
        set!(defer_until, Field::DeferUntil, patch.defer_until.as_ref());

        if let Some(status) = patch.status.filter(|s| *s != self.status) {
            let was_closed = self.status == Status::Closed;
            self.status = status;
            changed.push(Field::Status);
            if status == Status::Closed {
                self.closed_at = Some(now);
                changed.push(Field::ClosedAt);
            } else if was_closed {
                self.closed_at = None;
                changed.push(Field::ClosedAt);
            }
        }

        let mut labels = self.labels.clone();
        for label in &patch.remove_labels {
            labels.remove(label);
        }
        labels.extend(patch.add_labels.iter().cloned());
        if labels != self.labels {
            self.labels = labels;
            changed.push(Field::Labels);
        }

        let mut deps = self.deps.clone();
        for target in &patch.remove_deps {
            deps.remove(target);
        }
        for (target, kind) in &patch.add_deps {
            deps.insert(target.clone(), *kind);
        }
        if deps != self.deps {
            self.deps = deps;
            changed.push(Field::Deps);
        }

        let mut extra = self.extra.clone();
        for key in &patch.remove_extra {
            extra.remove(key);
        }
        for (key, value) in &patch.set_extra {
            extra.insert(key.clone(), value.clone());
        }
        if extra != self.extra {
            self.extra = extra;
            changed.push(Field::Extra);
        }

        if !changed.is_empty() {
            self.touch(&changed, now);
        }
        changed
    }
}

/// A typed set of edits to apply to an issue.
///
/// `Option<Option<_>>` fields distinguish "leave alone" (`None`) from
/// "clear" (`Some(None)`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IssuePatch {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub notes: Option<Option<String>>,
    pub kind: Option<Kind>,
    pub status: Option<Status>,
    pub priority: Option<Priority>,
    pub assignee: Option<Option<String>>,
    pub parent: Option<Option<IssueId>>,
    pub due_at: Option<Option<DateTime<Utc>>>,
    pub defer_until: Option<Option<DateTime<Utc>>>,
    pub add_labels: Vec<String>,
    pub remove_labels: Vec<String>,
    pub add_deps: Vec<(IssueId, DepKind)>,
    pub remove_deps: Vec<IssueId>,
    pub set_extra: Vec<(String, Value)>,
    pub remove_extra: Vec<String>,
}

impl IssuePatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::time::parse_timestamp;

    fn ts(s: &str) -> DateTime<Utc> {
        parse_timestamp(s).unwrap()
    }

    fn issue() -> Issue {
        Issue::new(
            IssueId::parse("01J9ZQ4Y7G0000000000000000").unwrap(),
            Alias::parse("tr-abc").unwrap(),
            "Fix login",
            "alice",
            ts("2026-01-01T00:00:00.000000Z"),
        )
    }

    #[test]
    fn display_parse_roundtrips() {
        for value in Kind::ALL {
            assert_eq!(Kind::from_str(&value.to_string()).unwrap(), value);
        }
        for value in Status::ALL {
            assert_eq!(Status::from_str(&value.to_string()).unwrap(), value);
        }
        for value in DepKind::ALL {
            assert_eq!(DepKind::from_str(&value.to_string()).unwrap(), value);
        }
        assert_eq!(Priority::from_str("P1").unwrap().get(), 1);
        assert_eq!(Priority::from_str("3").unwrap().get(), 3);
    }

    #[test]
    fn parse_rejects_unknown_values() {
        assert!(Kind::from_str("goal").is_err());
        assert!(Status::from_str("doing").is_err());
        assert!(DepKind::from_str("duplicates").is_err());
        assert!(Priority::from_str("5").is_err());
        assert!(Priority::new(9).is_err());
    }

    #[test]
    fn enum_json_matches_display() {
        assert_eq!(serde_json::to_string(&Status::InProgress).unwrap(), "\"in_progress\"");
        assert_eq!(serde_json::to_string(&DepKind::ParentChild).unwrap(), "\"parent-child\"");
        assert_eq!(serde_json::to_string(&Kind::Epic).unwrap(), "\"epic\"");
    }

    #[test]
    fn apply_noop_patch_changes_nothing() {
        let mut item = issue();
        let before = item.clone();
        let patch = IssuePatch {
            title: Some("Fix login".into()),
            ..IssuePatch::default()
        };
        assert!(item.apply(&patch, ts("2026-01-02T00:00:00.000000Z")).is_empty());
        assert_eq!(item, before);
    }

    #[test]
    fn apply_bumps_version_and_stamps_changed_fields() {
        let mut item = issue();
        let now = ts("2026-01-02T00:00:00.000000Z");
        let patch = IssuePatch {
            priority: Some(Priority::new(0).unwrap()),
            add_labels: vec!["urgent".into(), "backend".into()],
            ..IssuePatch::default()
        };

        let changed = item.apply(&patch, now);

        assert_eq!(changed, vec![Field::Priority, Field::Labels]);
        assert_eq!(item.version, 2);
        assert_eq!(item.updated_at, now);
        assert_eq!(item.stamp(Field::Priority), now);
        assert_eq!(item.stamp(Field::Title), item.created_at);
        assert_eq!(
            item.labels.iter().collect::<Vec<_>>(),
            vec!["backend", "urgent"]
        );
    }

    #[test]
    fn closing_and_reopening_manage_closed_at() {
        let mut item = issue();
        let closed = ts("2026-01-03T00:00:00.000000Z");
        item.apply(
            &IssuePatch {
                status: Some(Status::Closed),
                ..IssuePatch::default()
            },
            closed,
        );
        assert_eq!(item.closed_at, Some(closed));

        item.apply(
            &IssuePatch {
                status: Some(Status::Open),
                ..IssuePatch::default()
            },
            ts("2026-01-04T00:00:00.000000Z"),
        );
        assert_eq!(item.closed_at, None);
        assert_eq!(item.version, 3);
    }

    #[test]
    fn touch_never_moves_updated_at_backwards() {
        let mut item = issue();
        item.touch(&[Field::Title], ts("2025-12-31T00:00:00.000000Z"));
        assert_eq!(item.updated_at, item.created_at);
        assert_eq!(item.version, 2);
    }
}
