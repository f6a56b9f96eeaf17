//! The per-field table: canonical order, wire names, merge strategy, and the
//! conversion of each field to and from its JSON value.
//!
//! Adding a field to [`Issue`] means adding a variant here, and the
//! exhaustive matches below force a choice of name and merge strategy.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};

use super::id::{Alias, IssueId};
use super::issue::{DepKind, Issue, Kind, Priority, Status};
use super::time::{format_timestamp, parse_timestamp};

/// How the merge engine resolves a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// Set at creation, never changed afterwards.
    Immutable,
    /// Last writer wins on the per-field stamp; the loser goes to the attic.
    Lww,
    /// Collection merged by set union, never a conflict.
    Union,
    /// Monotonic bookkeeping: greatest side wins, then advanced by the merge.
    Max,
    /// Recomputed from how the other fields were resolved.
    Derived,
}

/// Every persisted field of an [`Issue`], in canonical encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Field {
    Id,
    Alias,
    Version,
    Kind,
    Status,
    Priority,
    Title,
    Description,
    Notes,
    Assignee,
    Parent,
    Labels,
    Deps,
    CreatedAt,
    CreatedBy,
    UpdatedAt,
    ClosedAt,
    DueAt,
    DeferUntil,
    Extra,
    Stamps,
}

impl Field {
    pub const ALL: [Self; 21] = [
        Self::Id,
        Self::Alias,
        Self::Version,
        Self::Kind,
        Self::Status,
        Self::Priority,
        Self::Title,
        Self::Description,
        Self::Notes,
        Self::Assignee,
        Self::Parent,
        Self::Labels,
        Self::Deps,
        Self::CreatedAt,
        Self::CreatedBy,
        Self::UpdatedAt,
        Self::ClosedAt,
        Self::DueAt,
        Self::DeferUntil,
        Self::Extra,
        Self::Stamps,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::Alias => "alias",
            Self::Version => "version",
            Self::Kind => "kind",
            Self::Status => "status",
            Self::Priority => "priority",
            Self::Title => "title",
            Self::Description => "description",
            Self::Notes => "notes",
            Self::Assignee => "assignee",
            Self::Parent => "parent",
            Self::Labels => "labels",
            Self::Deps => "deps",
            Self::CreatedAt => "created_at",
            Self::CreatedBy => "created_by",
            Self::UpdatedAt => "updated_at",
            Self::ClosedAt => "closed_at",
            Self::DueAt => "due_at",
            Self::DeferUntil => "defer_until",
            Self::Extra => "extra",
            Self::Stamps => "stamps",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.name() == name)
    }

    /// The merge strategy for this field. Fixed at compile time.
    #[must_use]
    pub const fn strategy(self) -> Strategy {
        match self {
            Self::Id | Self::CreatedAt | Self::CreatedBy => Strategy::Immutable,
            Self::Alias
            | Self::Kind
            | Self::Status
            | Self::Priority
            | Self::Title
            | Self::Description
            | Self::Notes
            | Self::Assignee
            | Self::Parent
            | Self::ClosedAt
            | Self::DueAt
            | Self::DeferUntil
            | Self::Extra => Strategy::Lww,
            Self::Labels | Self::Deps => Strategy::Union,
            Self::Version | Self::UpdatedAt => Strategy::Max,
            Self::Stamps => Strategy::Derived,
        }
    }

    /// Whether an operator may restore an archived value into this field.
    #[must_use]
    pub const fn is_restorable(self) -> bool {
        matches!(self.strategy(), Strategy::Lww | Strategy::Union)
    }

    /// The field's value as JSON, in the form the codec writes it.
    #[must_use]
    pub fn value(self, issue: &Issue) -> Value {
        match self {
            Self::Id => Value::String(issue.id.to_string()),
            Self::Alias => Value::String(issue.alias.to_string()),
            Self::Version => json!(issue.version),
            Self::Kind => Value::String(issue.kind.as_str().to_string()),
            Self::Status => Value::String(issue.status.as_str().to_string()),
            Self::Priority => json!(issue.priority.get()),
            Self::Title => Value::String(issue.title.clone()),
            Self::Description => opt_string(issue.description.as_deref()),
            Self::Notes => opt_string(issue.notes.as_deref()),
            Self::Assignee => opt_string(issue.assignee.as_deref()),
            Self::Parent => opt_string(issue.parent.as_ref().map(IssueId::as_str)),
            Self::Labels => Value::Array(
                issue
                    .labels
                    .iter()
                    .map(|l| Value::String(l.clone()))
                    .collect(),
            ),
            Self::Deps => Value::Array(
                issue
                    .deps
                    .iter()
                    .map(|(target, kind)| json!({"kind": kind.as_str(), "target": target.as_str()}))
                    .collect(),
            ),
            Self::CreatedAt => Value::String(format_timestamp(issue.created_at)),
            Self::CreatedBy => Value::String(issue.created_by.clone()),
            Self::UpdatedAt => Value::String(format_timestamp(issue.updated_at)),
            Self::ClosedAt => opt_timestamp(issue.closed_at),
            Self::DueAt => opt_timestamp(issue.due_at),
            Self::DeferUntil => opt_timestamp(issue.defer_until),
            Self::Extra => Value::Object(
                issue
                    .extra
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<Map<_, _>>(),
            ),
            Self::Stamps => Value::Object(
                issue
                    .stamps
                    .iter()
                    .map(|(f, ts)| (f.name().to_string(), Value::String(format_timestamp(*ts))))
                    .collect::<Map<_, _>>(),
            ),
        }
    }

    /// Copy this field's value from `src` into `dst`.
    pub fn copy(self, src: &Issue, dst: &mut Issue) {
        match self {
            Self::Id => dst.id = src.id.clone(),
            Self::Alias => dst.alias = src.alias.clone(),
            Self::Version => dst.version = src.version,
            Self::Kind => dst.kind = src.kind,
            Self::Status => dst.status = src.status,
            Self::Priority => dst.priority = src.priority,
            Self::Title => dst.title.clone_from(&src.title),
            Self::Description => dst.description.clone_from(&src.description),
            Self::Notes => dst.notes.clone_from(&src.notes),
            Self::Assignee => dst.assignee.clone_from(&src.assignee),
            Self::Parent => dst.parent.clone_from(&src.parent),
            Self::Labels => dst.labels.clone_from(&src.labels),
            Self::Deps => dst.deps.clone_from(&src.deps),
            Self::CreatedAt => dst.created_at = src.created_at,
            Self::CreatedBy => dst.created_by.clone_from(&src.created_by),
            Self::UpdatedAt => dst.updated_at = src.updated_at,
            Self::ClosedAt => dst.closed_at = src.closed_at,
            Self::DueAt => dst.due_at = src.due_at,
            Self::DeferUntil => dst.defer_until = src.defer_until,
            Self::Extra => dst.extra.clone_from(&src.extra),
            Self::Stamps => dst.stamps.clone_from(&src.stamps),
        }
    }

    /// Set this field on `issue` from its JSON value.
    ///
    /// Only the exact shapes [`Field::value`] produces are accepted:
    /// collections must already be sorted and duplicate-free.
    pub fn assign(self, issue: &mut Issue, value: Value) -> Result<(), String> {
        match self {
            Self::Id => issue.id = IssueId::parse(&string(value)?).map_err(|e| e.to_string())?,
            Self::Alias => {
                issue.alias = Alias::parse(&string(value)?).map_err(|e| e.to_string())?;
            }
            Self::Version => {
                issue.version = value
                    .as_u64()
                    .filter(|v| *v >= 1)
                    .ok_or("expected a positive integer")?;
            }
            Self::Kind => issue.kind = exact_enum(value, Kind::ALL, Kind::as_str)?,
            Self::Status => issue.status = exact_enum(value, Status::ALL, Status::as_str)?,
            Self::Priority => {
                let raw = value.as_u64().ok_or("expected an integer")?;
                issue.priority = u8::try_from(raw)
                    .map_err(|_| format!("{raw} is out of range"))
                    .and_then(|v| Priority::new(v).map_err(|e| e.to_string()))?;
            }
            Self::Title => {
                let title = string(value)?;
                if title.trim().is_empty() {
                    return Err("title must not be empty".into());
                }
                issue.title = title;
            }
            Self::Description => issue.description = optional(value, string)?,
            Self::Notes => issue.notes = optional(value, string)?,
            Self::Assignee => issue.assignee = optional(value, string)?,
            Self::Parent => {
                issue.parent = optional(value, |v| {
                    IssueId::parse(&string(v)?).map_err(|e| e.to_string())
                })?;
            }
            Self::Labels => issue.labels = labels(value)?,
            Self::Deps => issue.deps = deps(value)?,
            Self::CreatedAt => issue.created_at = timestamp(value)?,
            Self::CreatedBy => issue.created_by = string(value)?,
            Self::UpdatedAt => issue.updated_at = timestamp(value)?,
            Self::ClosedAt => issue.closed_at = optional(value, timestamp)?,
            Self::DueAt => issue.due_at = optional(value, timestamp)?,
            Self::DeferUntil => issue.defer_until = optional(value, timestamp)?,
            Self::Extra => match value {
                Value::Object(map) => issue.extra = map.into_iter().collect(),
                _ => return Err("expected an object".into()),
            },
            Self::Stamps => issue.stamps = stamps(value)?,
        }
        Ok(())
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn opt_string(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |s| Value::String(s.to_string()))
}

fn opt_timestamp(value: Option<DateTime<Utc>>) -> Value {
    value.map_or(Value::Null, |ts| Value::String(format_timestamp(ts)))
}

fn string(value: Value) -> Result<String, String> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(format!("expected a string, found {other}")),
    }
}

fn timestamp(value: Value) -> Result<DateTime<Utc>, String> {
    let raw = string(value)?;
    parse_timestamp(&raw).ok_or_else(|| format!("'{raw}' is not a normalized UTC timestamp"))
}

fn optional<T>(value: Value, parse: impl FnOnce(Value) -> Result<T, String>) -> Result<Option<T>, String> {
    match value {
        Value::Null => Ok(None),
        other => parse(other).map(Some),
    }
}

fn exact_enum<T: Copy, const N: usize>(
    value: Value,
    all: [T; N],
    as_str: fn(T) -> &'static str,
) -> Result<T, String> {
    let raw = string(value)?;
    all.into_iter()
        .find(|v| as_str(*v) == raw)
        .ok_or_else(|| format!("unknown value '{raw}'"))
}

fn labels(value: Value) -> Result<BTreeSet<String>, String> {
    let Value::Array(items) = value else {
        return Err("expected an array".into());
    };
    let mut out = BTreeSet::new();
    let mut last: Option<String> = None;
    for item in items {
        let label = string(item)?;
        if label.is_empty() || label.trim() != label {
            return Err(format!("label '{label}' is empty or padded"));
        }
        if last.as_ref().is_some_and(|prev| *prev >= label) {
            return Err("labels must be sorted and unique".into());
        }
        last = Some(label.clone());
        out.insert(label);
    }
    Ok(out)
}

fn deps(value: Value) -> Result<BTreeMap<IssueId, DepKind>, String> {
    let Value::Array(items) = value else {
        return Err("expected an array".into());
    };
    let mut out = BTreeMap::new();
    let mut last: Option<IssueId> = None;
    for item in items {
        let Value::Object(mut obj) = item else {
            return Err("dependency must be an object".into());
        };
        if obj.len() != 2 {
            return Err("dependency must have exactly `kind` and `target`".into());
        }
        let kind = exact_enum(
            obj.remove("kind").ok_or("dependency is missing `kind`")?,
            DepKind::ALL,
            DepKind::as_str,
        )?;
        let target = IssueId::parse(&string(
            obj.remove("target").ok_or("dependency is missing `target`")?,
        )?)
        .map_err(|e| e.to_string())?;
        if last.as_ref().is_some_and(|prev| *prev >= target) {
            return Err("dependencies must be sorted by target and unique".into());
        }
        last = Some(target.clone());
        out.insert(target, kind);
    }
    Ok(out)
}

fn stamps(value: Value) -> Result<BTreeMap<Field, DateTime<Utc>>, String> {
    let Value::Object(map) = value else {
        return Err("expected an object".into());
    };
    let mut out = BTreeMap::new();
    for (name, ts) in map {
        let field = Field::from_name(&name)
            .filter(|f| f.strategy() == Strategy::Lww)
            .ok_or_else(|| format!("'{name}' is not a last-writer-wins field"))?;
        out.insert(field, timestamp(ts)?);
    }
    Ok(out)
}
