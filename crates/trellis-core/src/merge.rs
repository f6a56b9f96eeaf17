//! Three-way record merge.
//!
//! [`merge`] is pure: it takes an optional common ancestor and two sides of
//! one record and returns the merged record plus the values that lost. The
//! per-field behaviour comes from [`Field::strategy`]:
//!
//! | Strategy    | Resolution                                                   |
//! |-------------|--------------------------------------------------------------|
//! | `Immutable` | base value (either side without a base)                      |
//! | `Lww`       | one-sided change wins; otherwise newer field stamp, then the |
//! |             | greater value hash; the loser becomes a [`ConflictRemnant`]  |
//! | `Union`     | one-sided change wins; otherwise set union, never a conflict |
//! | `Max`       | `version = max + 1`, `updated_at = max(.., now)`             |
//! | `Derived`   | stamps follow whichever value won                            |
//!
//! Identical inputs short-circuit without bumping the version, so merging a
//! record with itself, or with an unchanged copy of its base, is a no-op.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::codec::{content_hash, record_value, value_hash};
use crate::model::time::serde_timestamp;
use crate::model::{Field, Issue, IssueId, Strategy};

/// Field name used by remnants that archive a whole record.
pub const WHOLE_RECORD: &str = "record";

/// Inputs a merge needs besides the records themselves.
#[derive(Debug, Clone, Copy)]
pub struct MergeContext {
    /// Merge time: lower bound for the merged `updated_at` and the time
    /// stamped on every remnant.
    pub now: DateTime<Utc>,
}

impl MergeContext {
    #[must_use]
    pub const fn at(now: DateTime<Utc>) -> Self {
        Self { now }
    }
}

/// Which input a value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Ours,
    Theirs,
}

impl Side {
    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            Self::Ours => Self::Theirs,
            Self::Theirs => Self::Ours,
        }
    }

    const fn pick<'a>(self, ours: &'a Issue, theirs: &'a Issue) -> &'a Issue {
        match self {
            Self::Ours => ours,
            Self::Theirs => theirs,
        }
    }
}

/// A value that lost a merge, as archived in the attic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRemnant {
    pub record_id: IssueId,
    /// Field name, or [`WHOLE_RECORD`] for a create conflict.
    pub field: String,
    #[serde(with = "serde_timestamp")]
    pub merged_at: DateTime<Utc>,
    pub lost_value: Value,
    pub won_value: Value,
    pub lost_version: u64,
    pub won_version: u64,
    pub lost_side: Side,
}

impl ConflictRemnant {
    /// The single field this remnant is about; `None` for whole records.
    #[must_use]
    pub fn target(&self) -> Option<Field> {
        Field::from_name(&self.field)
    }

    #[must_use]
    pub fn is_whole_record(&self) -> bool {
        self.field == WHOLE_RECORD
    }
}

/// Result of [`merge`].
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub merged: Issue,
    pub conflicts: Vec<ConflictRemnant>,
}

impl MergeOutcome {
    const fn clean(merged: Issue) -> Self {
        Self {
            merged,
            conflicts: Vec::new(),
        }
    }
}

/// Merge `ours` and `theirs` given their common ancestor `base`.
///
/// Without a base, two records of the same creation (same id, creation time
/// and author) are merged field by field with every differing field treated
/// as changed on both sides. Records of different creations are a create
/// conflict: the earlier-created record wins whole and the other one is
/// archived as a single [`WHOLE_RECORD`] remnant.
#[must_use]
pub fn merge(
    base: Option<&Issue>,
    ours: &Issue,
    theirs: &Issue,
    ctx: &MergeContext,
) -> MergeOutcome {
    if ours == theirs {
        return MergeOutcome::clean(ours.clone());
    }
    if let Some(base) = base {
        if base == ours {
            return MergeOutcome::clean(theirs.clone());
        }
        if base == theirs {
            return MergeOutcome::clean(ours.clone());
        }
    }
    match base {
        None if !ours.same_origin(theirs) => create_conflict(ours, theirs, ctx),
        _ => merge_fields(base, ours, theirs, ctx),
    }
}

fn merge_fields(
    base: Option<&Issue>,
    ours: &Issue,
    theirs: &Issue,
    ctx: &MergeContext,
) -> MergeOutcome {
    let mut merged = ours.clone();
    let mut conflicts = Vec::new();
    // When the statuses differ the close time follows the winning status.
    let status_winner =
        (ours.status != theirs.status).then(|| lww_winner(Field::Status, base, ours, theirs));

    for field in Field::ALL {
        match field.strategy() {
            Strategy::Immutable => field.copy(base.unwrap_or(ours), &mut merged),
            Strategy::Lww => {
                let forced = status_winner.filter(|_| field == Field::ClosedAt);
                let remnant = merge_lww(field, base, ours, theirs, forced, ctx, &mut merged);
                conflicts.extend(remnant);
            }
            Strategy::Union => merge_union(field, base, ours, theirs, &mut merged),
            Strategy::Max => advance(field, ours, theirs, ctx, &mut merged),
            // Stamps are rewritten field by field in `merge_lww`.
            Strategy::Derived => {}
        }
    }

    let status_stamp = merged.stamp(Field::Status);
    if merged.align_closed_at(status_stamp) {
        merged.stamps.insert(Field::ClosedAt, status_stamp);
    }

    debug!(
        id = %merged.id,
        version = merged.version,
        conflicts = conflicts.len(),
        "record merged"
    );
    MergeOutcome { merged, conflicts }
}

fn merge_lww(
    field: Field,
    base: Option<&Issue>,
    ours: &Issue,
    theirs: &Issue,
    forced: Option<Side>,
    ctx: &MergeContext,
    merged: &mut Issue,
) -> Option<ConflictRemnant> {
    let ours_value = field.value(ours);
    let theirs_value = field.value(theirs);
    let ours_changed = lww_changed(field, base, ours);
    let theirs_changed = lww_changed(field, base, theirs);
    let winner = forced.unwrap_or_else(|| lww_winner(field, base, ours, theirs));

    let source = winner.pick(ours, theirs);
    field.copy(source, merged);
    match source.stamps.get(&field) {
        Some(ts) => merged.stamps.insert(field, *ts),
        None => merged.stamps.remove(&field),
    };

    if !(ours_changed && theirs_changed) || ours_value == theirs_value {
        return None;
    }

    let loser = winner.other();
    debug!(id = %ours.id, %field, ?winner, "concurrent edit, loser archived");
    let (won_value, lost_value) = match winner {
        Side::Ours => (ours_value, theirs_value),
        Side::Theirs => (theirs_value, ours_value),
    };
    Some(ConflictRemnant {
        record_id: ours.id.clone(),
        field: field.name().to_string(),
        merged_at: ctx.now,
        lost_value,
        won_value,
        lost_version: loser.pick(ours, theirs).version,
        won_version: source.version,
        lost_side: loser,
    })
}

/// One-sided change wins; otherwise [`newer`] decides.
fn lww_winner(field: Field, base: Option<&Issue>, ours: &Issue, theirs: &Issue) -> Side {
    match (lww_changed(field, base, ours), lww_changed(field, base, theirs)) {
        (true, false) => Side::Ours,
        (false, true) => Side::Theirs,
        _ => newer(field, ours, &field.value(ours), theirs, &field.value(theirs)),
    }
}

fn lww_changed(field: Field, base: Option<&Issue>, side: &Issue) -> bool {
    base.is_none_or(|base| {
        base.stamp(field) != side.stamp(field) || field.value(base) != field.value(side)
    })
}

/// The side whose value is newer: later stamp, then greater value hash.
/// Symmetric in its arguments, so the merged value never depends on which
/// side is "ours".
fn newer(field: Field, ours: &Issue, ours_value: &Value, theirs: &Issue, theirs_value: &Value) -> Side {
    let by_stamp = ours.stamp(field).cmp(&theirs.stamp(field));
    let ordering = match by_stamp {
        Ordering::Equal => value_hash(ours_value).cmp(&value_hash(theirs_value)),
        other => other,
    };
    if ordering == Ordering::Less {
        Side::Theirs
    } else {
        Side::Ours
    }
}

fn merge_union(
    field: Field,
    base: Option<&Issue>,
    ours: &Issue,
    theirs: &Issue,
    merged: &mut Issue,
) {
    let changed = |side: &Issue| base.is_none_or(|base| field.value(base) != field.value(side));
    match (changed(ours), changed(theirs)) {
        (true, false) | (false, false) => field.copy(ours, merged),
        (false, true) => field.copy(theirs, merged),
        (true, true) => match field {
            Field::Labels => {
                merged.labels = ours.labels.union(&theirs.labels).cloned().collect();
            }
            Field::Deps => {
                let mut deps = ours.deps.clone();
                for (target, kind) in &theirs.deps {
                    // Same target with two relations: keep the stronger one
                    // (declaration order, `blocks` first).
                    deps.entry(target.clone())
                        .and_modify(|existing| *existing = (*existing).min(*kind))
                        .or_insert(*kind);
                }
                merged.deps = deps;
            }
            _ => field.copy(ours, merged),
        },
    }
}

fn advance(field: Field, ours: &Issue, theirs: &Issue, ctx: &MergeContext, merged: &mut Issue) {
    match field {
        Field::Version => merged.version = ours.version.max(theirs.version) + 1,
        Field::UpdatedAt => merged.updated_at = ours.updated_at.max(theirs.updated_at).max(ctx.now),
        _ => field.copy(ours, merged),
    }
}

fn create_conflict(ours: &Issue, theirs: &Issue, ctx: &MergeContext) -> MergeOutcome {
    let ours_key = (ours.created_at, content_hash(ours));
    let theirs_key = (theirs.created_at, content_hash(theirs));
    let winner = if ours_key <= theirs_key {
        Side::Ours
    } else {
        Side::Theirs
    };
    let loser = winner.other();
    let (won, lost) = (winner.pick(ours, theirs), loser.pick(ours, theirs));

    debug!(id = %won.id, ?winner, "independent creations, later record archived");
    MergeOutcome {
        merged: won.clone(),
        conflicts: vec![ConflictRemnant {
            record_id: won.id.clone(),
            field: WHOLE_RECORD.to_string(),
            merged_at: ctx.now,
            lost_value: record_value(lost),
            won_value: record_value(won),
            lost_version: lost.version,
            won_version: won.version,
            lost_side: loser,
        }],
    }
}
