#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;
use serde_json::Value;
use trellis_core::model::{Alias, DepKind, Issue, IssueId, IssuePatch, Kind, Priority, Status};

pub const ORIGIN_ID: &str = "01JB0000000000000000000001";

/// Ids a generated record may point at.
pub const TARGETS: [&str; 3] = [
    "01JB0000000000000000000002",
    "01JB0000000000000000000003",
    "01JB0000000000000000000004",
];

pub fn created_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
}

pub fn origin() -> Issue {
    Issue::new(
        IssueId::parse(ORIGIN_ID).unwrap(),
        Alias::parse("tr-a1").unwrap(),
        "Shared origin",
        "alice",
        created_at(),
    )
}

/// Microsecond-precision instants after [`created_at`], as records store them.
pub fn arb_instant() -> impl Strategy<Value = DateTime<Utc>> + Clone {
    (1i64..1_000_000, 0i64..1_000_000)
        .prop_map(|(secs, micros)| created_at() + Duration::seconds(secs) + Duration::microseconds(micros))
}

pub fn arb_title() -> impl Strategy<Value = String> + Clone {
    "[A-Za-z][A-Za-z0-9 \n\"\\\\:é]{0,24}"
}

pub fn arb_text() -> impl Strategy<Value = Option<String>> + Clone {
    prop::option::of("\\PC{0,40}")
}

pub fn arb_label() -> impl Strategy<Value = String> + Clone {
    "[a-z][a-z0-9-]{0,6}"
}

pub fn arb_kind() -> impl Strategy<Value = Kind> + Clone {
    prop::sample::select(Kind::ALL.to_vec())
}

pub fn arb_status() -> impl Strategy<Value = Status> + Clone {
    prop::sample::select(Status::ALL.to_vec())
}

pub fn arb_priority() -> impl Strategy<Value = Priority> + Clone {
    (0u8..=Priority::MAX).prop_map(|p| Priority::new(p).unwrap())
}

pub fn arb_target() -> impl Strategy<Value = IssueId> + Clone {
    prop::sample::select(TARGETS.to_vec()).prop_map(|raw| IssueId::parse(raw).unwrap())
}

pub fn arb_dep() -> impl Strategy<Value = (IssueId, DepKind)> + Clone {
    (arb_target(), prop::sample::select(DepKind::ALL.to_vec()))
}

pub fn arb_extra_value() -> impl Strategy<Value = Value> + Clone {
    prop_oneof![
        any::<i64>().prop_map(Value::from),
        any::<bool>().prop_map(Value::from),
        "[a-z ]{0,10}".prop_map(Value::from),
    ]
}

/// One edit session: a handful of optional field changes.
pub fn arb_patch() -> impl Strategy<Value = IssuePatch> + Clone {
    (
        (
            prop::option::of(arb_title()),
            prop::option::of(arb_text()),
            prop::option::of(arb_kind()),
            prop::option::of(arb_status()),
            prop::option::of(arb_priority()),
            prop::option::of(prop::option::of("[a-z]{1,8}")),
        ),
        (
            prop::collection::vec(arb_label(), 0..3),
            prop::collection::vec(arb_label(), 0..2),
            prop::collection::vec(arb_dep(), 0..2),
            prop::collection::vec(arb_target(), 0..2),
            prop::collection::vec(("[a-z]{1,5}", arb_extra_value()), 0..2),
            prop::option::of(prop::option::of(arb_instant())),
        ),
    )
        .prop_map(
            |(
                (title, description, kind, status, priority, assignee),
                (add_labels, remove_labels, add_deps, remove_deps, set_extra, due_at),
            )| IssuePatch {
                title,
                description,
                kind,
                status,
                priority,
                assignee,
                due_at,
                add_labels,
                remove_labels,
                add_deps,
                remove_deps,
                set_extra,
                ..IssuePatch::default()
            },
        )
}

/// A sequence of timed edits.
pub fn arb_history() -> impl Strategy<Value = Vec<(IssuePatch, DateTime<Utc>)>> + Clone {
    prop::collection::vec((arb_patch(), arb_instant()), 0..4)
}

pub fn replay(from: &Issue, history: &[(IssuePatch, DateTime<Utc>)]) -> Issue {
    let mut issue = from.clone();
    for (patch, at) in history {
        issue.apply(patch, *at);
    }
    issue
}

/// An arbitrary valid record.
pub fn arb_issue() -> impl Strategy<Value = Issue> + Clone {
    arb_history().prop_map(|history| replay(&origin(), &history))
}

/// A common ancestor and two independently edited descendants.
pub fn arb_fork() -> impl Strategy<Value = (Issue, Issue, Issue)> + Clone {
    (arb_history(), arb_history(), arb_history()).prop_map(|(shared, ours, theirs)| {
        let base = replay(&origin(), &shared);
        let a = replay(&base, &ours);
        let b = replay(&base, &theirs);
        (base, a, b)
    })
}

/// A common ancestor and three independently edited descendants.
pub fn arb_three_way() -> impl Strategy<Value = (Issue, Issue, Issue, Issue)> + Clone {
    (arb_history(), arb_history(), arb_history(), arb_history()).prop_map(
        |(shared, first, second, third)| {
            let base = replay(&origin(), &shared);
            let a = replay(&base, &first);
            let b = replay(&base, &second);
            let c = replay(&base, &third);
            (base, a, b, c)
        },
    )
}
