//! Integrity check and explicit repair of one data set.
//!
//! [`check`] never writes. [`repair`] fixes what can be fixed without
//! guessing: it rebuilds the alias map from the records, moves misnamed
//! record files to their proper name, drops references to records that do
//! not exist (as recorded mutations) and restores a missing format marker.
//! Undecodable files and duplicate ids are reported and left alone.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::codec;
use crate::error::{Error, Result};
use crate::model::{Alias, AliasMap, Issue, IssueId, IssuePatch};
use crate::store::{FORMAT_FILE, FORMAT_LINE, ISSUE_EXT, IssueStore, StoreError, write_atomic};
use crate::sync::reconcile_aliases;

/// One integrity problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Problem {
    /// A record file that is not a canonical record.
    Undecodable { file: String, reason: String },
    /// A record stored under a file name other than its id.
    MisnamedFile { file: String, id: IssueId },
    /// A misnamed file holding a record whose proper file also exists.
    DuplicateId { file: String, id: IssueId },
    /// A record with no alias map entry.
    MissingMapping { id: IssueId, alias: Alias },
    /// An alias map entry for a record that does not exist.
    DanglingMapping { alias: Alias, id: IssueId },
    /// The alias map and the record disagree.
    AliasMismatch { id: IssueId, record: Alias, mapped: Alias },
    /// More than one record carries the same alias.
    DuplicateAlias { alias: Alias, ids: Vec<IssueId> },
    OrphanDependency { id: IssueId, target: IssueId },
    OrphanParent { id: IssueId, parent: IssueId },
    /// The format marker is missing or names another format.
    FormatMismatch { found: Option<String> },
    UnreadableAliasMap { reason: String },
}

impl Problem {
    /// Whether [`repair`] fixes this kind of problem.
    #[must_use]
    pub const fn is_repairable(&self) -> bool {
        match self {
            Self::Undecodable { .. } | Self::DuplicateId { .. } => false,
            Self::FormatMismatch { found } => found.is_none(),
            _ => true,
        }
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undecodable { file, reason } => write!(f, "{file}: undecodable: {reason}"),
            Self::MisnamedFile { file, id } => write!(f, "{file}: holds record {id}"),
            Self::DuplicateId { file, id } => {
                write!(f, "{file}: duplicate of record {id}, which has its own file")
            }
            Self::MissingMapping { id, alias } => write!(f, "{id}: alias {alias} is not in the alias map"),
            Self::DanglingMapping { alias, id } => write!(f, "alias {alias} names missing record {id}"),
            Self::AliasMismatch { id, record, mapped } => {
                write!(f, "{id}: record says alias {record}, map says {mapped}")
            }
            Self::DuplicateAlias { alias, ids } => {
                let ids: Vec<&str> = ids.iter().map(IssueId::as_str).collect();
                write!(f, "alias {alias} is carried by {}", ids.join(", "))
            }
            Self::OrphanDependency { id, target } => write!(f, "{id}: depends on missing record {target}"),
            Self::OrphanParent { id, parent } => write!(f, "{id}: parent {parent} does not exist"),
            Self::FormatMismatch { found: None } => write!(f, "{FORMAT_FILE} marker is missing"),
            Self::FormatMismatch { found: Some(found) } => {
                write!(f, "{FORMAT_FILE} says `{found}`, expected `{FORMAT_LINE}`")
            }
            Self::UnreadableAliasMap { reason } => write!(f, "alias map is unreadable: {reason}"),
        }
    }
}

/// Result of [`check`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    /// Records that decoded cleanly.
    pub records: usize,
    pub problems: Vec<Problem>,
}

impl IntegrityReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }

    /// The report as an error, if it has problems.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Integrity`] listing every problem.
    pub fn into_result(self) -> Result<Self> {
        if self.is_clean() {
            return Ok(self);
        }
        let summary = self
            .problems
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Err(Error::Integrity {
            count: self.problems.len(),
            summary,
        })
    }
}

/// Result of [`repair`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    pub fixed: Vec<Problem>,
    pub remaining: Vec<Problem>,
}

struct Scan {
    records: BTreeMap<IssueId, Issue>,
    misnamed: Vec<(String, Issue)>,
    /// Stems of undecodable files; these ids may well exist.
    unreadable: BTreeSet<String>,
    map: Option<AliasMap>,
    problems: Vec<Problem>,
}

impl Scan {
    fn known(&self, id: &IssueId) -> bool {
        self.records.contains_key(id) || self.unreadable.contains(id.as_str())
    }
}

fn scan(store: &IssueStore) -> Result<Scan> {
    let mut problems = Vec::new();

    let found = store.format()?;
    if found.as_deref() != Some(FORMAT_LINE) {
        problems.push(Problem::FormatMismatch { found });
    }

    let files = store.record_files()?;
    let stems: BTreeSet<&str> = files.iter().map(|f| f.stem.as_str()).collect();
    let mut records = BTreeMap::new();
    let mut misnamed = Vec::new();
    let mut unreadable = BTreeSet::new();
    for file in &files {
        let name = format!("{}.{}", file.stem, ISSUE_EXT);
        match codec::decode(&file.bytes) {
            Err(err) => {
                unreadable.insert(file.stem.clone());
                problems.push(Problem::Undecodable {
                    file: name,
                    reason: err.to_string(),
                });
            }
            Ok(issue) if issue.id.as_str() == file.stem => {
                records.insert(issue.id.clone(), issue);
            }
            Ok(issue) if stems.contains(issue.id.as_str()) => {
                problems.push(Problem::DuplicateId { file: name, id: issue.id });
            }
            Ok(issue) => {
                problems.push(Problem::MisnamedFile {
                    file: name.clone(),
                    id: issue.id.clone(),
                });
                misnamed.push((file.stem.clone(), issue));
            }
        }
    }
    // A misnamed record still exists; count it for reference checks.
    for (_, issue) in &misnamed {
        records.entry(issue.id.clone()).or_insert_with(|| issue.clone());
    }

    let mut by_alias: BTreeMap<&Alias, Vec<IssueId>> = BTreeMap::new();
    for issue in records.values() {
        by_alias.entry(&issue.alias).or_default().push(issue.id.clone());
    }
    for (alias, ids) in by_alias {
        if ids.len() > 1 {
            problems.push(Problem::DuplicateAlias {
                alias: alias.clone(),
                ids,
            });
        }
    }

    let map = match store.read_aliases() {
        Ok(map) => Some(map),
        Err(Error::Corrupt { source, .. }) => {
            problems.push(Problem::UnreadableAliasMap {
                reason: source.to_string(),
            });
            None
        }
        Err(err) => return Err(err),
    };

    let mut scan = Scan {
        records,
        misnamed,
        unreadable,
        map,
        problems,
    };

    if let Some(map) = &scan.map {
        for issue in scan.records.values() {
            match map.alias_for(&issue.id) {
                None => scan.problems.push(Problem::MissingMapping {
                    id: issue.id.clone(),
                    alias: issue.alias.clone(),
                }),
                Some(mapped) if *mapped != issue.alias => scan.problems.push(Problem::AliasMismatch {
                    id: issue.id.clone(),
                    record: issue.alias.clone(),
                    mapped: mapped.clone(),
                }),
                Some(_) => {}
            }
        }
        for (alias, id) in map.iter() {
            if !scan.known(id) {
                scan.problems.push(Problem::DanglingMapping {
                    alias: alias.clone(),
                    id: id.clone(),
                });
            }
        }
    }

    let mut orphans = Vec::new();
    for issue in scan.records.values() {
        for target in issue.deps.keys().filter(|t| !scan.known(t)) {
            orphans.push(Problem::OrphanDependency {
                id: issue.id.clone(),
                target: target.clone(),
            });
        }
        if let Some(parent) = issue.parent.as_ref().filter(|p| !scan.known(p)) {
            orphans.push(Problem::OrphanParent {
                id: issue.id.clone(),
                parent: parent.clone(),
            });
        }
    }
    scan.problems.extend(orphans);
    Ok(scan)
}

/// Inspect `store` without changing it.
///
/// # Errors
///
/// Returns an error only if the store cannot be read at all; problems with
/// its contents are reported in the [`IntegrityReport`].
pub fn check(store: &IssueStore) -> Result<IntegrityReport> {
    let scan = scan(store)?;
    Ok(IntegrityReport {
        records: scan.records.len(),
        problems: scan.problems,
    })
}

/// Fix every repairable problem in `store`.
///
/// # Errors
///
/// Returns an error if a record or the alias map cannot be written.
pub fn repair(store: &IssueStore, alias_prefix: &str, now: DateTime<Utc>) -> Result<RepairReport> {
    let before = scan(store)?;
    if before.problems.is_empty() {
        return Ok(RepairReport::default());
    }

    if before
        .problems
        .iter()
        .any(|p| matches!(p, Problem::FormatMismatch { found: None }))
    {
        write_atomic(&store.root().join(FORMAT_FILE), format!("{FORMAT_LINE}\n").as_bytes())?;
    }

    let duplicate_files: BTreeSet<&str> = before
        .problems
        .iter()
        .filter_map(|p| match p {
            Problem::DuplicateId { file, .. } => Some(file.as_str()),
            _ => None,
        })
        .collect();
    for (stem, issue) in &before.misnamed {
        if duplicate_files.contains(format!("{stem}.{}", ISSUE_EXT).as_str()) {
            continue;
        }
        store.write_issue(issue)?;
        let stale = store.issues_dir().join(format!("{stem}.{}", ISSUE_EXT));
        std::fs::remove_file(&stale).map_err(|e| StoreError::write(&stale, e))?;
        info!(from = %stem, id = %issue.id, "misnamed record moved");
    }

    let mut records = before.records.clone();
    for issue in records.values_mut() {
        let patch = IssuePatch {
            remove_deps: issue
                .deps
                .keys()
                .filter(|t| !before.known(t))
                .cloned()
                .collect(),
            parent: issue
                .parent
                .as_ref()
                .filter(|p| !before.known(p))
                .map(|_| None),
            ..IssuePatch::default()
        };
        if !patch.is_empty() && !issue.apply(&patch, now).is_empty() {
            info!(id = %issue.id, "orphaned references dropped");
        }
    }

    let (mut map, _) = reconcile_aliases(&mut records, alias_prefix, now)?;
    if let Some(old) = &before.map {
        for (alias, id) in old.iter().filter(|(_, id)| before.unreadable.contains(id.as_str())) {
            if map.insert(alias.clone(), id.clone()).is_err() {
                warn!(%alias, %id, "alias of an undecodable record is taken, dropping its entry");
            }
        }
    }

    for (id, issue) in &records {
        if before.records.get(id) != Some(issue) {
            store.write_issue(issue)?;
        }
    }
    store.write_aliases(&map)?;

    let after = scan(store)?;
    let fixed: Vec<Problem> = before
        .problems
        .into_iter()
        .filter(|p| !after.problems.contains(p))
        .collect();
    info!(fixed = fixed.len(), remaining = after.problems.len(), "integrity repair finished");
    Ok(RepairReport {
        fixed,
        remaining: after.problems,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
