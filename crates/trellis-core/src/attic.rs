//! Append-only archive of conflict remnants.
//!
//! ```text
//! attic/
//!   <record id>/
//!     20260102T030405000006Z-priority-1a2b3c4d.json
//!     20260102T030405000006Z-record-9f8e7d6c.json
//! ```
//!
//! An entry is named by merge time, field and the first eight hex digits of
//! the BLAKE3 hash of its canonical JSON, and is addressed by the key
//! `<record id>/<file stem>`. Entries are written once and never modified or
//! deleted; restoring one writes a new record version and a new entry for
//! the value it displaced.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::codec::canonical::canonicalize_json;
use crate::codec::{record_from_value, record_value};
use crate::error::{Error, Result};
use crate::merge::{ConflictRemnant, Side, WHOLE_RECORD};
use crate::model::time::compact_timestamp;
use crate::model::{Field, Issue, IssueId, Strategy};
use crate::store::{IssueStore, StoreError, read_optional, write_atomic};

/// One archived remnant and its key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AtticEntry {
    pub key: String,
    pub remnant: ConflictRemnant,
}

/// Narrows [`Attic::list`].
#[derive(Debug, Clone, Default)]
pub struct AtticFilter {
    pub record: Option<IssueId>,
    pub field: Option<String>,
}

impl AtticFilter {
    fn matches(&self, remnant: &ConflictRemnant) -> bool {
        self.record.as_ref().is_none_or(|id| *id == remnant.record_id)
            && self.field.as_ref().is_none_or(|f| *f == remnant.field)
    }
}

/// What a restore did.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoreOutcome {
    pub issue: Issue,
    /// Fields written by the restore; empty when the record already held
    /// the archived value.
    pub fields: Vec<Field>,
    /// Key of the entry archiving the displaced value.
    pub displaced: Option<String>,
}

/// The attic directory of one data set.
#[derive(Debug, Clone)]
pub struct Attic {
    dir: PathBuf,
}

impl Attic {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn of(store: &IssueStore) -> Self {
        Self::new(store.attic_dir())
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Archive one remnant, returning its key. Recording the same remnant
    /// twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be written.
    pub fn record(&self, remnant: &ConflictRemnant) -> Result<String> {
        let text = entry_text(remnant)?;
        let hash = blake3::hash(text.as_bytes()).to_hex();
        let stem = format!(
            "{}-{}-{}",
            compact_timestamp(remnant.merged_at),
            remnant.field,
            &hash.as_str()[..8]
        );
        let key = format!("{}/{stem}", remnant.record_id);
        let path = self.path_for(&key);
        if read_optional(&path)?.is_none() {
            write_atomic(&path, text.as_bytes())?;
            debug!(%key, "attic entry written");
        }
        Ok(key)
    }

    /// Archive every remnant in order.
    ///
    /// # Errors
    ///
    /// Stops at the first entry that cannot be written.
    pub fn record_all(&self, remnants: &[ConflictRemnant]) -> Result<Vec<String>> {
        remnants.iter().map(|r| self.record(r)).collect()
    }

    /// Entries matching `filter`, sorted by key (record, then time).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Integrity`] if an entry file is not a remnant.
    pub fn list(&self, filter: &AtticFilter) -> Result<Vec<AtticEntry>> {
        let mut entries = Vec::new();
        for record_dir in sorted_dir(&self.dir)? {
            if let Some(id) = &filter.record {
                if record_dir.file_name().is_none_or(|n| n != id.as_str()) {
                    continue;
                }
            }
            for file in sorted_dir(&record_dir)? {
                if file.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let entry = self.read_entry(&file)?;
                if filter.matches(&entry.remnant) {
                    entries.push(entry);
                }
            }
        }
        Ok(entries)
    }

    /// Look up one entry by key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown key.
    pub fn get(&self, key: &str) -> Result<AtticEntry> {
        let valid = key
            .split_once('/')
            .is_some_and(|(id, stem)| IssueId::parse(id).is_ok() && !stem.is_empty() && !stem.contains(['/', '\\']));
        let path = self.path_for(key);
        if !valid || !path.is_file() {
            return Err(Error::not_found("attic entry", key));
        }
        self.read_entry(&path)
    }

    /// Copy every entry of `other` not already present here.
    ///
    /// # Errors
    ///
    /// Returns an error if an entry cannot be read or written.
    pub fn absorb(&self, other: &Self) -> Result<usize> {
        let mut copied = 0;
        for entry in other.list(&AtticFilter::default())? {
            let path = self.path_for(&entry.key);
            if read_optional(&path)?.is_none() {
                write_atomic(&path, entry_text(&entry.remnant)?.as_bytes())?;
                copied += 1;
            }
        }
        Ok(copied)
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    fn read_entry(&self, path: &Path) -> Result<AtticEntry> {
        let bytes = fs::read(path).map_err(|e| StoreError::read(path, e))?;
        let remnant: ConflictRemnant = serde_json::from_slice(&bytes).map_err(|e| Error::Integrity {
            count: 1,
            summary: format!("attic entry {}: {e}", path.display()),
        })?;
        let rel = path.strip_prefix(&self.dir).unwrap_or(path).with_extension("");
        let key = rel.to_string_lossy().replace('\\', "/");
        Ok(AtticEntry { key, remnant })
    }
}

/// Restore the archived value of entry `key` into its record.
///
/// A single-field entry writes its lost value back into that field. A
/// whole-record entry writes back every last-writer-wins field except the
/// alias, which stays owned by the alias map. Either way the record gets
/// exactly one new version and the displaced value gets exactly one new
/// attic entry. Restoring a value the record already holds changes nothing.
///
/// # Errors
///
/// Returns [`Error::NotFound`] for an unknown key or a record that no longer
/// exists, and [`Error::Invalid`] for a field that cannot be restored.
pub fn restore(
    store: &IssueStore,
    attic: &Attic,
    key: &str,
    now: DateTime<Utc>,
) -> Result<RestoreOutcome> {
    let entry = attic.get(key)?;
    let remnant = &entry.remnant;
    let current = store
        .read_issue(&remnant.record_id)?
        .ok_or_else(|| Error::not_found("issue", remnant.record_id.as_str()))?;

    let mut restored = current.clone();
    let mut fields = if remnant.is_whole_record() {
        let archived = record_from_value(&remnant.lost_value)?;
        let fields: Vec<Field> = Field::ALL
            .into_iter()
            .filter(|f| f.strategy() == Strategy::Lww && *f != Field::Alias)
            .filter(|f| f.value(&archived) != f.value(&current))
            .collect();
        for field in &fields {
            field.copy(&archived, &mut restored);
        }
        fields
    } else {
        let field = remnant
            .target()
            .filter(|f| f.is_restorable() && *f != Field::Alias)
            .ok_or_else(|| Error::invalid("field", format!("`{}` cannot be restored", remnant.field)))?;
        if field.value(&current) == remnant.lost_value {
            Vec::new()
        } else {
            field
                .assign(&mut restored, remnant.lost_value.clone())
                .map_err(|reason| Error::invalid("attic value", reason))?;
            vec![field]
        }
    };

    if fields.contains(&Field::Status)
        && restored.align_closed_at(now)
        && !fields.contains(&Field::ClosedAt)
    {
        fields.push(Field::ClosedAt);
    }

    if fields.is_empty() {
        info!(%key, "attic value already current, nothing restored");
        return Ok(RestoreOutcome {
            issue: current,
            fields,
            displaced: None,
        });
    }

    restored.touch(&fields, now);
    let (field_name, lost_value, won_value) = if remnant.is_whole_record() {
        (
            WHOLE_RECORD.to_string(),
            record_value(&current),
            record_value(&restored),
        )
    } else {
        let field = fields[0];
        (
            field.name().to_string(),
            field.value(&current),
            field.value(&restored),
        )
    };
    let displaced = ConflictRemnant {
        record_id: current.id.clone(),
        field: field_name,
        merged_at: now,
        lost_value,
        won_value,
        lost_version: current.version,
        won_version: restored.version,
        lost_side: Side::Ours,
    };

    store.write_issue(&restored)?;
    let displaced_key = attic.record(&displaced)?;
    info!(%key, id = %restored.id, version = restored.version, "attic entry restored");
    Ok(RestoreOutcome {
        issue: restored,
        fields,
        displaced: Some(displaced_key),
    })
}

fn entry_text(remnant: &ConflictRemnant) -> Result<String> {
    let value = serde_json::to_value(remnant)
        .map_err(|e| Error::invalid("attic entry", e.to_string()))?;
    Ok(format!("{}\n", canonicalize_json(&value)))
}

fn sorted_dir(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(StoreError::read(dir, err).into()),
    };
    let mut paths = entries
        .map(|e| e.map(|e| e.path()))
        .collect::<io::Result<Vec<_>>>()
        .map_err(|e| StoreError::read(dir, e))?;
    paths.sort();
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::{MergeContext, merge};
    use crate::model::time::parse_timestamp;
    use crate::model::{Alias, IssuePatch, Priority, Status};
    use serde_json::json;
    use tempfile::TempDir;

    fn ts(s: &str) -> DateTime<Utc> {
        parse_timestamp(s).unwrap()
    }

    fn setup() -> (TempDir, IssueStore, Attic) {
        let tmp = TempDir::new().expect("tempdir");
        let store = IssueStore::new(tmp.path().join("data"));
        store.init().unwrap();
        let attic = Attic::of(&store);
        (tmp, store, attic)
    }

    fn base() -> Issue {
        Issue::new(
            IssueId::parse("01J9ZQ4Y7G0000000000000000").unwrap(),
            Alias::parse("tr-abc").unwrap(),
            "Fix login",
            "alice",
            ts("2026-01-01T00:00:00.000000Z"),
        )
    }

    fn with_priority(from: &Issue, p: u8, at: &str) -> Issue {
        let mut issue = from.clone();
        issue.apply(
            &IssuePatch {
                priority: Some(Priority::new(p).unwrap()),
                ..IssuePatch::default()
            },
            ts(at),
        );
        issue
    }

    /// Merge two concurrent priority edits, persist the result, return the
    /// key of the single remnant.
    fn conflicted(store: &IssueStore, attic: &Attic) -> String {
        let b = base();
        let ours = with_priority(&b, 1, "2026-01-02T00:00:00.000000Z");
        let theirs = with_priority(&b, 2, "2026-01-03T00:00:00.000000Z");
        let out = merge(
            Some(&b),
            &ours,
            &theirs,
            &MergeContext::at(ts("2026-01-04T00:00:00.000000Z")),
        );
        store.write_issue(&out.merged).unwrap();
        let keys = attic.record_all(&out.conflicts).unwrap();
        assert_eq!(keys.len(), 1);
        keys[0].clone()
    }

    #[test]
    fn record_is_idempotent_and_addressable() {
        let (_tmp, store, attic) = setup();
        let key = conflicted(&store, &attic);
        assert!(key.starts_with("01J9ZQ4Y7G0000000000000000/20260104T000000000000Z-priority-"));

        let entry = attic.get(&key).unwrap();
        assert_eq!(entry.remnant.lost_value, json!(1));
        assert_eq!(attic.record(&entry.remnant).unwrap(), key);
        assert_eq!(attic.list(&AtticFilter::default()).unwrap().len(), 1);
    }

    #[test]
    fn list_filters_by_record_and_field() {
        let (_tmp, store, attic) = setup();
        conflicted(&store, &attic);

        let by_field = AtticFilter {
            field: Some("title".into()),
            ..AtticFilter::default()
        };
        assert!(attic.list(&by_field).unwrap().is_empty());

        let by_record = AtticFilter {
            record: Some(base().id),
            field: Some("priority".into()),
        };
        assert_eq!(attic.list(&by_record).unwrap().len(), 1);

        let other = AtticFilter {
            record: Some(IssueId::parse("01J9ZQ4Y7G0000000000000001").unwrap()),
            ..AtticFilter::default()
        };
        assert!(attic.list(&other).unwrap().is_empty());
    }

    #[test]
    fn get_rejects_unknown_or_escaping_keys() {
        let (_tmp, _store, attic) = setup();
        assert!(matches!(attic.get("nope"), Err(Error::NotFound { .. })));
        assert!(matches!(
            attic.get("01J9ZQ4Y7G0000000000000000/../../FORMAT"),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn restore_creates_one_mutation_and_one_entry() {
        let (_tmp, store, attic) = setup();
        let key = conflicted(&store, &attic);
        let before = store.read_issue(&base().id).unwrap().unwrap();

        let now = ts("2026-01-05T00:00:00.000000Z");
        let out = restore(&store, &attic, &key, now).unwrap();

        assert_eq!(out.fields, vec![Field::Priority]);
        assert_eq!(out.issue.priority.get(), 1);
        assert_eq!(out.issue.version, before.version + 1);
        assert_eq!(out.issue.stamp(Field::Priority), now);
        assert_eq!(store.read_issue(&base().id).unwrap(), Some(out.issue.clone()));

        let entries = attic.list(&AtticFilter::default()).unwrap();
        assert_eq!(entries.len(), 2);
        let displaced = attic.get(out.displaced.as_deref().unwrap()).unwrap();
        assert_eq!(displaced.remnant.lost_value, json!(2));
        assert_eq!(displaced.remnant.won_value, json!(1));

        // The original entry is untouched.
        assert_eq!(attic.get(&key).unwrap().remnant.lost_value, json!(1));
    }

    #[test]
    fn restoring_a_status_keeps_the_close_time_in_step() {
        let (_tmp, store, attic) = setup();
        let b = base();
        let set_status = |status, at| {
            let mut issue = b.clone();
            issue.apply(
                &IssuePatch {
                    status: Some(status),
                    ..IssuePatch::default()
                },
                ts(at),
            );
            issue
        };
        let closed = set_status(Status::Closed, "2026-01-02T00:00:00.000000Z");
        let blocked = set_status(Status::Blocked, "2026-01-03T00:00:00.000000Z");
        let out = merge(
            Some(&b),
            &closed,
            &blocked,
            &MergeContext::at(ts("2026-01-04T00:00:00.000000Z")),
        );
        assert_eq!(out.merged.closed_at, None);
        store.write_issue(&out.merged).unwrap();
        let key = attic.record_all(&out.conflicts).unwrap().remove(0);

        let now = ts("2026-01-05T00:00:00.000000Z");
        let reclosed = restore(&store, &attic, &key, now).unwrap();
        assert_eq!(reclosed.fields, vec![Field::Status, Field::ClosedAt]);
        assert_eq!(reclosed.issue.status, Status::Closed);
        assert_eq!(reclosed.issue.closed_at, Some(now));
        assert_eq!(reclosed.issue.stamp(Field::ClosedAt), now);

        // Putting the displaced status back reopens and clears it again.
        let displaced = reclosed.displaced.unwrap();
        assert_eq!(attic.get(&displaced).unwrap().remnant.lost_value, json!("blocked"));
        let reopened = restore(&store, &attic, &displaced, ts("2026-01-06T00:00:00.000000Z")).unwrap();
        assert_eq!(reopened.issue.status, Status::Blocked);
        assert_eq!(reopened.issue.closed_at, None);
        assert_eq!(store.read_issue(&b.id).unwrap(), Some(reopened.issue));
    }

    #[test]
    fn restoring_a_current_value_changes_nothing() {
        let (_tmp, store, attic) = setup();
        let key = conflicted(&store, &attic);
        let now = ts("2026-01-05T00:00:00.000000Z");
        restore(&store, &attic, &key, now).unwrap();

        let again = restore(&store, &attic, &key, ts("2026-01-06T00:00:00.000000Z")).unwrap();
        assert!(again.fields.is_empty());
        assert!(again.displaced.is_none());
        assert_eq!(attic.list(&AtticFilter::default()).unwrap().len(), 2);
    }

    #[test]
    fn whole_record_restore_keeps_alias() {
        let (_tmp, store, attic) = setup();
        let winner = base();
        let mut loser = Issue::new(
            winner.id.clone(),
            Alias::parse("tr-zzz").unwrap(),
            "Independent copy",
            "bob",
            ts("2026-01-02T00:00:00.000000Z"),
        );
        loser.priority = Priority::new(0).unwrap();
        let out = merge(
            None,
            &winner,
            &loser,
            &MergeContext::at(ts("2026-01-03T00:00:00.000000Z")),
        );
        store.write_issue(&out.merged).unwrap();
        let key = attic.record(&out.conflicts[0]).unwrap();

        let restored = restore(&store, &attic, &key, ts("2026-01-04T00:00:00.000000Z")).unwrap();
        assert_eq!(restored.issue.title, "Independent copy");
        assert_eq!(restored.issue.priority.get(), 0);
        assert_eq!(restored.issue.alias, winner.alias);
        assert_eq!(restored.issue.created_by, "alice");
        assert!(restored.fields.contains(&Field::Title));
        let displaced = attic.get(restored.displaced.as_deref().unwrap()).unwrap();
        assert!(displaced.remnant.is_whole_record());
    }

    #[test]
    fn absorb_copies_missing_entries_only() {
        let (_tmp, store, attic) = setup();
        conflicted(&store, &attic);
        let other_dir = TempDir::new().unwrap();
        let other = Attic::new(other_dir.path().join("attic"));

        assert_eq!(other.absorb(&attic).unwrap(), 1);
        assert_eq!(other.absorb(&attic).unwrap(), 0);
        assert_eq!(other.list(&AtticFilter::default()).unwrap(), attic.list(&AtticFilter::default()).unwrap());
    }
}
