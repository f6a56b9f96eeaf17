//! Sync protocol: fetch, merge the remote line into the mirror, commit, push.
//!
//! ```text
//! CheckMirror -> Fetch -> Integrate -> Commit -> Push -> Done
//!                  ^                                |
//!                  +---- non-fast-forward (bounded) +--> ConflictingWrite
//!                                                   +--> EnvironmentRejection
//! ```
//!
//! The loop in [`run_sync`] is written against the [`SharedLine`] trait so
//! the retry policy can be exercised without a remote. [`GitLine`] is the
//! real implementation over a mirror worktree.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::attic::Attic;
use crate::codec;
use crate::config::Context;
use crate::error::{Error, Result};
use crate::git::{Git, PushOutcome};
use crate::merge::{ConflictRemnant, MergeContext, merge};
use crate::mirror::Mirror;
use crate::model::time::now;
use crate::model::{AliasMap, Field, IdManager, Issue, IssueId};
use crate::store::{ATTIC_DIR, ISSUE_EXT, ISSUES_DIR, IssueStore, write_atomic};

// ---------------------------------------------------------------------------
// Shared line abstraction
// ---------------------------------------------------------------------------

/// One end of the sync protocol: a local line that can fetch from, merge
/// with and push to a remote line.
pub trait SharedLine {
    /// Remote name, for error messages.
    fn remote(&self) -> &str;

    /// Fetch the remote line; `None` if there is no remote or no remote line.
    fn fetch(&mut self) -> Result<Option<String>>;

    /// Merge the fetched tip (if any) into the local line and commit.
    fn integrate(&mut self, tip: Option<&str>) -> Result<MergeCounts>;

    /// Publish the local line.
    fn push(&mut self) -> Result<PushStep>;
}

/// Result of one push attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushStep {
    Pushed,
    UpToDate,
    NoRemote,
    NonFastForward(String),
    Rejected(String),
}

impl From<PushOutcome> for PushStep {
    fn from(outcome: PushOutcome) -> Self {
        match outcome {
            PushOutcome::Pushed => Self::Pushed,
            PushOutcome::NonFastForward(detail) => Self::NonFastForward(detail),
            PushOutcome::Rejected(detail) => Self::Rejected(detail),
        }
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// What merging one data set into another did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeCounts {
    /// Records copied in because the target did not have them.
    pub created: usize,
    /// Records taken from the other side because only it had changed.
    pub updated: usize,
    /// Records changed on both sides and merged field by field.
    pub merged: usize,
    /// Records given a fresh alias because theirs was taken.
    pub realiased: usize,
    /// Remnants written to the attic.
    pub conflicts: usize,
    /// Keys of the attic entries written.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attic_keys: Vec<String>,
}

impl MergeCounts {
    pub fn absorb(&mut self, other: Self) {
        self.created += other.created;
        self.updated += other.updated;
        self.merged += other.merged;
        self.realiased += other.realiased;
        self.conflicts += other.conflicts;
        self.attic_keys.extend(other.attic_keys);
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.created == 0
            && self.updated == 0
            && self.merged == 0
            && self.realiased == 0
            && self.conflicts == 0
    }

    /// `trellis: <action> +2 created, ~1 merged, 1 conflict(s)`
    #[must_use]
    pub fn commit_message(&self, action: &str) -> String {
        let mut parts = Vec::new();
        if self.created > 0 {
            parts.push(format!("+{} created", self.created));
        }
        if self.updated > 0 {
            parts.push(format!("~{} updated", self.updated));
        }
        if self.merged > 0 {
            parts.push(format!("~{} merged", self.merged));
        }
        if self.realiased > 0 {
            parts.push(format!("{} realiased", self.realiased));
        }
        if self.conflicts > 0 {
            parts.push(format!("{} conflict(s)", self.conflicts));
        }
        if parts.is_empty() {
            format!("trellis: {action}, no record changes")
        } else {
            format!("trellis: {action} {}", parts.join(", "))
        }
    }
}

/// How a completed sync ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Pushed,
    UpToDate,
    /// No remote is configured; only the local line was updated.
    LocalOnly,
}

/// Result of [`run_sync`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub outcome: SyncOutcome,
    pub attempts: usize,
    #[serde(flatten)]
    pub counts: MergeCounts,
}

/// Drive one sync: up to `1 + max_push_retries` fetch/integrate/push
/// rounds, retrying only on non-fast-forward rejection.
///
/// # Errors
///
/// - [`Error::EnvironmentRejection`] as soon as a push is refused for any
///   reason other than non-fast-forward.
/// - [`Error::ConflictingWrite`] when every attempt was non-fast-forward.
/// - Any fetch, merge or commit error, unchanged.
#[instrument(skip(line), fields(remote = line.remote()))]
pub fn run_sync<L: SharedLine>(line: &mut L, max_push_retries: usize) -> Result<SyncReport> {
    let max_attempts = max_push_retries + 1;
    let mut counts = MergeCounts::default();

    for attempt in 1..=max_attempts {
        info!(attempt, "fetching shared line");
        let tip = line.fetch()?;
        counts.absorb(line.integrate(tip.as_deref())?);

        let outcome = match line.push()? {
            PushStep::Pushed => SyncOutcome::Pushed,
            PushStep::UpToDate => SyncOutcome::UpToDate,
            PushStep::NoRemote => SyncOutcome::LocalOnly,
            PushStep::NonFastForward(detail) => {
                warn!(attempt, max_attempts, %detail, "push rejected as non-fast-forward");
                continue;
            }
            PushStep::Rejected(detail) => {
                warn!(attempt, %detail, "push refused");
                return Err(Error::EnvironmentRejection {
                    remote: line.remote().to_string(),
                    detail,
                });
            }
        };
        info!(attempt, ?outcome, "sync finished");
        return Ok(SyncReport {
            outcome,
            attempts: attempt,
            counts,
        });
    }

    Err(Error::ConflictingWrite {
        remote: line.remote().to_string(),
        attempts: max_attempts,
    })
}

// ---------------------------------------------------------------------------
// Record folding and alias reconciliation
// ---------------------------------------------------------------------------

/// Fold `theirs` into the target's copy `ours`. Returns the record to write,
/// if the target changes, and the remnants of the merge.
pub(crate) fn fold_record(
    base: Option<&Issue>,
    ours: Option<&Issue>,
    theirs: &Issue,
    ctx: &MergeContext,
    counts: &mut MergeCounts,
) -> Option<(Issue, Vec<ConflictRemnant>)> {
    let Some(ours) = ours else {
        counts.created += 1;
        return Some((theirs.clone(), Vec::new()));
    };
    if ours == theirs {
        return None;
    }
    let outcome = merge(base, ours, theirs, ctx);
    if outcome.merged == *ours {
        return None;
    }
    if base == Some(ours) {
        counts.updated += 1;
    } else {
        counts.merged += 1;
    }
    counts.conflicts += outcome.conflicts.len();
    debug!(
        id = %theirs.id,
        version = outcome.merged.version,
        conflicts = outcome.conflicts.len(),
        "record folded"
    );
    Some((outcome.merged, outcome.conflicts))
}

/// Rebuild the alias map from the records themselves.
///
/// Records are visited in `(created_at, id)` order; the first record to
/// claim an alias keeps it and every later claimant gets a fresh alias as a
/// recorded mutation. Returns the map and the ids of re-aliased records.
///
/// # Errors
///
/// Returns [`Error::IdExhausted`] if no fresh alias can be found.
pub fn reconcile_aliases(
    records: &mut BTreeMap<IssueId, Issue>,
    prefix: &str,
    now: DateTime<Utc>,
) -> Result<(AliasMap, Vec<IssueId>)> {
    let mut order: Vec<(DateTime<Utc>, IssueId)> = records
        .values()
        .map(|issue| (issue.created_at, issue.id.clone()))
        .collect();
    order.sort();

    let mut ids = IdManager::new(AliasMap::new(), prefix);
    let mut displaced = Vec::new();
    for (_, id) in order {
        let Some(issue) = records.get(&id) else {
            continue;
        };
        if ids.map().contains_alias(&issue.alias) {
            displaced.push(id);
        } else {
            ids.assign(issue.alias.clone(), id)?;
        }
    }

    for id in &displaced {
        let alias = ids.new_alias()?;
        ids.assign(alias.clone(), id.clone())?;
        if let Some(issue) = records.get_mut(id) {
            info!(%id, old = %issue.alias, new = %alias, "alias collision, record re-aliased");
            issue.alias = alias;
            issue.touch(&[Field::Alias], now);
        }
    }
    Ok((ids.into_map(), displaced))
}

/// Reconcile aliases over everything in `store` and persist the result.
pub(crate) fn rewrite_aliases(
    store: &IssueStore,
    prefix: &str,
    now: DateTime<Utc>,
) -> Result<usize> {
    let mut records = store.load_all()?;
    let (map, realiased) = reconcile_aliases(&mut records, prefix, now)?;
    for id in &realiased {
        if let Some(issue) = records.get(id) {
            store.write_issue(issue)?;
        }
    }
    store.write_aliases(&map)?;
    Ok(realiased.len())
}

// ---------------------------------------------------------------------------
// Git shared line
// ---------------------------------------------------------------------------

/// Decode the record at `path` in commit `rev`, `None` if it is not there.
pub(crate) fn read_record_at(git: &Git, rev: &str, path: &str) -> Result<Option<Issue>> {
    let Some(bytes) = git.show_file(rev, path)? else {
        return Ok(None);
    };
    codec::decode(&bytes)
        .map(Some)
        .map_err(|source| Error::Corrupt {
            path: PathBuf::from(format!("{rev}:{path}")),
            source,
        })
}

/// Repository-relative path of a record file.
pub(crate) fn record_path(id: &IssueId) -> String {
    format!("{ISSUES_DIR}/{id}.{ISSUE_EXT}")
}

/// [`SharedLine`] over the mirror worktree and a git remote.
#[derive(Debug)]
pub struct GitLine {
    mirror: Mirror,
    git: Git,
    store: IssueStore,
    remote: String,
    branch: String,
    alias_prefix: String,
}

impl GitLine {
    /// The mirror must already be healthy.
    #[must_use]
    pub fn new(mirror: &Mirror, ctx: &Context) -> Self {
        Self {
            git: mirror.git(),
            store: mirror.store(),
            mirror: mirror.clone(),
            remote: ctx.remote.clone(),
            branch: ctx.branch.clone(),
            alias_prefix: ctx.alias_prefix.clone(),
        }
    }

    fn head(&self) -> Result<String> {
        self.git
            .resolve_commit("HEAD")?
            .ok_or_else(|| Error::MirrorUnhealthy {
                path: self.mirror.path().to_path_buf(),
                reason: "HEAD does not resolve".into(),
            })
    }

    fn merge_tip(&self, tip: &str, now: DateTime<Utc>, counts: &mut MergeCounts) -> Result<()> {
        let head = self.head()?;
        let base = self.git.merge_base(&head, tip)?;
        let ctx = MergeContext::at(now);
        let attic = Attic::of(&self.store);
        debug!(%head, %tip, ?base, "merging remote line");

        for path in self.git.list_files(tip, ISSUES_DIR)? {
            let Some(theirs) = read_record_at(&self.git, tip, &path)? else {
                continue;
            };
            let ours = self.store.read_issue(&theirs.id)?;
            let base_record = match &base {
                Some(base) => read_record_at(&self.git, base, &path)?,
                None => None,
            };
            if let Some((next, conflicts)) =
                fold_record(base_record.as_ref(), ours.as_ref(), &theirs, &ctx, counts)
            {
                self.store.write_issue(&next)?;
                counts.attic_keys.extend(attic.record_all(&conflicts)?);
            }
        }

        // Attic entries are content-addressed; take any we do not have.
        for path in self.git.list_files(tip, ATTIC_DIR)? {
            let local = self.store.root().join(&path);
            if !local.exists() {
                if let Some(bytes) = self.git.show_file(tip, &path)? {
                    write_atomic(&local, &bytes)?;
                }
            }
        }
        Ok(())
    }
}

impl SharedLine for GitLine {
    fn remote(&self) -> &str {
        &self.remote
    }

    fn fetch(&mut self) -> Result<Option<String>> {
        if !self.git.has_remote(&self.remote)? {
            debug!(remote = %self.remote, "no remote configured");
            return Ok(None);
        }
        let remote_ref = self.mirror.remote_ref();
        if !self.git.fetch_branch(&self.remote, &self.branch)? {
            debug!(remote = %self.remote, branch = %self.branch, "remote has no shared line yet");
            if self.git.resolve_commit(&remote_ref)?.is_some() {
                self.git.run(&["update-ref", "-d", &remote_ref])?;
            }
            return Ok(None);
        }
        Ok(self.git.resolve_commit(&remote_ref)?)
    }

    fn integrate(&mut self, tip: Option<&str>) -> Result<MergeCounts> {
        let now = now();
        let mut counts = MergeCounts::default();
        let head = self.head()?;
        let merging = match tip {
            Some(tip) if tip != head && !self.git.is_ancestor(tip, &head)? => Some(tip),
            _ => None,
        };
        if let Some(tip) = merging {
            self.merge_tip(tip, now, &mut counts)?;
        }
        counts.realiased = rewrite_aliases(&self.store, &self.alias_prefix, now)?;

        let message = counts.commit_message("sync");
        if let Some(commit) = self.mirror.commit(&message, merging)? {
            info!(%commit, created = counts.created, updated = counts.updated,
                merged = counts.merged, conflicts = counts.conflicts, "mirror committed");
        }
        Ok(counts)
    }

    fn push(&mut self) -> Result<PushStep> {
        if !self.git.has_remote(&self.remote)? {
            return Ok(PushStep::NoRemote);
        }
        let local = self.git.resolve_commit(&self.mirror.branch_ref())?;
        let remote_ref = self.mirror.remote_ref();
        if local.is_some() && local == self.git.resolve_commit(&remote_ref)? {
            return Ok(PushStep::UpToDate);
        }
        let step = PushStep::from(self.git.push_branch(&self.remote, &self.branch)?);
        if step == PushStep::Pushed {
            if let Some(local) = local {
                self.git.run(&["update-ref", &remote_ref, &local])?;
            }
        }
        Ok(step)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Where the local line stands against the remote line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    InSync,
    Ahead,
    Behind,
    Diverged,
    NoRemote,
    RemoteLineMissing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub local_tip: Option<String>,
    pub remote_tip: Option<String>,
    pub ahead: usize,
    pub behind: usize,
    /// Uncommitted changes in the mirror.
    pub dirty: bool,
    pub relation: Relation,
}

/// Compare the mirror's commit with the remote line's commit.
///
/// Only history positions are compared; a file-level comparison cannot see
/// pushes that were refused.
///
/// # Errors
///
/// Returns an error if git fails, including a failed fetch.
pub fn status(mirror: &Mirror, ctx: &Context, fetch: bool) -> Result<SyncStatus> {
    let git = mirror.git();
    let local_tip = git.resolve_commit(&mirror.branch_ref())?;
    let dirty = git.is_dirty()?;
    let mut status = SyncStatus {
        local_tip,
        remote_tip: None,
        ahead: 0,
        behind: 0,
        dirty,
        relation: Relation::NoRemote,
    };
    if !git.has_remote(&ctx.remote)? {
        return Ok(status);
    }
    if fetch && !git.fetch_branch(&ctx.remote, &ctx.branch)? {
        status.relation = Relation::RemoteLineMissing;
        return Ok(status);
    }
    status.remote_tip = git.resolve_commit(&mirror.remote_ref())?;
    let (Some(local), Some(remote)) = (&status.local_tip, &status.remote_tip) else {
        status.relation = Relation::RemoteLineMissing;
        return Ok(status);
    };
    let (ahead, behind) = git.ahead_behind(local, remote)?;
    status.ahead = ahead;
    status.behind = behind;
    status.relation = match (ahead, behind) {
        (0, 0) => Relation::InSync,
        (_, 0) => Relation::Ahead,
        (0, _) => Relation::Behind,
        _ => Relation::Diverged,
    };
    Ok(status)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
