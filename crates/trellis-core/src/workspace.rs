//! Named workspaces: private record sets that outlive a failed sync.
//!
//! A workspace has the same shape as the mirror (records, alias map, attic)
//! plus a `workspace.toml` naming the mirror commit it was last saved from.
//! It is plain files under the repository, so it can be committed to any
//! branch the user is allowed to push, and merged back later.
//!
//! - [`save`] folds mirror records into a workspace. Conflicts land in the
//!   workspace's attic. Nothing is committed.
//! - [`import`] folds a workspace into the mirror. Conflicts land in the
//!   mirror's attic and the result is committed locally, never pushed.
//! - [`merge_into`] folds one workspace into another.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::attic::Attic;
use crate::codec;
use crate::error::{Error, Result};
use crate::git::Git;
use crate::merge::MergeContext;
use crate::mirror::Mirror;
use crate::model::{Issue, IssueId};
use crate::store::{IssueStore, StoreError, read_optional, write_atomic};
use crate::sync::{MergeCounts, fold_record, read_record_at, record_path, rewrite_aliases};

pub const WORKSPACE_FILE: &str = "workspace.toml";

/// Target of `save` when none is given.
pub const DEFAULT_WORKSPACE: &str = "outbox";

const MAX_NAME_LEN: usize = 64;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A workspace by name (under the workspace root) or by explicit path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkspaceTarget {
    Named(String),
    Path(PathBuf),
}

impl WorkspaceTarget {
    /// Anything containing a path separator or starting with `.` is a path.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        if raw.contains(['/', '\\']) || raw.starts_with('.') {
            Self::Path(PathBuf::from(raw))
        } else {
            Self::Named(raw.to_string())
        }
    }
}

/// Which mirror records [`save`] considers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SaveScope {
    All,
    /// Records that differ from the last synced remote line.
    #[default]
    UpdatedSince,
}

/// Contents of `workspace.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceMeta {
    /// Mirror commit of the last save; the merge base for the next one.
    #[serde(default)]
    pub saved_from: Option<String>,
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
}

/// One workspace on disk.
#[derive(Debug, Clone)]
pub struct Workspace {
    name: String,
    store: IssueStore,
}

impl Workspace {
    /// Locate `target` relative to `root`. Does not create anything.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Invalid`] for a name outside `[a-z0-9_-]{1,64}`.
    pub fn resolve(root: &Path, target: &WorkspaceTarget) -> Result<Self> {
        match target {
            WorkspaceTarget::Named(name) => {
                validate_name(name)?;
                Ok(Self {
                    name: name.clone(),
                    store: IssueStore::new(root.join(name)),
                })
            }
            WorkspaceTarget::Path(path) => Ok(Self {
                name: path
                    .file_name()
                    .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned()),
                store: IssueStore::new(path),
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.store.root()
    }

    #[must_use]
    pub const fn store(&self) -> &IssueStore {
        &self.store
    }

    #[must_use]
    pub fn exists(&self) -> bool {
        self.path().join(WORKSPACE_FILE).is_file() || self.store.issues_dir().is_dir()
    }

    /// # Errors
    ///
    /// Returns [`Error::Config`] if `workspace.toml` is malformed.
    pub fn meta(&self) -> Result<WorkspaceMeta> {
        let path = self.path().join(WORKSPACE_FILE);
        let Some(bytes) = read_optional(&path)? else {
            return Ok(WorkspaceMeta::default());
        };
        let text = String::from_utf8_lossy(&bytes);
        toml::from_str(&text).map_err(|e| Error::Config {
            path,
            reason: e.to_string(),
        })
    }

    fn write_meta(&self, meta: &WorkspaceMeta) -> Result<()> {
        let path = self.path().join(WORKSPACE_FILE);
        let text = toml::to_string(meta).map_err(|e| Error::Config {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        write_atomic(&path, text.as_bytes())?;
        Ok(())
    }

    fn require(&self) -> Result<()> {
        if self.exists() {
            Ok(())
        } else {
            Err(Error::not_found("workspace", self.path().display().to_string()))
        }
    }
}

fn validate_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_');
    if ok {
        Ok(())
    } else {
        Err(Error::invalid(
            "workspace name",
            format!("`{name}` must match [a-z0-9_-]{{1,{MAX_NAME_LEN}}}"),
        ))
    }
}

/// Result of [`save`] or [`import`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferReport {
    pub workspace: String,
    pub path: PathBuf,
    /// Records considered.
    pub records: usize,
    #[serde(flatten)]
    pub counts: MergeCounts,
    /// Mirror commit written by an import.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    /// Whether the source workspace was deleted afterwards.
    pub cleared: bool,
}

/// One line of [`list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkspaceSummary {
    pub name: String,
    pub path: PathBuf,
    pub records: usize,
    pub saved_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// `rev` if it still names a commit in this repository.
fn readable_commit(git: &Git, rev: Option<&str>) -> Result<Option<String>> {
    match rev {
        Some(rev) => git.resolve_commit(rev),
        None => Ok(None),
    }
    .map_err(Error::from)
}

fn base_record(git: &Git, base: Option<&str>, id: &IssueId) -> Result<Option<Issue>> {
    match base {
        Some(rev) => read_record_at(git, rev, &record_path(id)),
        None => Ok(None),
    }
}

fn fold_all(
    records: impl IntoIterator<Item = Issue>,
    target: &IssueStore,
    base: impl Fn(&IssueId) -> Result<Option<Issue>>,
    now: DateTime<Utc>,
) -> Result<MergeCounts> {
    let ctx = MergeContext::at(now);
    let attic = Attic::of(target);
    let mut counts = MergeCounts::default();
    for theirs in records {
        let ours = target.read_issue(&theirs.id)?;
        let base = base(&theirs.id)?;
        if let Some((next, conflicts)) =
            fold_record(base.as_ref(), ours.as_ref(), &theirs, &ctx, &mut counts)
        {
            target.write_issue(&next)?;
            counts.attic_keys.extend(attic.record_all(&conflicts)?);
        }
    }
    Ok(counts)
}

/// Fold mirror records into `workspace`, creating it if needed.
///
/// # Errors
///
/// Returns an error if a record cannot be read or written. Nothing is
/// committed or pushed either way.
#[instrument(skip_all, fields(workspace = workspace.name()))]
pub fn save(
    mirror: &Mirror,
    workspace: &Workspace,
    scope: SaveScope,
    alias_prefix: &str,
    now: DateTime<Utc>,
) -> Result<TransferReport> {
    let git = mirror.git();
    let head = git.resolve_commit("HEAD")?;
    let records = mirror.store().load_all()?;

    let synced = match scope {
        SaveScope::All => None,
        SaveScope::UpdatedSince => git.resolve_commit(&mirror.remote_ref())?,
    };
    let mut in_scope = Vec::new();
    for issue in records.into_values() {
        let keep = match &synced {
            None => true,
            Some(rev) => git.show_file(rev, &record_path(&issue.id))? != Some(codec::encode(&issue)),
        };
        if keep {
            in_scope.push(issue);
        }
    }
    let count = in_scope.len();

    workspace.store().init()?;
    let meta = workspace.meta()?;
    let base = readable_commit(&git, meta.saved_from.as_deref())?;
    let mut counts = fold_all(
        in_scope,
        workspace.store(),
        |id| base_record(&git, base.as_deref(), id),
        now,
    )?;
    counts.realiased = rewrite_aliases(workspace.store(), alias_prefix, now)?;
    workspace.write_meta(&WorkspaceMeta {
        saved_from: head,
        saved_at: Some(now),
    })?;

    info!(records = count, created = counts.created, merged = counts.merged,
        conflicts = counts.conflicts, "workspace saved");
    Ok(TransferReport {
        workspace: workspace.name().to_string(),
        path: workspace.path().to_path_buf(),
        records: count,
        counts,
        commit: None,
        cleared: false,
    })
}

/// Fold `workspace` into the mirror and commit locally. The workspace is
/// deleted afterwards only if `clear` is set and everything succeeded.
///
/// # Errors
///
/// Returns [`Error::NotFound`] if the workspace does not exist, or the
/// first read, write or commit error. On error the workspace is kept.
#[instrument(skip_all, fields(workspace = workspace.name(), clear))]
pub fn import(
    mirror: &Mirror,
    workspace: &Workspace,
    clear: bool,
    alias_prefix: &str,
    now: DateTime<Utc>,
) -> Result<TransferReport> {
    workspace.require()?;
    let git = mirror.git();
    let store = mirror.store();
    let records = workspace.store().load_all()?;
    let count = records.len();

    let meta = workspace.meta()?;
    let base = readable_commit(&git, meta.saved_from.as_deref())?;
    let mut counts = fold_all(
        records.into_values(),
        &store,
        |id| base_record(&git, base.as_deref(), id),
        now,
    )?;
    let absorbed = Attic::of(&store).absorb(&Attic::of(workspace.store()))?;
    counts.realiased = rewrite_aliases(&store, alias_prefix, now)?;

    let message = counts.commit_message(&format!("import {}", workspace.name()));
    let commit = mirror.commit(&message, None)?;
    info!(records = count, absorbed, ?commit, "workspace imported");

    let cleared = if clear {
        delete(workspace)?;
        true
    } else {
        false
    };
    Ok(TransferReport {
        workspace: workspace.name().to_string(),
        path: workspace.path().to_path_buf(),
        records: count,
        counts,
        commit,
        cleared,
    })
}

/// Fold `source` into `target` without a common base; conflicts go to the
/// target's attic along with every entry of the source's attic.
///
/// # Errors
///
/// Returns [`Error::NotFound`] if `source` does not exist.
pub fn merge_into(
    source: &Workspace,
    target: &Workspace,
    alias_prefix: &str,
    now: DateTime<Utc>,
) -> Result<TransferReport> {
    source.require()?;
    target.store().init()?;
    let records = source.store().load_all()?;
    let count = records.len();
    let mut counts = fold_all(records.into_values(), target.store(), |_| Ok(None), now)?;
    Attic::of(target.store()).absorb(&Attic::of(source.store()))?;
    counts.realiased = rewrite_aliases(target.store(), alias_prefix, now)?;

    let mut meta = target.meta()?;
    meta.saved_at = Some(now);
    target.write_meta(&meta)?;
    Ok(TransferReport {
        workspace: target.name().to_string(),
        path: target.path().to_path_buf(),
        records: count,
        counts,
        commit: None,
        cleared: false,
    })
}

/// Every workspace under `root`, sorted by name.
///
/// # Errors
///
/// Returns an error if `root` exists but cannot be listed.
pub fn list(root: &Path) -> Result<Vec<WorkspaceSummary>> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(StoreError::read(root, err).into()),
    };
    let mut names = BTreeSet::new();
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::read(root, e))?;
        if entry.path().is_dir() {
            names.insert(entry.file_name().to_string_lossy().into_owned());
        }
    }

    let mut out = Vec::new();
    for name in names {
        let Ok(workspace) = Workspace::resolve(root, &WorkspaceTarget::Named(name)) else {
            continue;
        };
        if !workspace.exists() {
            continue;
        }
        out.push(WorkspaceSummary {
            records: workspace.store().record_files()?.len(),
            saved_at: workspace.meta()?.saved_at,
            name: workspace.name,
            path: workspace.store.root().to_path_buf(),
        });
    }
    Ok(out)
}

/// Remove a workspace directory.
///
/// # Errors
///
/// Returns [`Error::NotFound`] if it does not exist.
pub fn delete(workspace: &Workspace) -> Result<()> {
    workspace.require()?;
    fs::remove_dir_all(workspace.path()).map_err(|e| StoreError::write(workspace.path(), e))?;
    info!(workspace = workspace.name(), "workspace deleted");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
