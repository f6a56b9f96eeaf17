//! The operations a front end calls, each one lock-guarded and mirror-checked.
//!
//! Every method that touches shared records takes the clone's advisory lock,
//! makes sure the mirror is healthy (repairing it if not), works inside the
//! mirror, and commits there. Nothing here pushes except [`Project::sync`].

use std::path::PathBuf;

use serde::Serialize;
use tracing::{info, instrument};

use crate::attic::{self, Attic, AtticEntry, AtticFilter, RestoreOutcome};
use crate::codec;
use crate::config::{self, Context, ProjectConfig};
use crate::error::{Error, Result};
use crate::integrity::{self, IntegrityReport, RepairReport};
use crate::lock::MirrorLock;
use crate::merge::WHOLE_RECORD;
use crate::mirror::{Mirror, RepairSource};
use crate::model::time::now;
use crate::model::{Field, IdManager, Issue, IssueId, IssuePatch, Kind, Status};
use crate::store::IssueStore;
use crate::sync::{self, GitLine, SyncReport, SyncStatus};
use crate::workspace::{self, SaveScope, TransferReport, Workspace, WorkspaceSummary, WorkspaceTarget};

/// Result of [`Project::init`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InitReport {
    pub mirror: PathBuf,
    /// Set when the mirror had to be created or rebuilt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rebuilt_from: Option<RepairSource>,
    pub config_written: bool,
}

/// Result of [`Project::update`].
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOutcome {
    pub issue: Issue,
    /// Empty when the patch changed nothing and nothing was written.
    pub changed: Vec<Field>,
}

/// Narrows [`Project::list`].
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub status: Option<Status>,
    pub kind: Option<Kind>,
    pub assignee: Option<String>,
    pub label: Option<String>,
    /// Closed issues are hidden unless asked for or filtered by status.
    pub include_closed: bool,
}

impl ListFilter {
    fn matches(&self, issue: &Issue) -> bool {
        let status_ok = match self.status {
            Some(status) => issue.status == status,
            None => self.include_closed || issue.status != Status::Closed,
        };
        status_ok
            && self.kind.is_none_or(|k| issue.kind == k)
            && self
                .assignee
                .as_ref()
                .is_none_or(|a| issue.assignee.as_ref() == Some(a))
            && self.label.as_ref().is_none_or(|l| issue.labels.contains(l))
    }
}

/// One project, as seen from one clone.
#[derive(Debug, Clone)]
pub struct Project {
    ctx: Context,
}

impl Project {
    #[must_use]
    pub const fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    #[must_use]
    pub const fn context(&self) -> &Context {
        &self.ctx
    }

    #[must_use]
    pub fn mirror(&self) -> Mirror {
        Mirror::new(&self.ctx)
    }

    fn lock(&self) -> Result<MirrorLock> {
        Ok(MirrorLock::acquire(&self.ctx.lock_path(), self.ctx.lock_timeout)?)
    }

    /// Lock, require initialization, and hand back a healthy mirror.
    fn open(&self) -> Result<(MirrorLock, Mirror)> {
        if !self.ctx.state_dir().is_dir() {
            return Err(Error::NotInitialized(self.ctx.repo_root.clone()));
        }
        let lock = self.lock()?;
        let mirror = self.mirror();
        mirror.ensure()?;
        Ok((lock, mirror))
    }

    fn ids(&self, store: &IssueStore) -> Result<IdManager> {
        Ok(IdManager::new(store.read_aliases()?, &self.ctx.alias_prefix))
    }

    fn workspace(&self, target: &WorkspaceTarget) -> Result<Workspace> {
        Workspace::resolve(&self.ctx.workspace_root, target)
    }

    // -----------------------------------------------------------------------
    // Setup
    // -----------------------------------------------------------------------

    /// Set up this clone: create or rebuild the mirror and write a default
    /// project config if there is none. Safe to run again.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MirrorUnhealthy`] if the mirror cannot be built, or
    /// [`Error::Config`] if the config file cannot be written.
    #[instrument(skip(self))]
    pub fn init(&self) -> Result<InitReport> {
        let _lock = self.lock()?;
        let mirror = self.mirror();
        let rebuilt_from = if mirror.health()?.is_usable() {
            None
        } else {
            Some(mirror.repair("initializing")?)
        };
        mirror.store().init()?;

        let config_path = config::project_config_path(&self.ctx.repo_root);
        let config_written = config::write_default_project_config(&self.ctx.repo_root, &ProjectConfig::default())
            .map_err(|e| Error::Config {
                path: config_path,
                reason: format!("{e:#}"),
            })?;
        mirror.commit("trellis: initialize", None)?;
        info!(mirror = %mirror.path().display(), ?rebuilt_from, "project initialized");
        Ok(InitReport {
            mirror: mirror.path().to_path_buf(),
            rebuilt_from,
            config_written,
        })
    }

    // -----------------------------------------------------------------------
    // Records
    // -----------------------------------------------------------------------

    /// Create a record. `patch` supplies every field besides the title.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Invalid`] for an empty title or a malformed value and
    /// [`Error::NotFound`] for a parent or dependency that does not exist.
    /// Nothing is written on error.
    #[instrument(skip(self, patch))]
    pub fn create(&self, title: &str, patch: &IssuePatch) -> Result<Issue> {
        let (_lock, mirror) = self.open()?;
        let store = mirror.store();
        let mut ids = self.ids(&store)?;
        let title = title.trim();
        if title.is_empty() {
            return Err(Error::invalid("title", "must not be empty"));
        }

        let now = now();
        let (id, alias) = ids.allocate(now)?;
        let mut issue = Issue::new(id, alias, title, &self.ctx.actor, now);
        issue.apply(patch, now);
        // A creation is one write, not a write followed by edits.
        issue.version = 1;
        issue.stamps.clear();
        self.check_references(&store, &issue)?;
        validate(&issue)?;

        store.write_issue(&issue)?;
        store.write_aliases(ids.map())?;
        mirror.commit(&format!("trellis: create {}", issue.alias), None)?;
        info!(id = %issue.id, alias = %issue.alias, "issue created");
        Ok(issue)
    }

    /// Apply `patch` to the record named by `key` (alias or internal id).
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown key or reference and
    /// [`Error::Invalid`] for a malformed value. Nothing is written on error.
    #[instrument(skip(self, patch))]
    pub fn update(&self, key: &str, patch: &IssuePatch) -> Result<UpdateOutcome> {
        let (_lock, mirror) = self.open()?;
        let store = mirror.store();
        let mut issue = self.read(&store, key)?;
        if patch.title.as_ref().is_some_and(|t| t.trim().is_empty()) {
            return Err(Error::invalid("title", "must not be empty"));
        }

        let changed = issue.apply(patch, now());
        if changed.is_empty() {
            info!(id = %issue.id, "update changed nothing");
            return Ok(UpdateOutcome { issue, changed });
        }
        self.check_references(&store, &issue)?;
        validate(&issue)?;

        store.write_issue(&issue)?;
        let names: Vec<&str> = changed.iter().map(|f| f.name()).collect();
        mirror.commit(
            &format!("trellis: update {} ({})", issue.alias, names.join(", ")),
            None,
        )?;
        info!(id = %issue.id, version = issue.version, "issue updated");
        Ok(UpdateOutcome { issue, changed })
    }

    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown key.
    pub fn show(&self, key: &str) -> Result<Issue> {
        let (_lock, mirror) = self.open()?;
        mirror.refresh_if_stale(self.ctx.stale_after);
        self.read(&mirror.store(), key)
    }

    /// Records matching `filter`, by priority then creation time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupt`] if a record cannot be decoded.
    pub fn list(&self, filter: &ListFilter) -> Result<Vec<Issue>> {
        let (_lock, mirror) = self.open()?;
        mirror.refresh_if_stale(self.ctx.stale_after);
        let mut issues: Vec<Issue> = mirror
            .store()
            .load_all()?
            .into_values()
            .filter(|issue| filter.matches(issue))
            .collect();
        issues.sort_by(|a, b| {
            (a.priority, a.created_at, &a.id).cmp(&(b.priority, b.created_at, &b.id))
        });
        Ok(issues)
    }

    fn read(&self, store: &IssueStore, key: &str) -> Result<Issue> {
        let id = self.ids(store)?.resolve(key)?;
        store
            .read_issue(&id)?
            .ok_or_else(|| Error::not_found("issue", key))
    }

    fn resolve(&self, store: &IssueStore, key: &str) -> Result<IssueId> {
        self.ids(store)?.resolve(key)
    }

    fn check_references(&self, store: &IssueStore, issue: &Issue) -> Result<()> {
        let targets = issue.parent.iter().chain(issue.deps.keys());
        for target in targets {
            if *target == issue.id {
                return Err(Error::invalid("reference", format!("{} cannot refer to itself", issue.alias)));
            }
            if store.read_issue(target)?.is_none() {
                return Err(Error::not_found("issue", target.as_str()));
            }
        }
        Ok(())
    }

    /// Resolve a user-supplied reference (alias or id) to an internal id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if nothing matches exactly.
    pub fn resolve_key(&self, key: &str) -> Result<IssueId> {
        let (_lock, mirror) = self.open()?;
        self.resolve(&mirror.store(), key)
    }

    // -----------------------------------------------------------------------
    // Sync
    // -----------------------------------------------------------------------

    /// Fetch, merge, commit and push the shared line.
    ///
    /// # Errors
    ///
    /// See [`sync::run_sync`].
    pub fn sync(&self) -> Result<SyncReport> {
        let (_lock, mirror) = self.open()?;
        let mut line = GitLine::new(&mirror, &self.ctx);
        sync::run_sync(&mut line, self.ctx.max_push_retries)
    }

    /// Where the mirror stands against the remote line. Fetches first
    /// unless `offline`.
    ///
    /// # Errors
    ///
    /// Returns an error if git fails.
    pub fn status(&self, offline: bool) -> Result<SyncStatus> {
        let (_lock, mirror) = self.open()?;
        sync::status(&mirror, &self.ctx, !offline)
    }

    // -----------------------------------------------------------------------
    // Workspaces
    // -----------------------------------------------------------------------

    /// # Errors
    ///
    /// See [`workspace::save`].
    pub fn save(&self, target: &WorkspaceTarget, scope: SaveScope) -> Result<TransferReport> {
        let (_lock, mirror) = self.open()?;
        let workspace = self.workspace(target)?;
        workspace::save(&mirror, &workspace, scope, &self.ctx.alias_prefix, now())
    }

    /// # Errors
    ///
    /// See [`workspace::import`].
    pub fn import(&self, source: &WorkspaceTarget, clear: bool) -> Result<TransferReport> {
        let (_lock, mirror) = self.open()?;
        let workspace = self.workspace(source)?;
        workspace::import(&mirror, &workspace, clear, &self.ctx.alias_prefix, now())
    }

    /// # Errors
    ///
    /// See [`workspace::merge_into`].
    pub fn merge_workspaces(&self, from: &WorkspaceTarget, into: &WorkspaceTarget) -> Result<TransferReport> {
        let _lock = self.lock()?;
        let source = self.workspace(from)?;
        let target = self.workspace(into)?;
        workspace::merge_into(&source, &target, &self.ctx.alias_prefix, now())
    }

    /// # Errors
    ///
    /// Returns an error if the workspace root cannot be listed.
    pub fn workspaces(&self) -> Result<Vec<WorkspaceSummary>> {
        workspace::list(&self.ctx.workspace_root)
    }

    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the workspace does not exist.
    pub fn delete_workspace(&self, target: &WorkspaceTarget) -> Result<()> {
        let _lock = self.lock()?;
        workspace::delete(&self.workspace(target)?)
    }

    // -----------------------------------------------------------------------
    // Attic
    // -----------------------------------------------------------------------

    /// Attic entries, optionally for one record and/or one field.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown record and
    /// [`Error::Invalid`] for an unknown field name.
    pub fn attic_list(&self, record: Option<&str>, field: Option<&str>) -> Result<Vec<AtticEntry>> {
        let (_lock, mirror) = self.open()?;
        let store = mirror.store();
        let record = record.map(|key| self.resolve(&store, key)).transpose()?;
        if let Some(field) = field {
            if field != WHOLE_RECORD && Field::from_name(field).is_none() {
                return Err(Error::invalid("field", format!("unknown field `{field}`")));
            }
        }
        Attic::of(&store).list(&AtticFilter {
            record,
            field: field.map(str::to_string),
        })
    }

    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown key.
    pub fn attic_show(&self, key: &str) -> Result<AtticEntry> {
        let (_lock, mirror) = self.open()?;
        Attic::of(&mirror.store()).get(key)
    }

    /// Restore an attic entry as a new version of its record.
    ///
    /// # Errors
    ///
    /// See [`attic::restore`].
    pub fn attic_restore(&self, key: &str) -> Result<RestoreOutcome> {
        let (_lock, mirror) = self.open()?;
        let store = mirror.store();
        let outcome = attic::restore(&store, &Attic::of(&store), key, now())?;
        if !outcome.fields.is_empty() {
            mirror.commit(
                &format!("trellis: restore {key} into {}", outcome.issue.alias),
                None,
            )?;
        }
        Ok(outcome)
    }

    // -----------------------------------------------------------------------
    // Health
    // -----------------------------------------------------------------------

    /// # Errors
    ///
    /// Returns an error only if the mirror cannot be read at all.
    pub fn check(&self) -> Result<IntegrityReport> {
        let (_lock, mirror) = self.open()?;
        integrity::check(&mirror.store())
    }

    /// Repair what can be repaired and commit the result.
    ///
    /// # Errors
    ///
    /// Returns an error if a fix cannot be written.
    pub fn repair(&self) -> Result<RepairReport> {
        let (_lock, mirror) = self.open()?;
        let report = integrity::repair(&mirror.store(), &self.ctx.alias_prefix, now())?;
        if !report.fixed.is_empty() {
            mirror.commit(
                &format!("trellis: repair {} problem(s)", report.fixed.len()),
                None,
            )?;
        }
        Ok(report)
    }

    /// Rebuild the mirror if it is unhealthy, or always with `force`.
    /// Pending changes in a healthy mirror are committed first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MirrorUnhealthy`] if the rebuild fails.
    pub fn repair_mirror(&self, force: bool) -> Result<Option<RepairSource>> {
        let _lock = self.lock()?;
        let mirror = self.mirror();
        let health = mirror.health()?;
        if health.is_usable() {
            if !force {
                return Ok(None);
            }
            mirror.commit("trellis: record pending changes before mirror rebuild", None)?;
        }
        mirror.repair(&format!("requested ({health:?})")).map(Some)
    }
}

/// A record must survive its own encoding unchanged before it is written.
fn validate(issue: &Issue) -> Result<()> {
    let decoded = codec::decode(&codec::encode(issue))?;
    if decoded == *issue {
        Ok(())
    } else {
        Err(Error::invalid("issue", "record does not survive canonical encoding"))
    }
}
