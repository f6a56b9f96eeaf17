//! Shared-line mirror: a linked worktree of the sync branch.
//!
//! The mirror lives under the repository's git directory, checked out on
//! the dedicated sync branch and nowhere else. Every read or write of shared
//! records goes through [`Mirror::ensure`], which either hands back the
//! mirror path or repairs the mirror first. There is no fallback location:
//! if repair fails the caller gets [`Error::MirrorUnhealthy`].
//!
//! # Repair order
//!
//! 1. Quarantine whatever sits at the mirror path (moved, never deleted).
//! 2. Check out the local sync branch if it exists.
//! 3. Otherwise create it from the remote sync branch if that exists.
//! 4. Otherwise start a new orphan sync branch holding only the format
//!    marker and an empty alias map.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::config::Context;
use crate::error::{Error, Result};
use crate::git::Git;
use crate::model::time::{compact_timestamp, now};
use crate::store::{ALIASES_FILE, FORMAT_FILE, FORMAT_LINE, IssueStore, StoreError, write_atomic};

const REFRESH_STAMP: &str = "refreshed";
const QUARANTINE_DIR: &str = "quarantine";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Observed condition of the mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorHealth {
    Valid,
    Missing,
    /// Present but not a coherent checkout of the sync branch.
    Corrupted(String),
    /// Healthy, but the remote-tracking ref is ahead by `behind` commits.
    Stale { behind: usize },
}

impl MirrorHealth {
    #[must_use]
    pub const fn is_usable(&self) -> bool {
        matches!(self, Self::Valid | Self::Stale { .. })
    }
}

/// What a caller may do with the mirror right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorState {
    Ready(PathBuf),
    NeedsRepair(String),
}

/// Where a repaired mirror was rebuilt from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RepairSource {
    LocalBranch,
    RemoteBranch,
    NewLine,
}

/// Manager for one clone's mirror.
#[derive(Debug, Clone)]
pub struct Mirror {
    repo: Git,
    path: PathBuf,
    state_dir: PathBuf,
    remote: String,
    branch: String,
}

impl Mirror {
    #[must_use]
    pub fn new(ctx: &Context) -> Self {
        Self {
            repo: Git::new(&ctx.repo_root).with_actor(&ctx.actor),
            path: ctx.mirror_path.clone(),
            state_dir: ctx.state_dir(),
            remote: ctx.remote.clone(),
            branch: ctx.branch.clone(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records of the mirror. Only meaningful after [`ensure`](Self::ensure).
    #[must_use]
    pub fn store(&self) -> IssueStore {
        IssueStore::new(&self.path)
    }

    /// `git` running inside the mirror, committing as the repository actor.
    #[must_use]
    pub fn git(&self) -> Git {
        self.repo.at(&self.path)
    }

    #[must_use]
    pub fn branch_ref(&self) -> String {
        format!("refs/heads/{}", self.branch)
    }

    #[must_use]
    pub fn remote_ref(&self) -> String {
        format!("refs/remotes/{}/{}", self.remote, self.branch)
    }

    // -----------------------------------------------------------------------
    // Health
    // -----------------------------------------------------------------------

    /// Inspect the mirror without changing anything.
    ///
    /// # Errors
    ///
    /// Returns an error only if git cannot be run at all; every problem with
    /// the mirror itself is reported as a [`MirrorHealth`] value.
    pub fn health(&self) -> Result<MirrorHealth> {
        if !self.path.exists() {
            return Ok(MirrorHealth::Missing);
        }
        if !self.path.join(".git").is_file() {
            return Ok(MirrorHealth::Corrupted(
                "not a linked worktree (no .git file)".into(),
            ));
        }

        let git = Git::new(&self.path);
        let Ok(toplevel) = git.run(&["rev-parse", "--show-toplevel"]) else {
            return Ok(MirrorHealth::Corrupted("git does not recognise the worktree".into()));
        };
        if !same_dir(Path::new(&toplevel), &self.path) {
            return Ok(MirrorHealth::Corrupted(format!(
                "worktree resolves to {toplevel}"
            )));
        }

        let head = git.output(&["symbolic-ref", "--quiet", "HEAD"], None)?;
        let head_ref = String::from_utf8_lossy(&head.stdout).trim().to_string();
        if !head.status.success() {
            return Ok(MirrorHealth::Corrupted("HEAD is detached".into()));
        }
        if head_ref != self.branch_ref() {
            return Ok(MirrorHealth::Corrupted(format!("HEAD is on {head_ref}")));
        }

        let Some(head) = git.resolve_commit("HEAD")? else {
            return Ok(MirrorHealth::Corrupted(format!(
                "{} does not point at a commit",
                self.branch_ref()
            )));
        };

        if let Some(remote) = git.resolve_commit(&self.remote_ref())? {
            if remote != head && git.is_ancestor(&head, &remote)? {
                let (_, behind) = git.ahead_behind(&head, &remote)?;
                return Ok(MirrorHealth::Stale { behind });
            }
        }
        Ok(MirrorHealth::Valid)
    }

    /// [`health`](Self::health) reduced to what a caller must do next.
    ///
    /// # Errors
    ///
    /// Returns an error only if git cannot be run.
    pub fn check(&self) -> Result<MirrorState> {
        Ok(match self.health()? {
            MirrorHealth::Valid | MirrorHealth::Stale { .. } => MirrorState::Ready(self.path.clone()),
            MirrorHealth::Missing => MirrorState::NeedsRepair("mirror is missing".into()),
            MirrorHealth::Corrupted(reason) => MirrorState::NeedsRepair(reason),
        })
    }

    /// The mirror path, repairing first if needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MirrorUnhealthy`] if the mirror could not be made
    /// healthy. Never returns any other location.
    pub fn ensure(&self) -> Result<PathBuf> {
        match self.check()? {
            MirrorState::Ready(path) => Ok(path),
            MirrorState::NeedsRepair(reason) => {
                warn!(path = %self.path.display(), %reason, "mirror needs repair");
                self.repair(&reason).map(|_| self.path.clone())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Repair
    // -----------------------------------------------------------------------

    /// Rebuild the mirror. Anything at the mirror path is quarantined first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MirrorUnhealthy`] if the rebuilt mirror still fails
    /// its health check, or the underlying git or filesystem error.
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub fn repair(&self, reason: &str) -> Result<RepairSource> {
        if fs::symlink_metadata(&self.path).is_ok() {
            let moved = self.quarantine()?;
            warn!(from = %self.path.display(), to = %moved.display(), "mirror quarantined");
        }
        self.repo.run(&["worktree", "prune"])?;

        let source = if self.repo.resolve_commit(&self.branch_ref())?.is_some() {
            RepairSource::LocalBranch
        } else if self.repo.has_remote(&self.remote)?
            && self.repo.fetch_branch(&self.remote, &self.branch)?
        {
            self.repo.run(&[
                "branch",
                "--no-track",
                &self.branch,
                &self.remote_ref(),
            ])?;
            RepairSource::RemoteBranch
        } else {
            self.create_orphan_line()?;
            RepairSource::NewLine
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::write(parent, e))?;
        }
        let path = self.path.to_string_lossy().into_owned();
        self.repo
            .run(&["worktree", "add", "--quiet", &path, &self.branch])?;

        match self.health()? {
            health if health.is_usable() => {
                self.touch_refresh_stamp()?;
                info!(?source, reason, "mirror repaired");
                Ok(source)
            }
            health => Err(Error::MirrorUnhealthy {
                path: self.path.clone(),
                reason: format!("still unhealthy after repair: {health:?}"),
            }),
        }
    }

    fn quarantine(&self) -> Result<PathBuf> {
        let dir = self.state_dir.join(QUARANTINE_DIR);
        fs::create_dir_all(&dir).map_err(|e| StoreError::write(&dir, e))?;
        let stamp = compact_timestamp(now());
        let mut target = dir.join(format!("mirror-{stamp}"));
        let mut n = 1;
        while target.exists() {
            target = dir.join(format!("mirror-{stamp}-{n}"));
            n += 1;
        }
        fs::rename(&self.path, &target).map_err(|e| StoreError::write(&self.path, e))?;
        Ok(target)
    }

    /// Create the sync branch as a single root commit, without touching the
    /// user's index or working tree.
    fn create_orphan_line(&self) -> Result<()> {
        let format = self
            .repo
            .run_with_input(&["hash-object", "-w", "--stdin"], format!("{FORMAT_LINE}\n").as_bytes())?;
        let aliases = self.repo.run_with_input(&["hash-object", "-w", "--stdin"], b"")?;
        let listing = format!("100644 blob {format}\t{FORMAT_FILE}\n100644 blob {aliases}\t{ALIASES_FILE}\n");
        let tree = self.repo.run_with_input(&["mktree"], listing.as_bytes())?;
        let commit = self.repo.run(&[
            "commit-tree",
            &tree,
            "-m",
            "trellis: initialize shared line",
        ])?;
        self.repo.run(&["update-ref", &self.branch_ref(), &commit])?;
        debug!(%commit, branch = %self.branch, "orphan shared line created");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Commit
    // -----------------------------------------------------------------------

    /// Commit everything in the mirror to the sync branch, optionally as a
    /// merge with `merge_parent`. Returns the new tip, or `None` if there was
    /// nothing to record.
    ///
    /// When the current tip is an ancestor of `merge_parent` the commit is
    /// linear on top of it, and if the content already equals it the branch
    /// simply moves there.
    ///
    /// # Errors
    ///
    /// Returns the underlying git error; the branch is only moved by a
    /// compare-and-swap against the tip read here.
    pub fn commit(&self, message: &str, merge_parent: Option<&str>) -> Result<Option<String>> {
        let git = self.git();
        let branch_ref = self.branch_ref();
        git.run(&["add", "-A"])?;
        let tree = git.run(&["write-tree"])?;
        let head = git.resolve_commit("HEAD")?;

        let parents: Vec<String> = match (merge_parent, &head) {
            (None, Some(head)) => {
                if git.tree_of(head)? == tree {
                    return Ok(None);
                }
                vec![head.clone()]
            }
            (None, None) => Vec::new(),
            (Some(tip), Some(head)) if git.is_ancestor(head, tip)? => {
                if git.tree_of(tip)? == tree {
                    git.run(&["update-ref", &branch_ref, tip, head])?;
                    return Ok(Some(tip.to_string()));
                }
                vec![tip.to_string()]
            }
            (Some(tip), Some(head)) => vec![head.clone(), tip.to_string()],
            (Some(tip), None) => vec![tip.to_string()],
        };

        let mut args: Vec<&str> = vec!["commit-tree", &tree];
        for parent in &parents {
            args.push("-p");
            args.push(parent);
        }
        args.push("-m");
        args.push(message);
        let commit = git.run(&args)?;

        let old = head.unwrap_or_default();
        git.run(&["update-ref", "-m", message, &branch_ref, &commit, &old])?;
        debug!(%commit, parents = parents.len(), "mirror commit");
        Ok(Some(commit))
    }

    // -----------------------------------------------------------------------
    // Refresh
    // -----------------------------------------------------------------------

    /// Fetch and fast-forward a clean mirror. Returns whether HEAD moved.
    ///
    /// # Errors
    ///
    /// Returns an error if the fetch or fast-forward fails.
    pub fn refresh(&self) -> Result<bool> {
        let git = Git::new(&self.path);
        let mut moved = false;
        if self.repo.has_remote(&self.remote)? && self.repo.fetch_branch(&self.remote, &self.branch)? {
            let remote = git.resolve_commit(&self.remote_ref())?;
            let head = git.resolve_commit("HEAD")?;
            if let (Some(remote), Some(head)) = (remote, head) {
                if remote != head && git.is_ancestor(&head, &remote)? && !git.is_dirty()? {
                    git.run(&["merge", "--ff-only", "--quiet", &remote])?;
                    info!(from = %head, to = %remote, "mirror fast-forwarded");
                    moved = true;
                }
            }
        }
        self.touch_refresh_stamp()?;
        Ok(moved)
    }

    /// Refresh if the last refresh is older than `max_age`. Failures are
    /// logged and reported as "not refreshed".
    pub fn refresh_if_stale(&self, max_age: Duration) -> bool {
        let stamp = self.state_dir.join(REFRESH_STAMP);
        let age = fs::metadata(&stamp)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| SystemTime::now().duration_since(t).ok());
        if age.is_some_and(|age| age < max_age) {
            return false;
        }
        match self.refresh() {
            Ok(moved) => moved,
            Err(err) => {
                warn!(error = %err, "mirror refresh failed");
                false
            }
        }
    }

    fn touch_refresh_stamp(&self) -> Result<()> {
        let stamp = self.state_dir.join(REFRESH_STAMP);
        write_atomic(&stamp, compact_timestamp(now()).as_bytes())?;
        Ok(())
    }
}

fn same_dir(a: &Path, b: &Path) -> bool {
    let canon = |p: &Path| -> io::Result<PathBuf> { p.canonicalize() };
    match (canon(a), canon(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProjectConfig;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Mirror) {
        let tmp = TempDir::new().expect("tempdir");
        let repo = tmp.path().join("repo");
        fs::create_dir_all(&repo).unwrap();
        let git = Git::new(&repo).with_actor("tester");
        git.run(&["init", "--quiet"]).unwrap();
        fs::write(repo.join("README"), "hello\n").unwrap();
        git.run(&["add", "README"]).unwrap();
        git.run(&["commit", "--quiet", "-m", "init"]).unwrap();

        let ctx = Context::from_parts(
            repo.clone(),
            repo.join(".git"),
            &ProjectConfig::default(),
            "tester".into(),
        );
        (tmp, Mirror::new(&ctx))
    }

    #[test]
    fn missing_mirror_is_created_as_new_line() {
        let (_tmp, mirror) = setup();
        assert_eq!(mirror.health().unwrap(), MirrorHealth::Missing);
        assert!(matches!(mirror.check().unwrap(), MirrorState::NeedsRepair(_)));

        assert_eq!(mirror.repair("missing").unwrap(), RepairSource::NewLine);
        assert_eq!(mirror.health().unwrap(), MirrorHealth::Valid);
        assert_eq!(
            mirror.store().format().unwrap().as_deref(),
            Some(FORMAT_LINE)
        );
    }

    #[test]
    fn repair_reuses_the_local_branch() {
        let (_tmp, mirror) = setup();
        mirror.ensure().unwrap();
        let head = mirror.git().resolve_commit("HEAD").unwrap();

        fs::remove_dir_all(mirror.path()).unwrap();
        assert_eq!(mirror.health().unwrap(), MirrorHealth::Missing);
        assert_eq!(mirror.repair("missing").unwrap(), RepairSource::LocalBranch);
        assert_eq!(mirror.git().resolve_commit("HEAD").unwrap(), head);
    }

    #[test]
    fn corrupted_mirror_is_quarantined_not_deleted() {
        let (_tmp, mirror) = setup();
        fs::create_dir_all(mirror.path()).unwrap();
        fs::write(mirror.path().join("stray.txt"), "keep me").unwrap();
        assert!(matches!(mirror.health().unwrap(), MirrorHealth::Corrupted(_)));

        let path = mirror.ensure().unwrap();
        assert_eq!(path, mirror.path());
        assert!(!path.join("stray.txt").exists());

        let quarantine = mirror.state_dir.join(QUARANTINE_DIR);
        let kept: Vec<_> = fs::read_dir(&quarantine)
            .unwrap()
            .map(|e| e.unwrap().path().join("stray.txt"))
            .collect();
        assert_eq!(kept.len(), 1);
        assert_eq!(fs::read_to_string(&kept[0]).unwrap(), "keep me");
    }

    #[test]
    fn mirror_on_wrong_branch_is_corrupted() {
        let (_tmp, mirror) = setup();
        mirror.ensure().unwrap();
        mirror
            .git()
            .run(&["checkout", "--quiet", "-b", "elsewhere"])
            .unwrap();
        assert!(matches!(
            mirror.health().unwrap(),
            MirrorHealth::Corrupted(reason) if reason.contains("elsewhere")
        ));
        mirror.ensure().unwrap();
        assert_eq!(mirror.health().unwrap(), MirrorHealth::Valid);
    }

    #[test]
    fn fresh_stamp_skips_refresh() {
        let (_tmp, mirror) = setup();
        mirror.ensure().unwrap();
        // No remote: refresh never moves, and a fresh stamp skips it anyway.
        assert!(!mirror.refresh_if_stale(Duration::from_secs(3600)));
        assert!(!mirror.refresh_if_stale(Duration::ZERO));
    }
}
