//! Project and user configuration, and the [`Context`] resolved from them.
//!
//! Configuration is read once, at the boundary. Everything below
//! [`Context`] receives its settings explicitly and never consults the
//! environment or config files itself.

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::git::Git;

pub const PROJECT_DIR: &str = ".trellis";
pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub ids: IdsConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_remote")]
    pub remote: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "default_max_push_retries")]
    pub max_push_retries: usize,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            remote: default_remote(),
            branch: default_branch(),
            max_push_retries: default_max_push_retries(),
            lock_timeout_ms: default_lock_timeout_ms(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdsConfig {
    #[serde(default = "default_alias_prefix")]
    pub alias_prefix: String,
}

impl Default for IdsConfig {
    fn default() -> Self {
        Self {
            alias_prefix: default_alias_prefix(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Relative to the repository root.
    #[serde(default = "default_workspace_root")]
    pub root: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: default_workspace_root(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConfig {
    #[serde(default)]
    pub actor: Option<String>,
}

fn default_remote() -> String {
    "origin".into()
}

fn default_branch() -> String {
    "trellis-sync".into()
}

const fn default_max_push_retries() -> usize {
    3
}

const fn default_lock_timeout_ms() -> u64 {
    5_000
}

const fn default_stale_after_secs() -> u64 {
    300
}

fn default_alias_prefix() -> String {
    "tr".into()
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from(PROJECT_DIR).join("workspaces")
}

#[must_use]
pub fn project_config_path(repo_root: &Path) -> PathBuf {
    repo_root.join(PROJECT_DIR).join(CONFIG_FILE)
}

pub fn load_project_config(repo_root: &Path) -> Result<ProjectConfig> {
    let path = project_config_path(repo_root);
    if !path.exists() {
        return Ok(ProjectConfig::default());
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<ProjectConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

/// Write `config` unless a config file already exists. Returns whether a
/// file was written.
pub fn write_default_project_config(repo_root: &Path, config: &ProjectConfig) -> Result<bool> {
    let path = project_config_path(repo_root);
    if path.exists() {
        return Ok(false);
    }
    let text = toml::to_string_pretty(config).context("Failed to serialize project config")?;
    crate::store::write_atomic(&path, text.as_bytes())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(true)
}

pub fn load_user_config() -> Result<UserConfig> {
    let Some(config_dir) = dirs::config_dir() else {
        return Ok(UserConfig::default());
    };

    let path = config_dir.join("trellis/config.toml");
    if !path.exists() {
        return Ok(UserConfig::default());
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<UserConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

/// Inputs to actor resolution, highest precedence first.
#[derive(Debug, Clone, Default)]
pub struct ActorSources {
    pub flag: Option<String>,
    pub env: Option<String>,
    pub user_config: Option<String>,
    pub git_user: Option<String>,
    pub login: Option<String>,
}

/// First non-blank source wins; `"unknown"` if none is set.
#[must_use]
pub fn resolve_actor(sources: &ActorSources) -> String {
    [
        &sources.flag,
        &sources.env,
        &sources.user_config,
        &sources.git_user,
        &sources.login,
    ]
    .into_iter()
    .flatten()
    .map(|s| s.trim())
    .find(|s| !s.is_empty())
    .unwrap_or("unknown")
    .to_string()
}

/// Everything a core operation needs to know about where it runs and who
/// runs it.
#[derive(Debug, Clone)]
pub struct Context {
    pub actor: String,
    pub repo_root: PathBuf,
    pub git_common_dir: PathBuf,
    pub mirror_path: PathBuf,
    pub workspace_root: PathBuf,
    pub remote: String,
    pub branch: String,
    pub alias_prefix: String,
    pub max_push_retries: usize,
    pub lock_timeout: Duration,
    pub stale_after: Duration,
}

impl Context {
    /// Build a context for the repository containing `start`.
    ///
    /// `sources.git_user` is filled from `git config user.name` when unset.
    pub fn resolve(start: &Path, mut sources: ActorSources) -> Result<Self> {
        let git = Git::new(start);
        let repo_root = PathBuf::from(
            git.run(&["rev-parse", "--show-toplevel"])
                .with_context(|| format!("{} is not inside a git repository", start.display()))?,
        );
        let common = git
            .run(&["rev-parse", "--path-format=absolute", "--git-common-dir"])
            .context("Failed to locate the git directory")?;
        let git_common_dir = PathBuf::from(common);

        if sources.git_user.is_none() {
            sources.git_user = git.run(&["config", "user.name"]).ok();
        }

        let project = load_project_config(&repo_root)?;
        Ok(Self::from_parts(repo_root, git_common_dir, &project, resolve_actor(&sources)))
    }

    /// Assemble a context from already-resolved parts.
    #[must_use]
    pub fn from_parts(
        repo_root: PathBuf,
        git_common_dir: PathBuf,
        project: &ProjectConfig,
        actor: String,
    ) -> Self {
        let state_dir = git_common_dir.join("trellis");
        Self {
            actor,
            mirror_path: state_dir.join("mirror"),
            workspace_root: repo_root.join(&project.workspace.root),
            repo_root,
            git_common_dir,
            remote: project.sync.remote.clone(),
            branch: project.sync.branch.clone(),
            alias_prefix: project.ids.alias_prefix.clone(),
            max_push_retries: project.sync.max_push_retries,
            lock_timeout: Duration::from_millis(project.sync.lock_timeout_ms),
            stale_after: Duration::from_secs(project.sync.stale_after_secs),
        }
    }

    /// Private per-clone state: lock, quarantine, refresh marker.
    #[must_use]
    pub fn state_dir(&self) -> PathBuf {
        self.git_common_dir.join("trellis")
    }

    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        self.state_dir().join("lock")
    }

    #[must_use]
    pub fn remote_ref(&self) -> String {
        format!("refs/remotes/{}/{}", self.remote, self.branch)
    }

    #[must_use]
    pub fn branch_ref(&self) -> String {
        format!("refs/heads/{}", self.branch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_config_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = load_project_config(dir.path()).unwrap();
        assert_eq!(config, ProjectConfig::default());
        assert_eq!(config.sync.remote, "origin");
        assert_eq!(config.sync.branch, "trellis-sync");
        assert_eq!(config.sync.max_push_retries, 3);
        assert_eq!(config.ids.alias_prefix, "tr");
    }

    #[test]
    fn partial_config_fills_in_defaults() {
        let dir = TempDir::new().unwrap();
        let path = project_config_path(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "[sync]\nremote = \"upstream\"\n\n[ids]\nalias_prefix = \"web\"\n").unwrap();

        let config = load_project_config(dir.path()).unwrap();
        assert_eq!(config.sync.remote, "upstream");
        assert_eq!(config.sync.branch, "trellis-sync");
        assert_eq!(config.ids.alias_prefix, "web");
        assert_eq!(config.workspace.root, PathBuf::from(".trellis/workspaces"));
    }

    #[test]
    fn malformed_config_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = project_config_path(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "[sync\n").unwrap();
        assert!(load_project_config(dir.path()).is_err());
    }

    #[test]
    fn default_config_is_written_once() {
        let dir = TempDir::new().unwrap();
        assert!(write_default_project_config(dir.path(), &ProjectConfig::default()).unwrap());
        assert!(!write_default_project_config(dir.path(), &ProjectConfig::default()).unwrap());
        assert_eq!(load_project_config(dir.path()).unwrap(), ProjectConfig::default());
    }

    #[test]
    fn actor_precedence() {
        let mut sources = ActorSources {
            flag: None,
            env: Some("  ".into()),
            user_config: Some("cfg".into()),
            git_user: Some("git".into()),
            login: Some("login".into()),
        };
        assert_eq!(resolve_actor(&sources), "cfg");
        sources.flag = Some("flag".into());
        assert_eq!(resolve_actor(&sources), "flag");
        assert_eq!(resolve_actor(&ActorSources::default()), "unknown");
    }

    #[test]
    fn context_paths_derive_from_git_dir() {
        let ctx = Context::from_parts(
            PathBuf::from("/repo"),
            PathBuf::from("/repo/.git"),
            &ProjectConfig::default(),
            "alice".into(),
        );
        assert_eq!(ctx.mirror_path, PathBuf::from("/repo/.git/trellis/mirror"));
        assert_eq!(ctx.workspace_root, PathBuf::from("/repo/.trellis/workspaces"));
        assert_eq!(ctx.lock_path(), PathBuf::from("/repo/.git/trellis/lock"));
        assert_eq!(ctx.remote_ref(), "refs/remotes/origin/trellis-sync");
        assert_eq!(ctx.lock_timeout, Duration::from_secs(5));
    }
}
