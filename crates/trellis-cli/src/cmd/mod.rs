pub mod attic;
pub mod check;
pub mod completions;
pub mod create;
pub mod init;
pub mod list;
pub mod show;
pub mod sync;
pub mod update;
pub mod workspace;

use anyhow::{Context as _, Result};
use std::env;
use std::path::Path;
use trellis_core::config::{self, ActorSources, Context};
use trellis_core::{Issue, Project};

/// Resolve the project for the repository containing `cwd`.
///
/// This is the only place the CLI reads the environment on behalf of the
/// core: actor identity from `--actor`, `TRELLIS_ACTOR`, the user config,
/// git's `user.name` and `$USER`, in that order.
pub fn open_project(actor_flag: Option<&str>, cwd: &Path) -> Result<Project> {
    let user = config::load_user_config().context("Failed to load user config")?;
    let sources = ActorSources {
        flag: actor_flag.map(str::to_string),
        env: env::var("TRELLIS_ACTOR").ok(),
        user_config: user.actor,
        git_user: None,
        login: env::var("USER").or_else(|_| env::var("USERNAME")).ok(),
    };
    let ctx = Context::resolve(cwd, sources)?;
    tracing::debug!(actor = %ctx.actor, repo = %ctx.repo_root.display(), "project resolved");
    Ok(Project::new(ctx))
}

/// One-line summary used by list-style output.
pub fn issue_line(issue: &Issue) -> String {
    let mut line = format!(
        "{:<10} {} {:<11} {:<7} {}",
        issue.alias.as_str(),
        issue.priority,
        issue.status.as_str(),
        issue.kind.as_str(),
        issue.title.lines().next().unwrap_or_default()
    );
    if let Some(assignee) = &issue.assignee {
        line.push_str(&format!("  @{assignee}"));
    }
    line
}
