//! `trl save`, `trl import` and `trl workspace`: move unpublished work
//! through a side store when the shared line will not take it.

use crate::cmd::sync::write_counts;
use crate::output::{OutputMode, pretty_kv, render};
use anyhow::Result;
use clap::{Args, Subcommand};
use serde_json::json;
use std::io::{self, Write};
use trellis_core::Project;
use trellis_core::workspace::{DEFAULT_WORKSPACE, SaveScope, TransferReport, WorkspaceTarget};

#[derive(Args, Debug)]
pub struct SaveArgs {
    /// Workspace name or path.
    #[arg(default_value = DEFAULT_WORKSPACE)]
    pub target: String,

    /// Save every record, not only those changed since the last sync.
    #[arg(long)]
    pub all: bool,
}

#[derive(Args, Debug)]
pub struct ImportArgs {
    /// Workspace name or path.
    #[arg(default_value = DEFAULT_WORKSPACE)]
    pub source: String,

    /// Delete the workspace after a successful import.
    #[arg(long)]
    pub clear: bool,
}

#[derive(Args, Debug)]
pub struct WorkspaceArgs {
    #[command(subcommand)]
    pub command: WorkspaceCommand,
}

#[derive(Subcommand, Debug)]
pub enum WorkspaceCommand {
    /// List workspaces under the workspace root.
    List,
    /// Delete a workspace.
    Delete {
        /// Workspace name or path.
        name: String,
    },
    /// Merge one workspace into another without touching the mirror.
    Merge {
        /// Workspace to read.
        from: String,
        /// Workspace to write.
        into: String,
    },
}

fn write_transfer(w: &mut dyn Write, verb: &str, r: &TransferReport) -> io::Result<()> {
    pretty_kv(w, verb, format!("{} ({})", r.workspace, r.path.display()))?;
    pretty_kv(w, "records", r.records.to_string())?;
    write_counts(w, &r.counts)?;
    if let Some(commit) = &r.commit {
        pretty_kv(w, "commit", commit)?;
    }
    if r.cleared {
        pretty_kv(w, "cleared", "workspace deleted")?;
    }
    Ok(())
}

/// Execute `trl save [TARGET]`.
///
/// # Errors
///
/// Returns an error if the mirror cannot be read or the workspace written.
pub fn run_save(args: &SaveArgs, project: &Project, output: OutputMode) -> Result<()> {
    let scope = if args.all {
        SaveScope::All
    } else {
        SaveScope::UpdatedSince
    };
    let report = project.save(&WorkspaceTarget::parse(&args.target), scope)?;
    render(output, &report, |r, w| write_transfer(w, "saved to", r))
}

/// Execute `trl import [SOURCE]`.
///
/// # Errors
///
/// Returns an error if the workspace does not exist or cannot be merged.
pub fn run_import(args: &ImportArgs, project: &Project, output: OutputMode) -> Result<()> {
    let report = project.import(&WorkspaceTarget::parse(&args.source), args.clear)?;
    render(output, &report, |r, w| write_transfer(w, "imported", r))
}

/// Execute `trl workspace <list|delete|merge>`.
///
/// # Errors
///
/// Returns an error if a named workspace does not exist or cannot be
/// read or written.
pub fn run_workspace(args: &WorkspaceArgs, project: &Project, output: OutputMode) -> Result<()> {
    match &args.command {
        WorkspaceCommand::List => {
            let summaries = project.workspaces()?;
            render(output, &summaries, |list, w| {
                if list.is_empty() {
                    return writeln!(w, "No workspaces.");
                }
                for s in list {
                    let saved = s
                        .saved_at
                        .map_or_else(|| "never".to_string(), |ts| ts.format("%Y-%m-%d %H:%M").to_string());
                    writeln!(w, "{:<16} {:>5} record(s)  saved {saved}", s.name, s.records)?;
                }
                Ok(())
            })
        }
        WorkspaceCommand::Delete { name } => {
            project.delete_workspace(&WorkspaceTarget::parse(name))?;
            render(output, &json!({ "deleted": name }), |_, w| {
                writeln!(w, "Deleted workspace {name}")
            })
        }
        WorkspaceCommand::Merge { from, into } => {
            let report =
                project.merge_workspaces(&WorkspaceTarget::parse(from), &WorkspaceTarget::parse(into))?;
            render(output, &report, |r, w| write_transfer(w, "merged into", r))
        }
    }
}
