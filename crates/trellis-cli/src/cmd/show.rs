//! `trl show`: display every field of a single issue.

use crate::output::{OutputMode, pretty_kv, pretty_rule, pretty_section, render};
use anyhow::Result;
use chrono::{DateTime, Local, Utc};
use clap::Args;
use std::io::{self, Write};
use trellis_core::codec::record_value;
use trellis_core::{Issue, Project};

#[derive(Args, Debug)]
pub struct ShowArgs {
    /// Issue to display: exact alias or internal id.
    pub id: String,
}

fn local(ts: DateTime<Utc>) -> String {
    ts.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

fn render_human(issue: &Issue, w: &mut dyn Write) -> io::Result<()> {
    pretty_section(w, &format!("{}  {}", issue.alias, issue.title))?;
    pretty_kv(w, "id", issue.id.as_str())?;
    pretty_kv(w, "kind", issue.kind.as_str())?;
    pretty_kv(w, "status", issue.status.as_str())?;
    pretty_kv(w, "priority", issue.priority.to_string())?;
    if let Some(assignee) = &issue.assignee {
        pretty_kv(w, "assignee", assignee)?;
    }
    if let Some(parent) = &issue.parent {
        pretty_kv(w, "parent", parent.as_str())?;
    }
    if !issue.labels.is_empty() {
        let labels: Vec<&str> = issue.labels.iter().map(String::as_str).collect();
        pretty_kv(w, "labels", labels.join(", "))?;
    }
    for (target, kind) in &issue.deps {
        pretty_kv(w, kind.as_str(), target.as_str())?;
    }
    pretty_kv(w, "created", format!("{} by {}", local(issue.created_at), issue.created_by))?;
    pretty_kv(w, "updated", format!("{} (v{})", local(issue.updated_at), issue.version))?;
    if let Some(ts) = issue.closed_at {
        pretty_kv(w, "closed", local(ts))?;
    }
    if let Some(ts) = issue.due_at {
        pretty_kv(w, "due", local(ts))?;
    }
    if let Some(ts) = issue.defer_until {
        pretty_kv(w, "deferred", local(ts))?;
    }
    for (key, value) in &issue.extra {
        pretty_kv(w, key, value.to_string())?;
    }
    if let Some(description) = &issue.description {
        pretty_rule(w)?;
        writeln!(w, "{description}")?;
    }
    if let Some(notes) = &issue.notes {
        pretty_section(w, "Notes")?;
        writeln!(w, "{notes}")?;
    }
    Ok(())
}

/// Execute `trl show <id>`.
///
/// # Errors
///
/// Returns an error if nothing matches `id` exactly.
pub fn run_show(args: &ShowArgs, project: &Project, output: OutputMode) -> Result<()> {
    let issue = project.show(&args.id)?;
    render(output, &record_value(&issue), |_, w| render_human(&issue, w))
}
