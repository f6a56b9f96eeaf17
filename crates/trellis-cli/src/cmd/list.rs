use crate::cmd::issue_line;
use crate::output::{OutputMode, render};
use anyhow::Result;
use clap::Args;
use serde_json::Value;
use std::io::Write;
use trellis_core::codec::record_value;
use trellis_core::{Kind, ListFilter, Project, Status};

#[derive(Args, Debug, Default)]
pub struct ListArgs {
    /// Only issues with this status. Implies `--all` for `closed`.
    #[arg(short, long)]
    pub status: Option<Status>,

    /// Only issues of this kind.
    #[arg(short, long)]
    pub kind: Option<Kind>,

    /// Only issues assigned to this actor.
    #[arg(short, long)]
    pub assignee: Option<String>,

    /// Only issues carrying this label.
    #[arg(short, long)]
    pub label: Option<String>,

    /// Include closed issues.
    #[arg(long)]
    pub all: bool,
}

impl ListArgs {
    fn filter(&self) -> ListFilter {
        ListFilter {
            status: self.status,
            kind: self.kind,
            assignee: self.assignee.clone(),
            label: self.label.clone(),
            include_closed: self.all,
        }
    }
}

/// Execute `trl list`, ordered by priority then age.
///
/// # Errors
///
/// Returns an error if the mirror cannot be read.
pub fn run_list(args: &ListArgs, project: &Project, output: OutputMode) -> Result<()> {
    let issues = project.list(&args.filter())?;
    let values: Vec<Value> = issues.iter().map(record_value).collect();
    render(output, &values, |_, w| {
        if issues.is_empty() {
            return writeln!(w, "No issues.");
        }
        for issue in &issues {
            writeln!(w, "{}", issue_line(issue))?;
        }
        writeln!(w, "{} issue(s)", issues.len())
    })
}
