use crate::cmd::update::FieldArgs;
use crate::output::{OutputMode, render};
use anyhow::Result;
use clap::Args;
use std::io::Write;
use trellis_core::Project;
use trellis_core::codec::record_value;

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Title of the issue.
    #[arg(short, long)]
    pub title: String,

    #[command(flatten)]
    pub fields: FieldArgs,
}

/// Execute `trl create --title ...`. The record is committed to the local
/// mirror; `trl sync` publishes it.
///
/// # Errors
///
/// Returns an error if the title is empty, a referenced issue does not
/// exist, or the record cannot be written.
pub fn run_create(args: &CreateArgs, project: &Project, output: OutputMode) -> Result<()> {
    let patch = args.fields.to_patch(project)?;
    let issue = project.create(&args.title, &patch)?;
    render(output, &record_value(&issue), |_, w| {
        writeln!(w, "Created {}: {}", issue.alias, issue.title)
    })
}
