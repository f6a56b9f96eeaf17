//! `trl check` and `trl repair-mirror`.

use crate::output::{OutputMode, pretty_kv, render};
use anyhow::Result;
use clap::Args;
use serde_json::json;
use std::io::Write;
use trellis_core::Project;

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Fix what can be fixed: re-alias duplicates, rebuild the alias map,
    /// rename misfiled records, drop dangling references.
    #[arg(long)]
    pub repair: bool,
}

#[derive(Args, Debug)]
pub struct RepairMirrorArgs {
    /// Rebuild even if the mirror looks healthy.
    #[arg(long)]
    pub force: bool,
}

/// Execute `trl check [--repair]`. Exits non-zero while problems remain.
///
/// # Errors
///
/// Returns an integrity error listing every problem left after the run.
pub fn run_check(args: &CheckArgs, project: &Project, output: OutputMode) -> Result<()> {
    if args.repair {
        let report = project.repair()?;
        render(output, &report, |r, w| {
            for problem in &r.fixed {
                writeln!(w, "fixed: {problem}")?;
            }
            for problem in &r.remaining {
                writeln!(w, "remaining: {problem}")?;
            }
            pretty_kv(w, "repaired", r.fixed.len().to_string())
        })?;
        if !report.remaining.is_empty() {
            project.check()?.into_result()?;
        }
        return Ok(());
    }

    let report = project.check()?;
    render(output, &report, |r, w| {
        for problem in &r.problems {
            writeln!(w, "problem: {problem}")?;
        }
        pretty_kv(w, "records", r.records.to_string())
    })?;
    report.into_result()?;
    Ok(())
}

/// Execute `trl repair-mirror [--force]`.
///
/// # Errors
///
/// Returns an error if the mirror cannot be rebuilt from any source.
pub fn run_repair_mirror(args: &RepairMirrorArgs, project: &Project, output: OutputMode) -> Result<()> {
    let source = project.repair_mirror(args.force)?;
    let value = json!({
        "rebuilt": source.is_some(),
        "source": source,
        "mirror": project.mirror().path(),
    });
    render(output, &value, |_, w| match source {
        Some(source) => pretty_kv(w, "rebuilt", format!("from {source:?}")),
        None => pretty_kv(w, "mirror", "healthy; nothing to do"),
    })
}
