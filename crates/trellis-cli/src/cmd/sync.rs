//! `trl sync` and `trl status`: exchange with the shared line and report
//! where the clone stands.

use crate::output::{OutputMode, pretty_kv, render};
use anyhow::Result;
use clap::Args;
use std::io::{self, Write};
use trellis_core::Project;
use trellis_core::sync::{MergeCounts, Relation, SyncOutcome, SyncStatus};

#[derive(Args, Debug)]
pub struct SyncArgs {}

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Compare against the last fetched remote line without contacting it.
    #[arg(long)]
    pub offline: bool,
}

pub fn write_counts(w: &mut dyn Write, counts: &MergeCounts) -> io::Result<()> {
    if counts.is_empty() {
        return pretty_kv(w, "changes", "none");
    }
    pretty_kv(
        w,
        "changes",
        format!(
            "{} created, {} updated, {} merged, {} re-aliased",
            counts.created, counts.updated, counts.merged, counts.realiased
        ),
    )?;
    if counts.conflicts > 0 {
        pretty_kv(
            w,
            "conflicts",
            format!("{} archived; see `trl attic list`", counts.conflicts),
        )?;
    }
    Ok(())
}

/// Execute `trl sync`.
///
/// # Errors
///
/// Returns an error if the remote refuses the push, every retry lost the
/// race, or the mirror cannot be merged. Local data is never lost; a
/// refused push leaves the merged result committed in the mirror.
pub fn run_sync(_args: &SyncArgs, project: &Project, output: OutputMode) -> Result<()> {
    let report = project.sync()?;
    render(output, &report, |r, w| {
        let outcome = match r.outcome {
            SyncOutcome::Pushed => "pushed",
            SyncOutcome::UpToDate => "up to date",
            SyncOutcome::LocalOnly => "no remote; local line updated",
        };
        pretty_kv(w, "sync", outcome)?;
        if r.attempts > 1 {
            pretty_kv(w, "attempts", r.attempts.to_string())?;
        }
        write_counts(w, &r.counts)
    })
}

fn describe(status: &SyncStatus) -> String {
    match status.relation {
        Relation::InSync => "in sync".into(),
        Relation::Ahead => format!("{} commit(s) to push", status.ahead),
        Relation::Behind => format!("{} commit(s) to pull", status.behind),
        Relation::Diverged => format!("diverged: {} ahead, {} behind", status.ahead, status.behind),
        Relation::NoRemote => "no remote configured".into(),
        Relation::RemoteLineMissing => "remote has no shared line yet".into(),
    }
}

/// Execute `trl status`.
///
/// # Errors
///
/// Returns an error if git fails, including the fetch when not offline.
pub fn run_status(args: &StatusArgs, project: &Project, output: OutputMode) -> Result<()> {
    let status = project.status(args.offline)?;
    render(output, &status, |s, w| {
        pretty_kv(w, "status", describe(s))?;
        pretty_kv(w, "local", s.local_tip.as_deref().unwrap_or("(none)"))?;
        pretty_kv(w, "remote", s.remote_tip.as_deref().unwrap_or("(none)"))?;
        if s.dirty {
            pretty_kv(w, "mirror", "uncommitted changes")?;
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(relation: Relation, ahead: usize, behind: usize) -> SyncStatus {
        SyncStatus {
            local_tip: None,
            remote_tip: None,
            ahead,
            behind,
            dirty: false,
            relation,
        }
    }

    #[test]
    fn relation_descriptions() {
        assert_eq!(describe(&status(Relation::InSync, 0, 0)), "in sync");
        assert_eq!(describe(&status(Relation::Ahead, 2, 0)), "2 commit(s) to push");
        assert_eq!(
            describe(&status(Relation::Diverged, 1, 3)),
            "diverged: 1 ahead, 3 behind"
        );
    }

    #[test]
    fn counts_mention_the_attic_only_on_conflict() {
        let mut buf = Vec::new();
        write_counts(&mut buf, &MergeCounts::default()).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "changes:     none\n");

        let counts = MergeCounts {
            merged: 1,
            conflicts: 2,
            ..MergeCounts::default()
        };
        let mut buf = Vec::new();
        write_counts(&mut buf, &counts).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("1 merged"));
        assert!(text.contains("2 archived"));
    }
}
