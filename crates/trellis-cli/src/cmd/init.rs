use crate::output::{OutputMode, pretty_kv, render};
use anyhow::Result;
use clap::Args;
use trellis_core::Project;

#[derive(Args, Debug)]
pub struct InitArgs {}

/// Execute `trl init`: build (or rebuild) the mirror of the shared line and
/// write `.trellis/config.toml` if it does not exist. Safe to re-run.
///
/// # Errors
///
/// Returns an error if the mirror cannot be built or the config written.
pub fn run_init(_args: &InitArgs, project: &Project, output: OutputMode) -> Result<()> {
    let report = project.init()?;
    render(output, &report, |r, w| {
        match r.rebuilt_from {
            Some(source) => pretty_kv(w, "mirror", format!("{} (from {source:?})", r.mirror.display()))?,
            None => pretty_kv(w, "mirror", format!("{} (already healthy)", r.mirror.display()))?,
        }
        if r.config_written {
            pretty_kv(w, "config", ".trellis/config.toml written")?;
        }
        pretty_kv(w, "branch", &project.context().branch)
    })
}
