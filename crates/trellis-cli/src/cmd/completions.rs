use anyhow::Result;
use clap::Args;
use clap_complete::{Shell, generate};

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Target shell for the completion script.
    #[arg(value_enum)]
    pub shell: Shell,
}

/// Write a completion script for `trl` to stdout.
///
/// # Errors
///
/// Never fails; writing to a closed stdout is ignored by the generator.
pub fn run_completions(shell: Shell, command: &mut clap::Command) -> Result<()> {
    let mut out = std::io::stdout();
    generate(shell, command, "trl", &mut out);
    Ok(())
}
