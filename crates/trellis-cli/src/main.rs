#![forbid(unsafe_code)]

mod cmd;
mod output;

use clap::{CommandFactory, Parser, Subcommand};
use output::{CliError, OutputMode, render_error};
use std::env;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "trellis: issues that live in your git repository",
    long_about = None
)]
struct Cli {
    /// Enable debug logging for trellis.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON output instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,

    /// Override the actor recorded on new issues.
    #[arg(long, global = true)]
    actor: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    const fn output_mode(&self) -> OutputMode {
        if self.json {
            OutputMode::Json
        } else {
            OutputMode::Human
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        next_help_heading = "Setup",
        about = "Initialize trellis in this repository",
        long_about = "Build the local mirror of the shared line (adopting the remote's if it exists) \
                      and write .trellis/config.toml. Safe to re-run.",
        after_help = "EXAMPLES:\n    trl init\n    trl init --json"
    )]
    Init(cmd::init::InitArgs),

    #[command(
        next_help_heading = "Issues",
        about = "Create an issue",
        after_help = "EXAMPLES:\n    trl create -t \"Fix login redirect\" -k bug -p 1\n\n    \
                      # Blocked by another issue, with a label\n    \
                      trl create -t \"Ship v2\" --dep tr-a1 -l release"
    )]
    Create(cmd::create::CreateArgs),

    #[command(
        next_help_heading = "Issues",
        about = "Change fields of an issue",
        after_help = "EXAMPLES:\n    trl update tr-a1 -s in_progress -a alice\n    \
                      trl update tr-a1 --remove-label stale --clear due"
    )]
    Update(cmd::update::UpdateArgs),

    #[command(next_help_heading = "Issues", about = "Show one issue")]
    Show(cmd::show::ShowArgs),

    #[command(
        next_help_heading = "Issues",
        about = "List issues",
        after_help = "EXAMPLES:\n    trl list\n    trl list -s blocked -l backend\n    trl list --all --json"
    )]
    List(cmd::list::ListArgs),

    #[command(
        next_help_heading = "Sharing",
        about = "Exchange issues with the remote",
        long_about = "Fetch the remote line, merge it with local changes field by field, and push. \
                      Losing values of concurrent edits are archived in the attic."
    )]
    Sync(cmd::sync::SyncArgs),

    #[command(next_help_heading = "Sharing", about = "Compare the local line with the remote")]
    Status(cmd::sync::StatusArgs),

    #[command(
        next_help_heading = "Sharing",
        about = "Save unpublished work to a workspace",
        after_help = "EXAMPLES:\n    # After a refused push\n    trl save\n\n    \
                      # Hand everything to a teammate\n    trl save ../handoff --all"
    )]
    Save(cmd::workspace::SaveArgs),

    #[command(next_help_heading = "Sharing", about = "Merge a workspace into the mirror")]
    Import(cmd::workspace::ImportArgs),

    #[command(next_help_heading = "Sharing", about = "List, delete or merge workspaces")]
    Workspace(cmd::workspace::WorkspaceArgs),

    #[command(
        next_help_heading = "Conflicts",
        about = "Inspect and restore values that lost a merge",
        after_help = "EXAMPLES:\n    trl attic list --record tr-a1\n    trl attic restore <KEY>"
    )]
    Attic(cmd::attic::AtticArgs),

    #[command(next_help_heading = "Maintenance", about = "Verify the data set")]
    Check(cmd::check::CheckArgs),

    #[command(next_help_heading = "Maintenance", about = "Rebuild the local mirror")]
    RepairMirror(cmd::check::RepairMirrorArgs),

    #[command(next_help_heading = "Maintenance", about = "Generate shell completions")]
    Completions(cmd::completions::CompletionsArgs),
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_env("TRELLIS_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if verbose || env::var("DEBUG").is_ok() {
            "trellis=debug,trl=debug,info"
        } else {
            "trellis=info,trl=info,warn"
        })
    });

    let format = env::var("TRELLIS_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let output = cli.output_mode();

    if let Commands::Completions(args) = &cli.command {
        let mut command = Cli::command();
        return cmd::completions::run_completions(args.shell, &mut command);
    }

    let cwd = env::current_dir()?;
    let project = cmd::open_project(cli.actor.as_deref(), &cwd)?;

    match &cli.command {
        Commands::Init(args) => cmd::init::run_init(args, &project, output),
        Commands::Create(args) => cmd::create::run_create(args, &project, output),
        Commands::Update(args) => cmd::update::run_update(args, &project, output),
        Commands::Show(args) => cmd::show::run_show(args, &project, output),
        Commands::List(args) => cmd::list::run_list(args, &project, output),
        Commands::Sync(args) => cmd::sync::run_sync(args, &project, output),
        Commands::Status(args) => cmd::sync::run_status(args, &project, output),
        Commands::Save(args) => cmd::workspace::run_save(args, &project, output),
        Commands::Import(args) => cmd::workspace::run_import(args, &project, output),
        Commands::Workspace(args) => cmd::workspace::run_workspace(args, &project, output),
        Commands::Attic(args) => cmd::attic::run_attic(args, &project, output),
        Commands::Check(args) => cmd::check::run_check(args, &project, output),
        Commands::RepairMirror(args) => cmd::check::run_repair_mirror(args, &project, output),
        Commands::Completions(_) => Ok(()),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    debug!(command = ?cli.command, "starting");

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let error = CliError::from(&err);
            if render_error(cli.output_mode(), &error).is_err() {
                eprintln!("error: {err:#}");
            }
            ExitCode::FAILURE
        }
    }
}
