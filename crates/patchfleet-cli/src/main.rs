use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgGroup, Parser, Subcommand};
use patchfleet_executor::AuthProtocol;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod completion;
mod config;
mod dispatch;
mod flows;
mod prompt;
mod render;

use completion::CliCompletionShell;
use dispatch::run_cli;
use render::TerminalRenderer;

#[derive(Parser, Debug)]
#[command(name = "patchfleet")]
#[command(version)]
#[command(about = "Plan and roll out SQL Server patches across a fleet", long_about = None)]
struct Cli {
    /// Configuration file (defaults to <config dir>/patchfleet/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Raise log verbosity (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Plan and install updates on one or more hosts.
    Update(UpdateArgs),
    /// Resolve builds or KBs against the build reference.
    Build {
        #[arg(required = true)]
        queries: Vec<String>,
    },
    /// Check an installed build against a compliance policy.
    TestBuild(TestBuildArgs),
    /// Refresh the cached build reference.
    UpdateReference {
        #[arg(long)]
        url: Option<String>,
    },
    /// Print a shell completion script.
    Completions {
        #[arg(value_enum)]
        shell: CliCompletionShell,
    },
}

#[derive(clap::Args, Debug, Clone, Default)]
struct UpdateArgs {
    #[arg(long = "computer", required = true, num_args = 1..)]
    computers: Vec<String>,
    /// Build, level (2019SP1CU5, SP2, CU5) or Latest. Defaults to Latest.
    #[arg(long = "version", num_args = 1..)]
    versions: Vec<String>,
    #[arg(long = "kb", num_args = 1..)]
    kbs: Vec<String>,
    /// Bring every release family up to at least this build.
    #[arg(long, conflicts_with = "max_behind")]
    minimum_build: Option<String>,
    /// Bring every release family within e.g. 1SP1CU of its newest release.
    #[arg(long)]
    max_behind: Option<String>,
    /// Directories searched recursively for installer media.
    #[arg(long = "repository", num_args = 1..)]
    repositories: Vec<PathBuf>,
    #[arg(long)]
    restart: bool,
    /// Resume an interrupted run; tolerates a pending reboot before the first action.
    #[arg(long = "continue")]
    continue_run: bool,
    /// Download missing installers.
    #[arg(long)]
    download: bool,
    /// Show what would be installed without touching any host.
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    throttle: Option<usize>,
    #[arg(long)]
    protocol: Option<AuthProtocol>,
    #[arg(long)]
    fallback_protocol: Option<AuthProtocol>,
    /// Approve the fallback protocol without prompting.
    #[arg(long)]
    yes: bool,
    #[arg(long)]
    username: Option<String>,
}

#[derive(clap::Args, Debug, Clone)]
#[command(group(
    ArgGroup::new("policy")
        .required(true)
        .args(["latest", "minimum_build", "max_behind"])
))]
struct TestBuildArgs {
    /// Installed build, e.g. 15.0.4033.1.
    build: String,
    #[arg(long)]
    latest: bool,
    #[arg(long)]
    minimum_build: Option<String>,
    /// Allowed distance from the newest release, e.g. 1SP1CU.
    #[arg(long)]
    max_behind: Option<String>,
}

fn init_tracing(verbose: u8) {
    let default_directive = match verbose {
        0 => "warn,patchfleet=info",
        1 => "warn,patchfleet=debug",
        _ => "warn,patchfleet=trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_env("PATCHFLEET_LOG")
        .unwrap_or_else(|_| default_directive.into());

    // Progress and results own stdout.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .try_init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run_cli(cli) {
        Ok(code) => code,
        Err(err) => {
            let renderer = TerminalRenderer::current();
            renderer.print_error(&format!("{err:#}"));
            ExitCode::FAILURE
        }
    }
}
