use std::process::ExitCode;

use anyhow::Result;

use crate::completion::write_completions_script;
use crate::config::Config;
use crate::flows::{
    run_build_command, run_test_build_command, run_update_command, run_update_reference_command,
};
use crate::render::TerminalRenderer;
use crate::{Cli, Commands};

pub fn run_cli(cli: Cli) -> Result<ExitCode> {
    let renderer = TerminalRenderer::current();

    if let Commands::Completions { shell } = &cli.command {
        let mut stdout = std::io::stdout();
        write_completions_script(*shell, &mut stdout)?;
        return Ok(ExitCode::SUCCESS);
    }

    let config = Config::load(cli.config.as_deref())?;
    match &cli.command {
        Commands::Update(args) => run_update_command(&config, args, renderer),
        Commands::Build { queries } => run_build_command(&config, queries, renderer),
        Commands::TestBuild(args) => run_test_build_command(&config, args, renderer),
        Commands::UpdateReference { url } => {
            run_update_reference_command(&config, url.as_deref(), renderer)
        }
        Commands::Completions { .. } => Ok(ExitCode::SUCCESS),
    }
}
