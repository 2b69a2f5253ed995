//! `cnp completions` — emit a completion script for the operator's shell.
//!
//! Runs before the engine opens, so it never touches the data directory.

use anyhow::Result;
use clap::Args;
use clap_complete::Shell;

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Shell to emit a completion script for.
    #[arg(value_enum)]
    pub shell: Shell,
}

pub fn run_completions(shell: Shell, command: &mut clap::Command) -> Result<()> {
    emit(shell, command, &mut std::io::stdout())
}

fn emit(shell: Shell, command: &mut clap::Command, out: &mut dyn std::io::Write) -> Result<()> {
    clap_complete::generate(shell, command, "cnp", out);
    Ok(())
}
