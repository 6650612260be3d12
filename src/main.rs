mod args;
mod commands;
mod pipeline;
mod shared;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use args::{AppCommand, Cli};
use commands::{run_collect, run_replay};

// Top-level entrypoint: parse CLI args, set up logging, and dispatch to a command module.
fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.command.debug());
    match cli.command {
        AppCommand::Collect(args) => run_collect(args),
        AppCommand::Replay(args) => run_replay(args),
    }
}

// Logs go to stderr so stdout carries only event records. RUST_LOG wins over --debug.
fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
}
