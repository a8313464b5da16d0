mod cleaning;
mod cli;
mod commands;
mod dispatch;
mod error;
mod grouping;
mod index;
mod llm;
mod model;
mod overpass;
mod pacing;
mod prompts;
mod reconcile;
mod report;
mod util;

use anyhow::Result;
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};

fn main() {
    init_tracing();

    if let Err(err) = run() {
        error!(error = %err, "command failed");
        for cause in err.chain().skip(1) {
            error!(cause = %cause, "caused by");
        }
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Collect(args) => commands::collect::run(args),
        Commands::Dispatch(args) => commands::dispatch::run(args),
        Commands::Reconcile(args) => commands::reconcile::run(args),
        Commands::Run(args) => commands::run::run(args),
        Commands::Status(args) => commands::status::run(args),
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
