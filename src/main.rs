mod cli;
mod commands;

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
    let context = commands::Context::open(
        cli.config.as_deref(),
        &cli.db_path,
        cli.legacy_dir.as_deref(),
    )?;

    match cli.command {
        Commands::Status => commands::status::run(&context),
        Commands::Versions(command) => commands::versions::run(&context, command),
        Commands::Templates(command) => commands::templates::run(&context, command),
        Commands::Draft(command) => commands::draft::run(&context, command),
        Commands::Batch(command) => commands::batch::run(&context, command),
        Commands::Migrate => commands::migrate::run(&context),
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
