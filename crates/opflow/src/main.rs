mod commands;
mod context;
mod error;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::commands::Commands;
use crate::context::Context;
use crate::error::CliError;

#[derive(Parser)]
#[command(name = "opflow")]
#[command(version = env!("OPFLOW_VERSION"))]
#[command(about = "Inspect opflow saga and idempotency ledgers", long_about = None)]
struct Cli {
    /// SQLite ledger file (default: database_path from the config)
    #[arg(long = "database", short = 'd', global = true)]
    database: Option<PathBuf>,

    /// Config file (default: ./opflow.toml when present)
    #[arg(long = "config", short = 'c', global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let result = Context::resolve(cli.config.as_deref(), cli.database)
        .and_then(|ctx| cli.command.execute(&ctx));

    if let Err(e) = result {
        print_error(&e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("OPFLOW_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_error(error: &CliError) {
    eprintln!("error: {error}");

    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        eprintln!("caused by: {cause}");
        source = std::error::Error::source(cause);
    }
}
