use anyhow::Result;
use clap::{Parser, Subcommand};
use std::ffi::OsString;

mod args;
mod config;
mod env;
mod error;
mod logging;
mod migrate;
mod pipeline;
mod planner;
mod remote;
mod store;
mod ui;
mod utils;

use crate::args::CLIArgs;

const DEFAULT_DEV_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "+dev");
const CLI_VERSION: &str = match option_env!("PROM_MIGRATOR_VERSION_STRING") {
    Some(version) => version,
    None => DEFAULT_DEV_VERSION,
};

#[derive(Debug, Parser)]
#[command(
    name = "prom-migrator",
    about = "Copy Prometheus data between remote-read and remote-write endpoints",
    version = CLI_VERSION
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Migrate a time range from a remote-read source to a remote-write destination
    Migrate(CLIArgs<migrate::MigrateArgs>),
    /// Show how far a migration has progressed
    Status(CLIArgs<migrate::StatusArgs>),
}

#[tokio::main]
async fn main() -> Result<()> {
    let argv: Vec<OsString> = std::env::args_os().collect();
    env::bootstrap_from_args(&argv)?;
    let cli = Cli::parse_from(argv);

    match cli.command {
        Commands::Migrate(cmd) => {
            logging::init_tracing(cmd.base.log_level, cmd.base.log_format)?;
            migrate::run(cmd.base, cmd.args).await?
        }
        Commands::Status(cmd) => {
            logging::init_tracing(cmd.base.log_level, cmd.base.log_format)?;
            migrate::run_status(cmd.base, cmd.args).await?
        }
    }

    Ok(())
}
