use std::path::PathBuf;

use clap::Args;
use tracing::Level;

use crate::logging::LogFormat;

#[derive(Debug, Clone, Args)]
pub struct BaseArgs {
    /// Output as JSON
    #[arg(short = 'j', long, global = true)]
    pub json: bool,

    /// Minimum log level (RUST_LOG directives take precedence)
    #[arg(
        long,
        env = "PROM_MIGRATOR_LOG_LEVEL",
        default_value_t = Level::INFO,
        global = true
    )]
    pub log_level: Level,

    /// Log line format
    #[arg(
        long,
        env = "PROM_MIGRATOR_LOG_FORMAT",
        value_enum,
        default_value_t = LogFormat::Text,
        global = true
    )]
    pub log_format: LogFormat,

    /// JSON file supplying defaults for command flags
    #[arg(long, env = "PROM_MIGRATOR_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Path to a .env file to load before running commands.
    #[arg(long, env = "PROM_MIGRATOR_ENV_FILE", hide_env_values = true)]
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
pub struct CLIArgs<T: Args> {
    #[command(flatten)]
    pub base: BaseArgs,

    #[command(flatten)]
    pub args: T,
}
