//! packline CLI - atomic batch writes against the warehouse database
//!
//! Provides:
//! - Connectivity check (`check`)
//! - Atomic batch apply from a TOML batch file (`apply`)
//! - One-shot read queries from the query catalog or inline SQL (`query`)
//! - Config inspection (`config`)

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod tracing_setup;

#[derive(Parser, Debug)]
#[command(
    name = "packline",
    author,
    version,
    about = "Run warehouse write batches atomically against a pooled database",
    long_about = "Each batch is an ordered list of SQL operations executed on one pooled \
                  connection inside a single transaction. Either every operation commits \
                  or none of them do."
)]
struct Cli {
    /// Path to packline.toml (overrides PACKLINE_CONFIG and default lookup)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Only log warnings and errors
    #[arg(long, short = 'q', global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect to the database and run SELECT 1
    Check,
    /// Apply a batch file in a single transaction
    Apply(commands::apply::ApplyArgs),
    /// Run a read query and print rows as JSON
    Query(commands::query::QueryArgs),
    /// Show config location or effective configuration
    Config(commands::config::ConfigArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    tracing_setup::init(&tracing_setup::TracingConfig {
        debug: cli.debug,
        quiet: cli.quiet,
    })
    .ok();

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Check => commands::run_check(config_path).await?,
        Commands::Apply(args) => commands::run_apply(config_path, args).await?,
        Commands::Query(args) => commands::run_query(config_path, args).await?,
        Commands::Config(args) => commands::run_config(config_path, args)?,
    }
    Ok(())
}
