//! Config inspection commands

use std::path::Path;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use packline_core::pool::redact_url;
use packline_core::PacklineConfig;

#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show which config file would be used
    Path,
    /// Print the effective configuration (env overrides applied, credentials masked)
    Show,
}

pub fn run_config(config_path: Option<&Path>, args: ConfigArgs) -> Result<()> {
    match args.command {
        ConfigCommands::Path => run_path(config_path),
        ConfigCommands::Show => run_show(config_path),
    }
}

fn run_path(config_path: Option<&Path>) -> Result<()> {
    let path = PacklineConfig::locate(config_path)?;
    println!("{}", path.display());
    Ok(())
}

fn run_show(config_path: Option<&Path>) -> Result<()> {
    let mut config = PacklineConfig::load(config_path)?;
    config.database.url = redact_url(&config.database.url);

    let toml_str =
        toml::to_string_pretty(&config).context("Failed to serialize config to TOML")?;
    println!("{}", toml_str);
    Ok(())
}
