//! CLI command definitions and dispatch.

mod export;
mod import;
mod version;

use std::path::PathBuf;

use chartpack_core::{PackConfig, Result};
use clap::{Args, Parser, Subcommand};

/// Chartpack - move Helm charts and their images into air-gapped registries.
#[derive(Parser)]
#[command(name = "chartpack", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Flags shared by every command; they override the configuration file.
#[derive(Args, Debug, Default)]
pub struct GlobalArgs {
    /// Configuration file (default: ~/.chartpack/config.yaml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Number of tasks allowed to run at once
    #[arg(long, global = true)]
    pub concurrency: Option<usize>,

    /// Download cache directory
    #[arg(long, global = true)]
    pub cache_dir: Option<PathBuf>,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Export charts and their images into a bundle archive
    Export(export::ExportArgs),
    /// Import a bundle archive into a registry
    Import(import::ImportArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Return the path of the default configuration file (~/.chartpack/config.yaml).
pub(crate) fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".chartpack"))
        .unwrap_or_else(|| PathBuf::from(".chartpack"))
        .join("config.yaml")
}

/// Resolve the effective configuration: file, then command-line overrides.
pub fn load_config(global: &GlobalArgs) -> Result<PackConfig> {
    let mut config = match &global.config {
        Some(path) => PackConfig::load(path)?,
        None => {
            let path = default_config_path();
            if path.is_file() {
                PackConfig::load(&path)?
            } else {
                PackConfig::default()
            }
        }
    };

    if let Some(concurrency) = global.concurrency {
        config.concurrency = concurrency;
    }
    if let Some(ref cache_dir) = global.cache_dir {
        config.cache_dir = cache_dir.clone();
    }

    config.validate()?;
    Ok(config)
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli, config: PackConfig) -> std::result::Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Export(args) => export::execute(args, &config).await,
        Command::Import(args) => import::execute(args, &config).await,
        Command::Version(args) => version::execute(args).await,
    }
}
