//! `chartpack import` command - Publish a bundle archive into a registry.

use std::path::PathBuf;
use std::sync::Arc;

use chartpack::{Importer, OciRegistry};
use chartpack_core::PackConfig;
use clap::Args;

#[derive(Args)]
pub struct ImportArgs {
    /// Bundle archive to import
    #[arg(short, long)]
    pub input: PathBuf,

    /// Destination registry, optionally with a repository prefix (e.g., "registry.local:5000/offline")
    #[arg(short, long)]
    pub registry: String,

    /// Write the resulting package specification here instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

pub async fn execute(args: ImportArgs, config: &PackConfig) -> Result<(), Box<dyn std::error::Error>> {
    let registry = Arc::new(OciRegistry::new(
        args.registry.clone(),
        config.insecure_registries.clone(),
    ));

    let outcome = Importer::new(registry)
        .with_concurrency(config.concurrency)
        .import(&args.input)
        .await?;

    let yaml = outcome.package.to_yaml()?;
    match &args.output {
        Some(path) => {
            std::fs::write(path, &yaml)
                .map_err(|e| format!("Failed to write {}: {e}", path.display()))?;
            println!(
                "{}",
                crate::output::import_summary(
                    &args.registry,
                    outcome.proto.charts.len(),
                    outcome.proto.manifests.len(),
                )
            );
            println!("Package specification written to {}", path.display());
        }
        None => print!("{}", yaml),
    }
    Ok(())
}
