//! `chartpack export` command - Bundle charts and images into an archive.
//!
//! Charts come from a Helm repository, from an OCI registry under a prefix,
//! or from local files. Every image the charts declare is exported along
//! with them.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chartpack::chart::package_directory;
use chartpack::{
    ChartSelection, ChartSource, ExportRequest, Exporter, HelmIndexSource, ImageRef, ObjectCache,
    OciRegistry, Package, RegistryChartSource,
};
use chartpack_core::error::{PackError, Result};
use chartpack_core::PackConfig;
use clap::Args;

#[derive(Args)]
pub struct ExportArgs {
    /// Output archive path (e.g., "platform.tar")
    #[arg(short, long)]
    pub output: PathBuf,

    /// Chart to export as NAME=VERSION (repeatable)
    #[arg(long = "chart", value_name = "NAME=VERSION")]
    pub charts: Vec<String>,

    /// Local chart as NAME=VERSION:PATH; PATH is a .tgz or a chart directory (repeatable)
    #[arg(long = "chart-file", value_name = "NAME=VERSION:PATH")]
    pub chart_files: Vec<String>,

    /// Standalone image to export as [REGISTRY/]IMAGE[:TAG] (repeatable)
    #[arg(long = "image", value_name = "IMAGE")]
    pub images: Vec<String>,

    /// Package specification whose charts are exported
    #[arg(long)]
    pub package: Option<PathBuf>,

    /// Look charts up in an OCI registry as PREFIX/STAGE/NAME:VERSION
    #[arg(long)]
    pub registry_prefix: Option<String>,

    /// Stage for charts that do not name one (overrides the configuration)
    #[arg(long)]
    pub stage: Option<String>,
}

/// Chart source used when no repository is configured.
struct Unconfigured;

#[async_trait]
impl ChartSource for Unconfigured {
    async fn fetch(&self, name: &str, version: &str, _stage: &str) -> Result<Vec<u8>> {
        Err(PackError::ConfigError(format!(
            "No chart repository configured to fetch {} {}; set chart_repository or --registry-prefix",
            name, version
        )))
    }
}

pub async fn execute(args: ExportArgs, config: &PackConfig) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let request = build_request(&args)?;

    // Loopback registries, including ones named only in chart values, are
    // always reached over HTTP.
    let registry = Arc::new(OciRegistry::new(
        args.registry_prefix
            .as_deref()
            .map(registry_host)
            .unwrap_or_default(),
        config.insecure_registries.clone(),
    ));

    let charts: Arc<dyn ChartSource> = match (&args.registry_prefix, &config.chart_repository) {
        (Some(prefix), _) => {
            tracing::debug!(prefix = %prefix, "Fetching charts from registry");
            Arc::new(RegistryChartSource::new(registry.clone(), prefix.clone()))
        }
        (None, Some(endpoint)) => {
            tracing::debug!(endpoint = %endpoint, "Fetching charts from Helm repository");
            Arc::new(HelmIndexSource::new(endpoint.clone()))
        }
        (None, None) => Arc::new(Unconfigured),
    };

    let cache = ObjectCache::new(&config.cache_dir)?;
    let stage = args.stage.clone().unwrap_or_else(|| config.stage.clone());

    let exporter = Exporter::new(registry, charts, cache.clone())
        .with_concurrency(config.concurrency)
        .with_stage(stage);
    let proto = exporter.export(request, &args.output).await?;

    let size = std::fs::metadata(&args.output).map(|m| m.len()).unwrap_or(0);
    println!(
        "{}",
        crate::output::export_summary(
            &args.output,
            proto.charts.len(),
            proto.manifests.len(),
            size,
            cache.saved(),
        )
    );
    Ok(())
}

/// Collect every chart and image selected on the command line.
fn build_request(args: &ExportArgs) -> Result<ExportRequest> {
    let mut request = match &args.package {
        Some(path) => {
            let content = std::fs::read_to_string(path).map_err(|e| {
                PackError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
            })?;
            ExportRequest::from_package(&Package::from_yaml(&content)?)
        }
        None => ExportRequest::default(),
    };

    for chart in &args.charts {
        let (name, version) = parse_chart(chart)?;
        request.charts.insert(
            name,
            ChartSelection {
                version,
                ..Default::default()
            },
        );
    }

    for chart in &args.chart_files {
        let (name, version, path) = parse_chart_file(chart)?;
        let packaged = load_chart(&path, &name)?;
        request.charts.insert(
            name,
            ChartSelection {
                version,
                chart: Some(packaged),
                ..Default::default()
            },
        );
    }

    for image in &args.images {
        request.images.push(image.parse::<ImageRef>()?);
    }

    if request.charts.is_empty() && request.images.is_empty() {
        return Err(PackError::ConfigError(
            "Nothing to export: pass --chart, --chart-file, --image or --package".to_string(),
        ));
    }

    Ok(request)
}

/// Parse `NAME=VERSION`.
fn parse_chart(s: &str) -> Result<(String, String)> {
    match s.split_once('=') {
        Some((name, version)) if !name.is_empty() && !version.is_empty() => {
            Ok((name.to_string(), version.to_string()))
        }
        _ => Err(PackError::ConfigError(format!(
            "Invalid chart '{}': expected NAME=VERSION",
            s
        ))),
    }
}

/// Parse `NAME=VERSION:PATH`.
fn parse_chart_file(s: &str) -> Result<(String, String, PathBuf)> {
    let invalid = || PackError::ConfigError(format!("Invalid chart file '{}': expected NAME=VERSION:PATH", s));

    let (name, rest) = s.split_once('=').ok_or_else(invalid)?;
    let (version, path) = rest.split_once(':').ok_or_else(invalid)?;
    if name.is_empty() || version.is_empty() || path.is_empty() {
        return Err(invalid());
    }
    Ok((name.to_string(), version.to_string(), PathBuf::from(path)))
}

/// Read a packaged chart, packaging it first when `path` is a directory.
fn load_chart(path: &Path, name: &str) -> Result<Vec<u8>> {
    if path.is_dir() {
        return package_directory(path, name);
    }
    std::fs::read(path).map_err(|e| {
        PackError::ChartError(format!("Failed to read chart {}: {}", path.display(), e))
    })
}

/// Host part of a registry prefix such as `registry.local:5000/charts`.
fn registry_host(prefix: &str) -> String {
    prefix.split('/').next().unwrap_or(prefix).to_string()
}
