//! Helm chart handling.
//!
//! Charts travel as gzip-compressed tarballs whose single top-level
//! directory holds `Chart.yaml` and `values.yaml`. Only the `images` map of
//! the values is interpreted.

mod source;

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Component, Path};

use chartpack_core::error::{PackError, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Deserialize;

use crate::bundle::ImageRef;

pub use source::{ChartSource, HelmIndexSource, RegistryChartSource};

const VALUES_FILE: &str = "values.yaml";

#[derive(Debug, Default, Deserialize)]
struct ChartValues {
    #[serde(default)]
    images: Option<BTreeMap<String, ImageRef>>,
}

/// Read `<chart>/values.yaml` from a packaged chart.
///
/// Returns `None` when the chart carries no values file.
pub fn read_values(chart: &[u8]) -> Result<Option<String>> {
    let mut archive = tar::Archive::new(GzDecoder::new(chart));
    let entries = archive
        .entries()
        .map_err(|e| PackError::ChartError(format!("Invalid chart archive: {}", e)))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| PackError::ChartError(format!("Invalid chart archive: {}", e)))?;
        let path = entry
            .path()
            .map_err(|e| PackError::ChartError(format!("Invalid chart entry name: {}", e)))?
            .into_owned();

        if !is_top_level_values(&path) {
            continue;
        }

        let mut values = String::new();
        entry
            .read_to_string(&mut values)
            .map_err(|e| PackError::ChartError(format!("Failed to read {}: {}", path.display(), e)))?;
        return Ok(Some(values));
    }

    Ok(None)
}

fn is_top_level_values(path: &Path) -> bool {
    let components: Vec<_> = path
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect();
    matches!(
        components.as_slice(),
        [Component::Normal(_), Component::Normal(file)] if *file == VALUES_FILE
    )
}

/// Image declarations of a chart, keyed by logical name.
pub fn chart_images(chart: &[u8]) -> Result<BTreeMap<String, ImageRef>> {
    let Some(values) = read_values(chart)? else {
        return Ok(BTreeMap::new());
    };
    if values.trim().is_empty() {
        return Ok(BTreeMap::new());
    }

    let values: ChartValues = serde_yaml::from_str(&values)
        .map_err(|e| PackError::ChartError(format!("Invalid chart values: {}", e)))?;
    Ok(values.images.unwrap_or_default())
}

/// Apply `overrides.images` on top of chart images, entry by entry.
pub fn apply_image_overrides(
    images: &mut BTreeMap<String, ImageRef>,
    overrides: &serde_json::Value,
) -> Result<()> {
    let Some(entries) = overrides.get("images").filter(|v| !v.is_null()) else {
        return Ok(());
    };

    let entries: BTreeMap<String, ImageRef> = serde_json::from_value(entries.clone())
        .map_err(|e| PackError::ChartError(format!("Invalid image overrides: {}", e)))?;
    images.extend(entries);
    Ok(())
}

/// Package a chart directory as `<name>/...` into a gzip-compressed tarball.
pub fn package_directory(dir: &Path, name: &str) -> Result<Vec<u8>> {
    if !dir.join("Chart.yaml").is_file() {
        return Err(PackError::ChartError(format!(
            "{} is not a chart directory: Chart.yaml missing",
            dir.display()
        )));
    }

    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder
        .append_dir_all(name, dir)
        .map_err(|e| PackError::ChartError(format!("Failed to package {}: {}", dir.display(), e)))?;

    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}
