//! Where packaged charts come from.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chartpack_core::error::{PackError, Result};
use serde::Deserialize;

use crate::cache::sha256_hex;
use crate::oci::manifest::{media_types, Manifest};
use crate::oci::{ImageReference, Registry};

/// Resolves a chart name and version to the packaged chart bytes.
#[async_trait]
pub trait ChartSource: Send + Sync {
    async fn fetch(&self, name: &str, version: &str, stage: &str) -> Result<Vec<u8>>;
}

/// Classic Helm repository served over HTTP(S) with an `index.yaml`.
pub struct HelmIndexSource {
    endpoint: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct HelmIndex {
    #[serde(default)]
    entries: HashMap<String, Vec<HelmIndexEntry>>,
}

#[derive(Debug, Clone, Deserialize)]
struct HelmIndexEntry {
    version: String,
    #[serde(default)]
    urls: Vec<String>,
    #[serde(default)]
    digest: Option<String>,
}

impl HelmIndex {
    /// `latest` picks the first listed entry; Helm writes entries newest first.
    fn resolve(&self, name: &str, version: &str) -> Result<&HelmIndexEntry> {
        let entries = self
            .entries
            .get(name)
            .ok_or_else(|| PackError::NotFound(format!("chart {}", name)))?;

        let entry = if version == "latest" {
            entries.first()
        } else {
            entries.iter().find(|e| e.version == version)
        };
        entry.ok_or_else(|| PackError::NotFound(format!("chart {} version {}", name, version)))
    }
}

impl HelmIndexSource {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn resolve_url(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}/{}", self.endpoint, url.trim_start_matches('/'))
        }
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| PackError::ChartError(format!("Failed to fetch {}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(PackError::ChartError(format!(
                "Failed to fetch {}: HTTP {}",
                url,
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| PackError::ChartError(format!("Failed to read {}: {}", url, e)))?;
        Ok(bytes.to_vec())
    }

    async fn index(&self) -> Result<HelmIndex> {
        let data = self.download(&format!("{}/index.yaml", self.endpoint)).await?;
        serde_yaml::from_slice(&data)
            .map_err(|e| PackError::ChartError(format!("Invalid repository index: {}", e)))
    }
}

#[async_trait]
impl ChartSource for HelmIndexSource {
    async fn fetch(&self, name: &str, version: &str, _stage: &str) -> Result<Vec<u8>> {
        let index = self.index().await?;
        let entry = index.resolve(name, version)?;

        let mut last_error = None;
        for url in &entry.urls {
            let url = self.resolve_url(url);
            match self.download(&url).await {
                Ok(data) => {
                    if let Some(ref digest) = entry.digest {
                        let actual = sha256_hex(&data);
                        if &actual != digest {
                            return Err(PackError::ChecksumMismatch {
                                path: url,
                                expected: digest.clone(),
                                actual,
                            });
                        }
                    }
                    tracing::debug!(chart = %name, version = %entry.version, url = %url, "Fetched chart");
                    return Ok(data);
                }
                Err(e) => {
                    tracing::warn!(chart = %name, url = %url, error = %e, "Chart download failed");
                    last_error = Some(e);
                }
            }
        }

        Err(PackError::NotFound(match last_error {
            Some(e) => format!("chart {} version {}: {}", name, version, e),
            None => format!("chart {} version {}: no download URLs", name, version),
        }))
    }
}

/// Charts stored as OCI artifacts at `<prefix>/<stage>/<name>:<version>`.
pub struct RegistryChartSource {
    registry: Arc<dyn Registry>,
    prefix: String,
}

impl RegistryChartSource {
    pub fn new(registry: Arc<dyn Registry>, prefix: impl Into<String>) -> Self {
        Self {
            registry,
            prefix: prefix.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn reference(&self, name: &str, version: &str, stage: &str) -> Result<ImageReference> {
        ImageReference::parse(&format!("{}/{}/{}:{}", self.prefix, stage, name, version))
    }
}

#[async_trait]
impl ChartSource for RegistryChartSource {
    async fn fetch(&self, name: &str, version: &str, stage: &str) -> Result<Vec<u8>> {
        let reference = self.reference(name, version, stage)?;
        let manifest = self.registry.manifest_get(&reference).await?;

        let Manifest::Image(image) = manifest.parse()? else {
            return Err(PackError::ChartError(format!(
                "{} is not a chart artifact ({})",
                reference, manifest.media_type
            )));
        };

        let layer = image
            .layers
            .iter()
            .find(|l| l.media_type == media_types::HELM_CHART_CONTENT)
            .ok_or_else(|| {
                PackError::ChartError(format!("{} has no chart content layer", reference))
            })?;

        let mut data = Vec::new();
        self.registry.blob_get(&reference, &layer.digest, &mut data).await?;
        Ok(data)
    }
}
