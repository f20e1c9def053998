//! In-process registry.
//!
//! Behaves like a distribution registry for the operations the pipelines
//! use: content is verified against its digest on upload, and a manifest is
//! only accepted once everything it references is present.

use std::collections::HashMap;

use async_trait::async_trait;
use chartpack_core::error::{PackError, Result};
use parking_lot::Mutex;
use serde_json::json;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::manifest::{media_types, Manifest, RawManifest};
use super::reference::ImageReference;
use super::registry::Registry;
use crate::cache::sha256_hex;

#[derive(Default)]
struct Repository {
    /// Tag or digest → manifest.
    manifests: HashMap<String, RawManifest>,
    blobs: HashMap<String, Vec<u8>>,
}

#[derive(Default)]
struct MemoryState {
    repositories: HashMap<String, Repository>,
    pushes: Vec<String>,
    pulls: usize,
}

pub struct MemoryRegistry {
    host: String,
    state: Mutex<MemoryState>,
}

impl MemoryRegistry {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Store a blob directly, returning its digest.
    pub fn insert_blob(&self, repository: &str, data: &[u8]) -> String {
        let digest = format!("sha256:{}", sha256_hex(data));
        self.state
            .lock()
            .repositories
            .entry(repository.to_string())
            .or_default()
            .blobs
            .insert(digest.clone(), data.to_vec());
        digest
    }

    /// Store a manifest directly under `tag` and its digest.
    pub fn insert_manifest(&self, repository: &str, tag: Option<&str>, manifest: RawManifest) -> String {
        let digest = manifest.digest.clone();
        let mut state = self.state.lock();
        let repo = state.repositories.entry(repository.to_string()).or_default();
        if let Some(tag) = tag {
            repo.manifests.insert(tag.to_string(), manifest.clone());
        }
        repo.manifests.insert(digest.clone(), manifest);
        digest
    }

    /// Store a single-platform OCI image made of `config` and `layers`.
    ///
    /// Returns the manifest.
    pub fn insert_image(
        &self,
        repository: &str,
        tag: Option<&str>,
        config: &[u8],
        layers: &[&[u8]],
    ) -> Result<RawManifest> {
        let config_digest = self.insert_blob(repository, config);
        let layers: Vec<_> = layers
            .iter()
            .map(|layer| {
                json!({
                    "mediaType": media_types::OCI_LAYER_GZIP,
                    "digest": self.insert_blob(repository, layer),
                    "size": layer.len(),
                })
            })
            .collect();

        let document = json!({
            "schemaVersion": 2,
            "mediaType": media_types::OCI_MANIFEST,
            "config": {
                "mediaType": media_types::OCI_CONFIG,
                "digest": config_digest,
                "size": config.len(),
            },
            "layers": layers,
        });

        let manifest = RawManifest::new(serde_json::to_vec(&document)?, None)?;
        self.insert_manifest(repository, tag, manifest.clone());
        Ok(manifest)
    }

    /// Store an OCI index over manifests already present in `repository`.
    ///
    /// Entries are `(manifest, platform)`; a `None` platform produces an
    /// entry without platform information.
    pub fn insert_index(
        &self,
        repository: &str,
        tag: Option<&str>,
        entries: &[(&RawManifest, Option<(&str, &str)>)],
    ) -> Result<RawManifest> {
        let manifests: Vec<_> = entries
            .iter()
            .map(|(manifest, platform)| {
                let mut entry = json!({
                    "mediaType": manifest.media_type,
                    "digest": manifest.digest,
                    "size": manifest.data.len(),
                });
                if let Some((os, architecture)) = platform {
                    entry["platform"] = json!({ "os": os, "architecture": architecture });
                }
                entry
            })
            .collect();

        let document = json!({
            "schemaVersion": 2,
            "mediaType": media_types::OCI_INDEX,
            "manifests": manifests,
        });

        let manifest = RawManifest::new(serde_json::to_vec(&document)?, None)?;
        self.insert_manifest(repository, tag, manifest.clone());
        Ok(manifest)
    }

    pub fn manifest(&self, repository: &str, reference: &str) -> Option<RawManifest> {
        let state = self.state.lock();
        state
            .repositories
            .get(repository)
            .and_then(|repo| repo.manifests.get(reference))
            .cloned()
    }

    pub fn has_blob(&self, repository: &str, digest: &str) -> bool {
        let state = self.state.lock();
        state
            .repositories
            .get(repository)
            .map(|repo| repo.blobs.contains_key(digest))
            .unwrap_or(false)
    }

    /// Uploads in arrival order, as `blob <repo>@<digest>` or `manifest <repo>:<ref>`.
    pub fn pushes(&self) -> Vec<String> {
        self.state.lock().pushes.clone()
    }

    /// Number of manifest and blob downloads served.
    pub fn pulls(&self) -> usize {
        self.state.lock().pulls
    }

    fn missing(&self, reference: &ImageReference, what: &str) -> PackError {
        PackError::RegistryError {
            registry: self.host.clone(),
            message: format!("{} not found in {}", what, reference.repository),
        }
    }
}

/// Digests a manifest references that must exist before it is accepted.
fn references(manifest: &RawManifest) -> Result<(Vec<String>, Vec<String>)> {
    let refs = match manifest.parse()? {
        Manifest::Index(index) => (
            index.manifests.into_iter().map(|d| d.digest).collect(),
            Vec::new(),
        ),
        Manifest::Image(image) => (
            Vec::new(),
            image
                .config
                .into_iter()
                .chain(image.layers)
                .map(|d| d.digest)
                .collect(),
        ),
        Manifest::Schema1(schema1) => (
            Vec::new(),
            schema1.fs_layers.into_iter().map(|l| l.blob_sum).collect(),
        ),
        Manifest::Unsupported(_) => (Vec::new(), Vec::new()),
    };
    Ok(refs)
}

#[async_trait]
impl Registry for MemoryRegistry {
    fn host(&self) -> &str {
        &self.host
    }

    async fn manifest_get(&self, reference: &ImageReference) -> Result<RawManifest> {
        let manifest = self
            .manifest(&reference.repository, reference.reference())
            .ok_or_else(|| self.missing(reference, &format!("manifest {}", reference.reference())))?;
        self.state.lock().pulls += 1;
        Ok(manifest)
    }

    async fn blob_get(
        &self,
        reference: &ImageReference,
        digest: &str,
        out: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<()> {
        let data = {
            let mut state = self.state.lock();
            let data = state
                .repositories
                .get(&reference.repository)
                .and_then(|repo| repo.blobs.get(digest))
                .cloned()
                .ok_or_else(|| self.missing(reference, &format!("blob {}", digest)))?;
            state.pulls += 1;
            data
        };

        out.write_all(&data).await?;
        Ok(())
    }

    async fn manifest_put(&self, reference: &ImageReference, manifest: &RawManifest) -> Result<()> {
        let actual = format!("sha256:{}", sha256_hex(&manifest.data));
        if let Some(ref expected) = reference.digest {
            if expected != &actual {
                return Err(PackError::ChecksumMismatch {
                    path: reference.full_reference(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        let (manifests, blobs) = references(manifest)?;

        let mut state = self.state.lock();
        let repo = state
            .repositories
            .entry(reference.repository.clone())
            .or_default();

        if let Some(digest) = manifests.iter().find(|d| !repo.manifests.contains_key(*d)) {
            return Err(self.missing(reference, &format!("manifest {}", digest)));
        }
        if let Some(digest) = blobs.iter().find(|d| !repo.blobs.contains_key(*d)) {
            return Err(self.missing(reference, &format!("blob {}", digest)));
        }

        let mut stored = manifest.clone();
        stored.digest = actual.clone();
        repo.manifests.insert(actual, stored.clone());
        repo.manifests.insert(reference.reference().to_string(), stored);
        state.pushes.push(format!(
            "manifest {}:{}",
            reference.repository,
            reference.reference()
        ));
        Ok(())
    }

    async fn blob_put(&self, reference: &ImageReference, digest: &str, data: Vec<u8>) -> Result<()> {
        let actual = format!("sha256:{}", sha256_hex(&data));
        if actual != digest {
            return Err(PackError::ChecksumMismatch {
                path: format!("{}@{}", reference.repository, digest),
                expected: digest.to_string(),
                actual,
            });
        }

        let mut state = self.state.lock();
        state
            .repositories
            .entry(reference.repository.clone())
            .or_default()
            .blobs
            .insert(digest.to_string(), data);
        state
            .pushes
            .push(format!("blob {}@{}", reference.repository, digest));
        Ok(())
    }
}
