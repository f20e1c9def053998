//! Raw manifests and the media types the bundler walks.
//!
//! Manifests are kept byte-exact so their digests survive the round trip
//! through the archive. Parsing only extracts the references a walk needs.

use chartpack_core::error::{PackError, Result};
use serde::{Deserialize, Serialize};

use crate::cache::sha256_hex;

pub mod media_types {
    pub const DOCKER_V1_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v1+json";
    pub const DOCKER_V1_SIGNED_MANIFEST: &str =
        "application/vnd.docker.distribution.manifest.v1+prettyjws";
    pub const DOCKER_V2_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const DOCKER_V2_MANIFEST_LIST: &str =
        "application/vnd.docker.distribution.manifest.list.v2+json";
    pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

    pub const DOCKER_V2_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
    pub const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
    pub const DOCKER_V2_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar";
    pub const DOCKER_V2_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
    pub const DOCKER_V2_LAYER_ZSTD: &str = "application/vnd.docker.image.rootfs.diff.tar.zstd";
    pub const OCI_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";
    pub const OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
    pub const OCI_LAYER_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";
    pub const BUILDKIT_CACHE_CONFIG: &str = "application/vnd.buildkit.cacheconfig.v0";

    pub const HELM_CHART_CONTENT: &str = "application/vnd.cncf.helm.chart.content.v1.tar+gzip";

    /// Media types walked recursively as manifests.
    pub const MANIFESTS: &[&str] = &[
        DOCKER_V1_MANIFEST,
        DOCKER_V1_SIGNED_MANIFEST,
        DOCKER_V2_MANIFEST,
        DOCKER_V2_MANIFEST_LIST,
        OCI_MANIFEST,
        OCI_INDEX,
    ];

    /// Media types copied as opaque blobs.
    pub const BLOBS: &[&str] = &[
        DOCKER_V2_CONFIG,
        OCI_CONFIG,
        DOCKER_V2_LAYER,
        DOCKER_V2_LAYER_GZIP,
        DOCKER_V2_LAYER_ZSTD,
        OCI_LAYER,
        OCI_LAYER_GZIP,
        OCI_LAYER_ZSTD,
        BUILDKIT_CACHE_CONFIG,
    ];
}

pub fn is_manifest_type(media_type: &str) -> bool {
    media_types::MANIFESTS.contains(&media_type)
}

pub fn is_blob_type(media_type: &str) -> bool {
    media_types::BLOBS.contains(&media_type)
}

/// Content descriptor as found in indexes and image manifests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default)]
    pub media_type: String,
    pub digest: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ImageIndex {
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ImageManifest {
    /// Absent on some artifact manifests.
    #[serde(default)]
    pub config: Option<Descriptor>,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Schema1Manifest {
    #[serde(rename = "fsLayers", default)]
    pub fs_layers: Vec<FsLayer>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FsLayer {
    #[serde(rename = "blobSum")]
    pub blob_sum: String,
}

/// Structured view of a manifest, by media type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Manifest {
    Index(ImageIndex),
    Image(ImageManifest),
    /// Docker schema 1: layers only, no config object.
    Schema1(Schema1Manifest),
    Unsupported(String),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaTypeHints {
    #[serde(default)]
    schema_version: u32,
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    manifests: Option<serde_json::Value>,
    /// JWS block carried by signed schema 1 manifests.
    #[serde(default)]
    signatures: Option<serde_json::Value>,
}

/// Manifest bytes exactly as served by a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawManifest {
    pub media_type: String,
    /// `sha256:<hex>` of `data`.
    pub digest: String,
    pub data: Vec<u8>,
}

impl RawManifest {
    /// Wrap manifest bytes, computing the digest.
    ///
    /// `media_type` is the type announced by the transport; when absent it is
    /// sniffed from the document itself.
    pub fn new(data: Vec<u8>, media_type: Option<&str>) -> Result<Self> {
        let media_type = match media_type.filter(|m| !m.is_empty()) {
            Some(m) => m.to_string(),
            None => sniff_media_type(&data)?,
        };

        Ok(Self {
            media_type,
            digest: format!("sha256:{}", sha256_hex(&data)),
            data,
        })
    }

    pub fn digest_hex(&self) -> &str {
        self.digest.strip_prefix("sha256:").unwrap_or(&self.digest)
    }

    pub fn parse(&self) -> Result<Manifest> {
        use media_types::*;

        let invalid = |e: serde_json::Error| {
            PackError::ManifestError(format!(
                "Invalid {} manifest {}: {}",
                self.media_type, self.digest, e
            ))
        };

        let manifest = match self.media_type.as_str() {
            OCI_INDEX | DOCKER_V2_MANIFEST_LIST => {
                Manifest::Index(serde_json::from_slice(&self.data).map_err(invalid)?)
            }
            OCI_MANIFEST | DOCKER_V2_MANIFEST => {
                Manifest::Image(serde_json::from_slice(&self.data).map_err(invalid)?)
            }
            DOCKER_V1_MANIFEST | DOCKER_V1_SIGNED_MANIFEST => {
                Manifest::Schema1(serde_json::from_slice(&self.data).map_err(invalid)?)
            }
            other => Manifest::Unsupported(other.to_string()),
        };
        Ok(manifest)
    }
}

fn sniff_media_type(data: &[u8]) -> Result<String> {
    let hints: MediaTypeHints = serde_json::from_slice(data)
        .map_err(|e| PackError::ManifestError(format!("Manifest is not valid JSON: {}", e)))?;

    let media_type = match hints.media_type {
        Some(m) if !m.is_empty() => m,
        _ if hints.schema_version == 1 && hints.signatures.is_some() => {
            media_types::DOCKER_V1_SIGNED_MANIFEST.to_string()
        }
        _ if hints.schema_version == 1 => media_types::DOCKER_V1_MANIFEST.to_string(),
        _ if hints.manifests.is_some() => media_types::OCI_INDEX.to_string(),
        _ => media_types::OCI_MANIFEST.to_string(),
    };
    Ok(media_type)
}
