//! Bundle descriptor stored as `proto.yaml` inside every archive.
//!
//! The descriptor lists the charts that were exported (with the images each
//! one declares) and the resolved manifest digest of every exported image.
//! Registries are never persisted: they are re-bound at import time.

use std::collections::BTreeMap;

use chartpack_core::error::{PackError, Result};
use serde::{Deserialize, Serialize};

use crate::oci::ImageReference;

/// Archive entry holding the descriptor.
pub const DESCRIPTOR_PATH: &str = "proto.yaml";

/// `kind` value marking an image used only by chart test hooks.
pub const TEST_IMAGE_KIND: &str = "Test";

/// Archive entry of a packaged chart.
pub fn chart_path(name: &str, version: &str) -> String {
    format!("chart/{}-{}.tgz", name, version)
}

/// Archive entry of a manifest, by hex digest.
pub fn manifest_path(digest_hex: &str) -> String {
    format!("manifests/{}", digest_hex)
}

/// Archive entry of a blob, by hex digest.
pub fn blob_path(digest_hex: &str) -> String {
    format!("blobs/{}", digest_hex)
}

/// Strip the algorithm from a `sha256:<hex>` digest.
///
/// Bare hex digests are returned unchanged; other algorithms are rejected
/// because archive entries are verified with SHA256.
pub fn digest_hex(digest: &str) -> Result<&str> {
    match digest.split_once(':') {
        Some(("sha256", hex)) => Ok(hex),
        Some((algorithm, _)) => Err(PackError::ManifestError(format!(
            "Unsupported digest algorithm '{}' in {}",
            algorithm, digest
        ))),
        None => Ok(digest),
    }
}

/// Image declared by a chart (`values.images.<name>`) or requested directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    /// Registry host; rebound on import.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,
    /// Repository path, e.g. `arangodb/enterprise`.
    pub image: String,
    #[serde(default = "default_tag")]
    pub tag: String,
    /// `Test` marks chart-test-only images.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

fn default_tag() -> String {
    "latest".to_string()
}

impl ImageRef {
    pub fn new(image: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            registry: None,
            image: image.into(),
            tag: tag.into(),
            kind: None,
        }
    }

    pub fn is_test(&self) -> bool {
        self.kind.as_deref() == Some(TEST_IMAGE_KIND)
    }

    /// Registry-independent identity, `<image>:<tag>`.
    pub fn short_name(&self) -> String {
        format!("{}:{}", self.image, self.tag)
    }

    /// `<registry>/<image>:<tag>`, or the short name when no registry is set.
    pub fn full_name(&self) -> String {
        match &self.registry {
            Some(registry) => format!("{}/{}", registry, self.short_name()),
            None => self.short_name(),
        }
    }

    pub fn to_reference(&self) -> Result<ImageReference> {
        ImageReference::parse(&self.full_name())
    }

    /// Copy without registry or kind, as recorded in the descriptor.
    pub fn stripped(&self) -> Self {
        Self {
            registry: None,
            image: self.image.clone(),
            tag: self.tag.clone(),
            kind: None,
        }
    }

    pub fn with_registry(&self, registry: &str) -> Self {
        Self {
            registry: Some(registry.to_string()),
            ..self.clone()
        }
    }
}

impl std::str::FromStr for ImageRef {
    type Err = PackError;

    /// Parse `[registry/]image[:tag]`; digest references are not accepted.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() || s.contains('@') {
            return Err(PackError::ManifestError(format!(
                "Invalid image '{}': expected [registry/]image[:tag]",
                s
            )));
        }

        let (registry, rest) = match s.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (Some(first.to_string()), rest)
            }
            _ => (None, s),
        };

        let segment_start = rest.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (image, tag) = match rest[segment_start..].rfind(':') {
            Some(colon) => {
                let split = segment_start + colon;
                (&rest[..split], &rest[split + 1..])
            }
            None => (rest, "latest"),
        };

        if image.is_empty() || tag.is_empty() {
            return Err(PackError::ManifestError(format!("Invalid image '{}'", s)));
        }

        Ok(Self {
            registry,
            image: image.to_string(),
            tag: tag.to_string(),
            kind: None,
        })
    }
}

/// Per-chart descriptor entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtoChart {
    pub version: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub images: BTreeMap<String, ImageRef>,
}

/// Top-level bundle descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proto {
    /// Chart name → exported version and images.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub charts: BTreeMap<String, ProtoChart>,
    /// `<image>:<tag>` → hex manifest digest.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub manifests: BTreeMap<String, String>,
}

impl Proto {
    pub fn to_yaml(&self) -> Result<Vec<u8>> {
        Ok(serde_yaml::to_string(self)?.into_bytes())
    }

    pub fn from_yaml(data: &[u8]) -> Result<Self> {
        Ok(serde_yaml::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_paths() {
        assert_eq!(chart_path("arangodb-platform", "1.2.3"), "chart/arangodb-platform-1.2.3.tgz");
        assert_eq!(manifest_path("abc"), "manifests/abc");
        assert_eq!(blob_path("def"), "blobs/def");
    }

    #[test]
    fn test_digest_hex() {
        assert_eq!(digest_hex("sha256:abc").unwrap(), "abc");
        assert_eq!(digest_hex("abc").unwrap(), "abc");
        assert!(digest_hex("sha512:abc").is_err());
    }

    #[test]
    fn test_image_ref_names() {
        let image = ImageRef {
            registry: Some("ghcr.io".to_string()),
            image: "arangodb/server".to_string(),
            tag: "3.12".to_string(),
            kind: None,
        };
        assert_eq!(image.short_name(), "arangodb/server:3.12");
        assert_eq!(image.full_name(), "ghcr.io/arangodb/server:3.12");
        assert_eq!(image.stripped().full_name(), "arangodb/server:3.12");

        let reference = image.to_reference().unwrap();
        assert_eq!(reference.registry, "ghcr.io");
        assert_eq!(reference.repository, "arangodb/server");
    }

    #[test]
    fn test_image_ref_from_str() {
        let image: ImageRef = "registry.local:5000/arangodb/server:3.12".parse().unwrap();
        assert_eq!(image.registry.as_deref(), Some("registry.local:5000"));
        assert_eq!(image.image, "arangodb/server");
        assert_eq!(image.tag, "3.12");

        let image: ImageRef = "pause".parse().unwrap();
        assert_eq!(image, ImageRef::new("pause", "latest"));

        let image: ImageRef = "arangodb/server:3.12".parse().unwrap();
        assert_eq!(image.registry, None);
        assert_eq!(image.short_name(), "arangodb/server:3.12");

        assert!("".parse::<ImageRef>().is_err());
        assert!("pause:".parse::<ImageRef>().is_err());
        assert!("pause@sha256:abc".parse::<ImageRef>().is_err());
    }

    #[test]
    fn test_image_ref_test_kind() {
        let mut image = ImageRef::new("pause", "3.5");
        assert!(!image.is_test());
        image.kind = Some("Test".to_string());
        assert!(image.is_test());
        assert_eq!(image.stripped().kind, None);
    }

    #[test]
    fn test_image_ref_tolerates_missing_tag() {
        let image: ImageRef = serde_yaml::from_str("image: busybox\n").unwrap();
        assert_eq!(image.tag, "latest");
    }

    #[test]
    fn test_proto_yaml_layout() {
        let mut proto = Proto::default();
        let mut chart = ProtoChart {
            version: "1.0.0".to_string(),
            ..Default::default()
        };
        chart
            .images
            .insert("main".to_string(), ImageRef::new("pause", "3.5"));
        proto.charts.insert("x".to_string(), chart);
        proto
            .manifests
            .insert("pause:3.5".to_string(), "abc".to_string());

        let yaml = String::from_utf8(proto.to_yaml().unwrap()).unwrap();
        assert!(yaml.contains("charts:"));
        assert!(yaml.contains("pause:3.5: abc"));
        assert!(!yaml.contains("registry"));

        assert_eq!(Proto::from_yaml(yaml.as_bytes()).unwrap(), proto);
    }
}
