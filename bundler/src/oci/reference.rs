//! Image reference parsing.
//!
//! Parses references like `ghcr.io/arangodb/server:3.12` or
//! `registry.local:5000/pause@sha256:...` into their components.

use chartpack_core::error::{PackError, Result};

/// Registry used when a reference names none.
const DEFAULT_REGISTRY: &str = "docker.io";

const DEFAULT_TAG: &str = "latest";

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    /// Registry host, optionally with port.
    pub registry: String,
    /// Repository path, e.g. `library/nginx`.
    pub repository: String,
    pub tag: Option<String>,
    /// `algorithm:hex`; takes precedence over the tag when set.
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse a reference string.
    ///
    /// - `nginx` → `docker.io/library/nginx:latest`
    /// - `org/image:1.0` → `docker.io/org/image:1.0`
    /// - `host:5000/org/image` → `host:5000/org/image:latest`
    /// - `host/image@sha256:abc` → digest reference without tag
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(PackError::ManifestError("Empty image reference".to_string()));
        }

        let (name_tag, digest) = match reference.rsplit_once('@') {
            Some((name, digest)) => {
                if !digest.contains(':') {
                    return Err(PackError::ManifestError(format!(
                        "Invalid digest in reference '{}': expected algorithm:hex",
                        reference
                    )));
                }
                (name, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        // A tag colon can only follow the last path separator; a colon in the
        // first component without a slash after it is a registry port.
        let last_segment_start = name_tag.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match name_tag[last_segment_start..].rfind(':') {
            Some(colon) => {
                let split = last_segment_start + colon;
                (&name_tag[..split], Some(name_tag[split + 1..].to_string()))
            }
            None => (name_tag, None),
        };

        if tag.as_deref() == Some("") {
            return Err(PackError::ManifestError(format!(
                "Empty tag in reference '{}'",
                reference
            )));
        }

        let (registry, repository) = Self::split_registry_repository(name)?;

        let tag = match (&tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            _ => tag,
        };

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    fn split_registry_repository(name: &str) -> Result<(String, String)> {
        if let Some((first, rest)) = name.split_once('/') {
            if first.contains('.') || first.contains(':') || first == "localhost" {
                if rest.is_empty() {
                    return Err(PackError::ManifestError(format!(
                        "Empty repository in reference '{}'",
                        name
                    )));
                }
                return Ok((first.to_string(), rest.to_string()));
            }
        }

        if name.is_empty() {
            return Err(PackError::ManifestError("Empty repository name".to_string()));
        }

        let repository = if name.contains('/') {
            name.to_string()
        } else {
            format!("library/{}", name)
        };

        Ok((DEFAULT_REGISTRY.to_string(), repository))
    }

    /// Same repository, addressed by `digest` instead of a tag.
    pub fn with_digest(&self, digest: &str) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: None,
            digest: Some(digest.to_string()),
        }
    }

    /// Tag or digest used to address the manifest.
    pub fn reference(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }

    pub fn full_reference(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:abcdef1234567890abcdef1234567890abcdef1234567890abcdef1234567890";

    #[test]
    fn test_parse_simple_name() {
        let r = ImageReference::parse("pause").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "library/pause");
        assert_eq!(r.tag.as_deref(), Some("latest"));
        assert_eq!(r.digest, None);
    }

    #[test]
    fn test_parse_name_with_tag() {
        let r = ImageReference::parse("pause:3.5").unwrap();
        assert_eq!(r.repository, "library/pause");
        assert_eq!(r.tag.as_deref(), Some("3.5"));
    }

    #[test]
    fn test_parse_registry_with_port() {
        let r = ImageReference::parse("registry.local:5000/arangodb/server:3.12").unwrap();
        assert_eq!(r.registry, "registry.local:5000");
        assert_eq!(r.repository, "arangodb/server");
        assert_eq!(r.tag.as_deref(), Some("3.12"));
    }

    #[test]
    fn test_parse_registry_port_without_tag() {
        let r = ImageReference::parse("localhost:5000/pause").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "pause");
        assert_eq!(r.tag.as_deref(), Some("latest"));
    }

    #[test]
    fn test_parse_digest() {
        let r = ImageReference::parse(&format!("ghcr.io/org/image@{}", DIGEST)).unwrap();
        assert_eq!(r.registry, "ghcr.io");
        assert_eq!(r.tag, None);
        assert_eq!(r.digest.as_deref(), Some(DIGEST));
        assert_eq!(r.reference(), DIGEST);
    }

    #[test]
    fn test_parse_tag_and_digest() {
        let r = ImageReference::parse(&format!("ghcr.io/org/image:1.0@{}", DIGEST)).unwrap();
        assert_eq!(r.tag.as_deref(), Some("1.0"));
        assert_eq!(r.reference(), DIGEST);
    }

    #[test]
    fn test_parse_errors() {
        assert!(ImageReference::parse("").is_err());
        assert!(ImageReference::parse("ghcr.io/").is_err());
        assert!(ImageReference::parse("image@abc").is_err());
        assert!(ImageReference::parse("image:").is_err());
    }

    #[test]
    fn test_with_digest_drops_tag() {
        let r = ImageReference::parse("ghcr.io/org/image:1.0").unwrap();
        let d = r.with_digest(DIGEST);
        assert_eq!(d.tag, None);
        assert_eq!(d.repository, "org/image");
        assert_eq!(d.full_reference(), format!("ghcr.io/org/image@{}", DIGEST));
    }

    #[test]
    fn test_display() {
        let r = ImageReference::parse("nginx:1.25").unwrap();
        assert_eq!(r.to_string(), "docker.io/library/nginx:1.25");
    }
}
