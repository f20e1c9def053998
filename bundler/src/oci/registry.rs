//! Registry access used by export and import.
//!
//! [`Registry`] is the seam between the pipelines and a concrete registry.
//! [`OciRegistry`] talks to real registries through `oci-distribution`.

use async_trait::async_trait;
use chartpack_core::error::{PackError, Result};
use chartpack_core::is_loopback_registry;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::OciDescriptor;
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference, RegistryOperation};
use tokio::io::AsyncWrite;

use super::manifest::{media_types, RawManifest};
use super::reference::ImageReference;

/// Content operations against an image registry.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Host this registry is addressed as when it is an import destination.
    fn host(&self) -> &str;

    /// Fetch a manifest, byte-exact.
    async fn manifest_get(&self, reference: &ImageReference) -> Result<RawManifest>;

    /// Stream a blob of `reference`'s repository, by `sha256:<hex>` digest, into `out`.
    async fn blob_get(
        &self,
        reference: &ImageReference,
        digest: &str,
        out: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<()>;

    /// Store a manifest under `reference` (tag or digest).
    async fn manifest_put(&self, reference: &ImageReference, manifest: &RawManifest) -> Result<()>;

    /// Store a blob in `reference`'s repository.
    async fn blob_put(&self, reference: &ImageReference, digest: &str, data: Vec<u8>) -> Result<()>;
}

/// Registry client over the OCI distribution API, anonymous access only.
///
/// The protocol is picked per reference, so registries only discovered while
/// reading chart values still get plain HTTP when they are local or listed
/// as insecure.
pub struct OciRegistry {
    https: Client,
    http: Client,
    host: String,
    insecure: Vec<String>,
    auth: RegistryAuth,
}

impl OciRegistry {
    /// Create a client; `insecure` hosts and loopback hosts are contacted over plain HTTP.
    pub fn new(host: impl Into<String>, insecure: Vec<String>) -> Self {
        let client = |protocol| {
            Client::new(ClientConfig {
                protocol,
                ..Default::default()
            })
        };

        Self {
            https: client(ClientProtocol::Https),
            http: client(ClientProtocol::Http),
            host: host.into(),
            insecure,
            auth: RegistryAuth::Anonymous,
        }
    }

    fn uses_http(&self, registry: &str) -> bool {
        is_loopback_registry(registry) || self.insecure.iter().any(|r| r == registry)
    }

    fn client(&self, reference: &ImageReference) -> &Client {
        if self.uses_http(&reference.registry) {
            &self.http
        } else {
            &self.https
        }
    }

    fn error(&self, reference: &ImageReference, message: String) -> PackError {
        PackError::RegistryError {
            registry: reference.registry.clone(),
            message,
        }
    }

    /// Convert an ImageReference to an oci-distribution Reference.
    fn to_oci_reference(&self, reference: &ImageReference) -> Result<Reference> {
        let ref_str = match reference.digest {
            Some(ref digest) => format!("{}/{}@{}", reference.registry, reference.repository, digest),
            None => format!(
                "{}/{}:{}",
                reference.registry,
                reference.repository,
                reference.reference()
            ),
        };

        ref_str.parse::<Reference>().map_err(|e| {
            PackError::ManifestError(format!("Invalid OCI reference '{}': {}", ref_str, e))
        })
    }

    async fn authorize_push(&self, oci_ref: &Reference, reference: &ImageReference) -> Result<()> {
        self.client(reference)
            .auth(oci_ref, &self.auth, RegistryOperation::Push)
            .await
            .map_err(|e| self.error(reference, format!("Failed to authorize push: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl Registry for OciRegistry {
    fn host(&self) -> &str {
        &self.host
    }

    async fn manifest_get(&self, reference: &ImageReference) -> Result<RawManifest> {
        let oci_ref = self.to_oci_reference(reference)?;

        let (data, digest) = self
            .client(reference)
            .pull_manifest_raw(&oci_ref, &self.auth, media_types::MANIFESTS)
            .await
            .map_err(|e| self.error(reference, format!("Failed to pull manifest: {}", e)))?;

        let manifest = RawManifest::new(data, None)?;
        if !digest.is_empty() && digest != manifest.digest {
            tracing::warn!(
                reference = %reference,
                announced = %digest,
                computed = %manifest.digest,
                "Registry announced a different manifest digest"
            );
        }
        if let Some(ref expected) = reference.digest {
            if expected != &manifest.digest {
                return Err(PackError::ChecksumMismatch {
                    path: reference.full_reference(),
                    expected: expected.clone(),
                    actual: manifest.digest,
                });
            }
        }

        tracing::debug!(
            reference = %reference,
            digest = %manifest.digest,
            media_type = %manifest.media_type,
            "Pulled manifest"
        );
        Ok(manifest)
    }

    async fn blob_get(
        &self,
        reference: &ImageReference,
        digest: &str,
        out: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<()> {
        let oci_ref = self.to_oci_reference(reference)?;
        let descriptor = OciDescriptor {
            digest: digest.to_string(),
            ..Default::default()
        };

        self.client(reference)
            .pull_blob(&oci_ref, &descriptor, out)
            .await
            .map_err(|e| self.error(reference, format!("Failed to pull blob {}: {}", digest, e)))
    }

    async fn manifest_put(&self, reference: &ImageReference, manifest: &RawManifest) -> Result<()> {
        let oci_ref = self.to_oci_reference(reference)?;
        self.authorize_push(&oci_ref, reference).await?;

        let content_type = manifest.media_type.parse().map_err(|e| {
            PackError::ManifestError(format!(
                "Invalid media type '{}': {}",
                manifest.media_type, e
            ))
        })?;

        let url = self
            .client(reference)
            .push_manifest_raw(&oci_ref, manifest.data.clone(), content_type)
            .await
            .map_err(|e| self.error(reference, format!("Failed to push manifest: {}", e)))?;

        tracing::debug!(reference = %reference, url = %url, "Pushed manifest");
        Ok(())
    }

    async fn blob_put(&self, reference: &ImageReference, digest: &str, data: Vec<u8>) -> Result<()> {
        let oci_ref = self.to_oci_reference(reference)?;
        self.authorize_push(&oci_ref, reference).await?;

        self.client(reference)
            .push_blob(&oci_ref, &data, digest)
            .await
            .map_err(|e| self.error(reference, format!("Failed to push blob {}: {}", digest, e)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_oci_reference_with_tag() {
        let registry = OciRegistry::new("ghcr.io", Vec::new());
        let reference = ImageReference::parse("ghcr.io/arangodb/server:3.12").unwrap();
        let oci_ref = registry.to_oci_reference(&reference).unwrap();
        assert_eq!(oci_ref.to_string(), "ghcr.io/arangodb/server:3.12");
    }

    #[test]
    fn test_to_oci_reference_with_digest() {
        let registry = OciRegistry::new("ghcr.io", Vec::new());
        let digest = "sha256:abcdef1234567890abcdef1234567890abcdef1234567890abcdef1234567890";
        let reference = ImageReference::parse("ghcr.io/arangodb/server:3.12")
            .unwrap()
            .with_digest(digest);
        let oci_ref = registry.to_oci_reference(&reference).unwrap();
        assert_eq!(oci_ref.digest(), Some(digest));
    }

    #[test]
    fn test_protocol_follows_reference_registry() {
        let registry = OciRegistry::new("mirror.internal", vec!["mirror.internal".to_string()]);

        // Registries named only by chart values are not known up front.
        assert!(registry.uses_http("localhost:5000"));
        assert!(registry.uses_http("127.0.0.1:5000"));
        assert!(registry.uses_http("mirror.internal"));
        assert!(!registry.uses_http("ghcr.io"));

        let local = ImageReference::parse("localhost:5000/arangodb/server:3.12").unwrap();
        assert!(std::ptr::eq(registry.client(&local), &registry.http));
        let remote = ImageReference::parse("ghcr.io/arangodb/server:3.12").unwrap();
        assert!(std::ptr::eq(registry.client(&remote), &registry.https));
    }

    #[test]
    fn test_host() {
        let registry = OciRegistry::new("registry.local:5000", vec!["registry.local:5000".to_string()]);
        assert_eq!(registry.host(), "registry.local:5000");
    }
}
