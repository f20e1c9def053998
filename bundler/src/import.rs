//! Import pipeline.
//!
//! Republishes a bundle archive into a destination registry. Content is
//! pushed bottom-up: blobs and child manifests finish before the manifest
//! that references them. Every archived object is checked against its
//! digest before it is pushed.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chartpack_core::error::{PackError, Result};
use chartpack_core::DEFAULT_CONCURRENCY;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;

use crate::archive::ArchiveReader;
use crate::bundle::{self, Proto, ProtoChart};
use crate::cache::sha256_hex;
use crate::executor::{self, TaskHandle};
use crate::oci::manifest::{is_blob_type, is_manifest_type, Descriptor, Manifest};
use crate::oci::{ImageReference, RawManifest, Registry};
use crate::package::{Package, PackageSpec};

/// Result of a successful import.
#[derive(Debug, Clone)]
pub struct ImportOutcome {
    /// Descriptor read from the archive.
    pub proto: Proto,
    /// One entry per archived chart, images rebound to the destination.
    pub package: Package,
}

pub struct Importer {
    registry: Arc<dyn Registry>,
    concurrency: usize,
}

impl Importer {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self {
            registry,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub async fn import(&self, input: &Path) -> Result<ImportOutcome> {
        let start = Instant::now();
        let archive = ArchiveReader::open(input)?;
        let proto = Proto::from_yaml(&archive.read(bundle::DESCRIPTOR_PATH)?)?;

        tracing::info!(
            input = %input.display(),
            registry = %self.registry.host(),
            charts = proto.charts.len(),
            manifests = proto.manifests.len(),
            "Starting import"
        );

        let run = Arc::new(ImportRun {
            registry: Arc::clone(&self.registry),
            archive,
            package: Mutex::new(Package::default()),
        });

        let root = Arc::clone(&run);
        let descriptor = proto.clone();
        executor::run(self.concurrency, move |h| root.import_all(h, descriptor)).await?;

        let package = std::mem::take(&mut *run.package.lock());

        tracing::info!(
            input = %input.display(),
            registry = %self.registry.host(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Import finished"
        );
        Ok(ImportOutcome { proto, package })
    }
}

struct ImportRun {
    registry: Arc<dyn Registry>,
    archive: ArchiveReader,
    package: Mutex<Package>,
}

impl ImportRun {
    fn import_all(self: Arc<Self>, h: TaskHandle, proto: Proto) -> BoxFuture<'static, Result<()>> {
        async move {
            let host = self.registry.host().to_string();
            let mut errors = Vec::new();

            for (image, digest) in &proto.manifests {
                match ImageReference::parse(&format!("{}/{}", host, image)) {
                    Ok(reference) => {
                        let this = Arc::clone(&self);
                        let digest = digest.clone();
                        h.run_async(move |h| this.import_manifest(h, reference, digest));
                    }
                    Err(e) => errors.push(e),
                }
            }

            h.wait_for_children().await;

            for (name, chart) in &proto.charts {
                if let Err(e) = self.package_chart(&host, name, chart) {
                    errors.push(e);
                }
            }

            match PackError::merge(errors) {
                Some(error) => Err(error),
                None => Ok(()),
            }
        }
        .boxed()
    }

    fn package_chart(&self, host: &str, name: &str, chart: &ProtoChart) -> Result<()> {
        let data = self.archive.read(&bundle::chart_path(name, &chart.version))?;

        let images: BTreeMap<_, _> = chart
            .images
            .iter()
            .map(|(key, image)| (key.clone(), image.with_registry(host)))
            .collect();

        let spec = PackageSpec {
            stage: None,
            version: chart.version.clone(),
            chart: Some(data),
            overrides: serde_json::json!({ "images": images }),
        };

        self.package.lock().packages.insert(name.to_string(), spec);
        tracing::info!(chart = %name, version = %chart.version, "Packaged chart");
        Ok(())
    }

    fn import_manifest(
        self: Arc<Self>,
        h: TaskHandle,
        reference: ImageReference,
        digest: String,
    ) -> BoxFuture<'static, Result<()>> {
        async move {
            let start = Instant::now();
            let data = self.read_verified(&bundle::manifest_path(&digest), &digest)?;
            let manifest = RawManifest::new(data, None)?;

            tracing::info!(manifest = %reference, digest = %digest, "Importing manifest");

            match manifest.parse()? {
                Manifest::Index(index) => {
                    for entry in index.manifests {
                        if entry.platform.is_none() {
                            tracing::debug!(
                                manifest = %reference,
                                digest = %entry.digest,
                                "Skipping index entry without platform"
                            );
                            continue;
                        }

                        if is_manifest_type(&entry.media_type) {
                            let this = Arc::clone(&self);
                            let child = reference.with_digest(&entry.digest);
                            let child_digest = bundle::digest_hex(&entry.digest)?.to_string();
                            h.run_async(move |h| this.import_manifest(h, child, child_digest));
                        } else if is_blob_type(&entry.media_type) {
                            self.spawn_blob(&h, &reference, entry);
                        } else {
                            tracing::debug!(
                                manifest = %reference,
                                media_type = %entry.media_type,
                                "Skipping unsupported index entry"
                            );
                        }
                    }
                }
                Manifest::Image(image) => {
                    for descriptor in image.config.into_iter().chain(image.layers) {
                        self.spawn_blob(&h, &reference, descriptor);
                    }
                }
                Manifest::Schema1(schema1) => {
                    for layer in schema1.fs_layers {
                        let descriptor = Descriptor {
                            media_type: String::new(),
                            digest: layer.blob_sum,
                            size: 0,
                            platform: None,
                        };
                        self.spawn_blob(&h, &reference, descriptor);
                    }
                }
                Manifest::Unsupported(media_type) => {
                    tracing::debug!(
                        manifest = %reference,
                        media_type = %media_type,
                        "Skipping unsupported manifest content"
                    );
                }
            }

            h.wait_for_children().await;

            self.registry.manifest_put(&reference, &manifest).await?;

            tracing::info!(
                manifest = %reference,
                digest = %digest,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Imported manifest"
            );
            Ok(())
        }
        .boxed()
    }

    fn spawn_blob(self: &Arc<Self>, h: &TaskHandle, reference: &ImageReference, descriptor: Descriptor) {
        let this = Arc::clone(self);
        let reference = reference.clone();
        h.run_async(move |h| this.import_blob(h, reference, descriptor));
    }

    fn import_blob(
        self: Arc<Self>,
        _h: TaskHandle,
        reference: ImageReference,
        descriptor: Descriptor,
    ) -> BoxFuture<'static, Result<()>> {
        async move {
            let digest = bundle::digest_hex(&descriptor.digest)?.to_string();
            let data = self.read_verified(&bundle::blob_path(&digest), &digest)?;

            tracing::info!(blob = %digest, size = data.len(), manifest = %reference, "Importing blob");
            self.registry
                .blob_put(&reference, &format!("sha256:{}", digest), data)
                .await
        }
        .boxed()
    }

    /// Read an archive entry and check it hashes to `expected` (hex).
    fn read_verified(&self, path: &str, expected: &str) -> Result<Vec<u8>> {
        let data = self.archive.read(path)?;
        let actual = sha256_hex(&data);
        if actual != expected {
            return Err(PackError::ChecksumMismatch {
                path: path.to_string(),
                expected: expected.to_string(),
                actual,
            });
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveWriter;
    use crate::bundle::ImageRef;
    use crate::oci::manifest::media_types;
    use crate::oci::MemoryRegistry;
    use tempfile::TempDir;

    /// Write an archive holding `objects` plus a descriptor.
    fn write_archive(path: &Path, proto: &Proto, objects: &[(String, Vec<u8>)]) {
        let mut writer = ArchiveWriter::create(path).unwrap();
        for (name, data) in objects {
            writer.append_bytes(name, data).unwrap();
        }
        writer
            .append_bytes(bundle::DESCRIPTOR_PATH, &proto.to_yaml().unwrap())
            .unwrap();
        writer.finish().unwrap();
    }

    fn blob(data: &[u8]) -> (String, Vec<u8>) {
        (bundle::blob_path(&sha256_hex(data)), data.to_vec())
    }

    fn manifest_entry(manifest: &RawManifest) -> (String, Vec<u8>) {
        (bundle::manifest_path(manifest.digest_hex()), manifest.data.clone())
    }

    #[tokio::test]
    async fn test_import_pushes_blobs_before_manifest() {
        let tmp = TempDir::new().unwrap();
        let source = MemoryRegistry::new("source.local");
        let manifest = source
            .insert_image("pause", None, b"config", &[b"layer"])
            .unwrap();

        let mut proto = Proto::default();
        proto
            .manifests
            .insert("pause:3.5".to_string(), manifest.digest_hex().to_string());

        let path = tmp.path().join("bundle.tar");
        write_archive(
            &path,
            &proto,
            &[manifest_entry(&manifest), blob(b"config"), blob(b"layer")],
        );

        let dest = Arc::new(MemoryRegistry::new("registry.local:5000"));
        let outcome = Importer::new(dest.clone()).import(&path).await.unwrap();
        assert_eq!(outcome.proto, proto);

        let stored = dest.manifest("pause", "3.5").unwrap();
        assert_eq!(stored.digest, manifest.digest);

        let pushes = dest.pushes();
        assert_eq!(pushes.len(), 3);
        assert_eq!(pushes[2], "manifest pause:3.5");
    }

    #[tokio::test]
    async fn test_import_skips_index_entries_without_platform() {
        let tmp = TempDir::new().unwrap();
        let source = MemoryRegistry::new("source.local");
        let image = source
            .insert_image("pause", None, b"config", &[b"layer"])
            .unwrap();
        let attestation = source
            .insert_image("pause", None, b"attestation", &[b"statement"])
            .unwrap();
        let index = source
            .insert_index(
                "pause",
                None,
                &[(&image, Some(("linux", "amd64"))), (&attestation, None)],
            )
            .unwrap();
        assert_eq!(index.media_type, media_types::OCI_INDEX);

        let mut proto = Proto::default();
        proto
            .manifests
            .insert("pause:3.5".to_string(), index.digest_hex().to_string());

        // The attestation's content is deliberately absent from the archive.
        let path = tmp.path().join("bundle.tar");
        write_archive(
            &path,
            &proto,
            &[
                manifest_entry(&index),
                manifest_entry(&image),
                blob(b"config"),
                blob(b"layer"),
            ],
        );

        let dest = Arc::new(MemoryRegistry::new("registry.local:5000"));
        let result = Importer::new(dest.clone()).import(&path).await;

        assert!(dest.manifest("pause", &image.digest).is_some());
        assert!(dest.manifest("pause", &attestation.digest).is_none());
        // The index references the skipped entry, so the destination refuses it.
        assert!(result.is_err());
        assert!(dest.manifest("pause", "3.5").is_none());
    }

    #[tokio::test]
    async fn test_import_rejects_tampered_content() {
        let tmp = TempDir::new().unwrap();
        let source = MemoryRegistry::new("source.local");
        let manifest = source
            .insert_image("pause", None, b"config", &[b"layer"])
            .unwrap();

        let mut proto = Proto::default();
        proto
            .manifests
            .insert("pause:3.5".to_string(), manifest.digest_hex().to_string());

        let layer_path = bundle::blob_path(&sha256_hex(b"layer"));
        let path = tmp.path().join("bundle.tar");
        write_archive(
            &path,
            &proto,
            &[
                manifest_entry(&manifest),
                blob(b"config"),
                (layer_path, b"tampered".to_vec()),
            ],
        );

        let dest = Arc::new(MemoryRegistry::new("registry.local:5000"));
        let err = Importer::new(dest.clone()).import(&path).await.unwrap_err();

        let text = err.to_string();
        assert!(text.contains("Checksum mismatch") || text.contains("checksum"), "{text}");
        assert!(!dest.has_blob("pause", &format!("sha256:{}", sha256_hex(b"layer"))));
        assert!(dest.manifest("pause", "3.5").is_none());
    }

    #[tokio::test]
    async fn test_import_rebinds_chart_images() {
        let tmp = TempDir::new().unwrap();

        let mut chart = ProtoChart {
            version: "1.0.0".to_string(),
            ..Default::default()
        };
        chart
            .images
            .insert("main".to_string(), ImageRef::new("pause", "3.5"));
        let mut proto = Proto::default();
        proto.charts.insert("demo".to_string(), chart);

        let path = tmp.path().join("bundle.tar");
        write_archive(
            &path,
            &proto,
            &[(bundle::chart_path("demo", "1.0.0"), b"chart-bytes".to_vec())],
        );

        let dest = Arc::new(MemoryRegistry::new("registry.local:5000"));
        let outcome = Importer::new(dest).import(&path).await.unwrap();

        let spec = &outcome.package.packages["demo"];
        assert_eq!(spec.version, "1.0.0");
        assert_eq!(spec.chart.as_deref(), Some(&b"chart-bytes"[..]));
        assert_eq!(spec.stage, None);
        assert_eq!(
            spec.overrides["images"]["main"]["registry"],
            "registry.local:5000"
        );
        assert_eq!(spec.overrides["images"]["main"]["image"], "pause");
    }

    #[tokio::test]
    async fn test_import_missing_chart_is_reported() {
        let tmp = TempDir::new().unwrap();
        let mut proto = Proto::default();
        proto.charts.insert(
            "demo".to_string(),
            ProtoChart {
                version: "1.0.0".to_string(),
                ..Default::default()
            },
        );

        let path = tmp.path().join("bundle.tar");
        write_archive(&path, &proto, &[]);

        let dest = Arc::new(MemoryRegistry::new("registry.local:5000"));
        let err = Importer::new(dest).import(&path).await.unwrap_err();
        assert!(matches!(err, PackError::NotFound(_)));
    }
}
