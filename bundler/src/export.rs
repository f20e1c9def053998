//! Export pipeline.
//!
//! Resolves charts, walks every image they declare down to its blobs and
//! writes all of it into a bundle archive. Each chart, image, manifest and
//! blob is its own task on the executor; downloads go through the object
//! cache so repeated exports only fetch what changed.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chartpack_core::error::{PackError, Result};
use chartpack_core::{DEFAULT_CONCURRENCY, DEFAULT_STAGE};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::sync::{watch, Mutex as AsyncMutex};

use crate::archive::ArchiveWriter;
use crate::bundle::{self, ImageRef, Proto, ProtoChart};
use crate::cache::{sha256_hex, CacheLookup, ObjectCache};
use crate::chart::{self, ChartSource};
use crate::executor::{self, TaskHandle};
use crate::oci::manifest::{is_blob_type, is_manifest_type, Descriptor, Manifest};
use crate::oci::{ImageReference, RawManifest, Registry};
use crate::package::Package;

/// Delay between checks of an object another task is downloading.
const IN_FLIGHT_POLL: Duration = Duration::from_secs(1);

/// Chart to export.
#[derive(Debug, Clone, Default)]
pub struct ChartSelection {
    pub version: String,
    /// Overrides the exporter's default stage.
    pub stage: Option<String>,
    /// Packaged chart; skips the chart source when set.
    pub chart: Option<Vec<u8>>,
    /// Values overrides; only `images` is interpreted.
    pub overrides: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default)]
pub struct ExportRequest {
    pub charts: BTreeMap<String, ChartSelection>,
    /// Images exported on their own, outside any chart.
    pub images: Vec<ImageRef>,
}

impl ExportRequest {
    /// Select every chart of a package specification.
    pub fn from_package(package: &Package) -> Self {
        let charts = package
            .packages
            .iter()
            .map(|(name, spec)| {
                let selection = ChartSelection {
                    version: spec.version.clone(),
                    stage: spec.stage.clone(),
                    chart: spec.chart.clone(),
                    overrides: Some(spec.overrides.clone()).filter(|v| !v.is_null()),
                };
                (name.clone(), selection)
            })
            .collect();

        Self {
            charts,
            images: Vec::new(),
        }
    }
}

pub struct Exporter {
    registry: Arc<dyn Registry>,
    charts: Arc<dyn ChartSource>,
    cache: ObjectCache,
    concurrency: usize,
    stage: String,
}

impl Exporter {
    pub fn new(registry: Arc<dyn Registry>, charts: Arc<dyn ChartSource>, cache: ObjectCache) -> Self {
        Self {
            registry,
            charts,
            cache,
            concurrency: DEFAULT_CONCURRENCY,
            stage: DEFAULT_STAGE.to_string(),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Stage used for charts whose selection names none.
    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = stage.into();
        self
    }

    /// Export `request` into a new archive at `output`.
    ///
    /// The archive is finalized with a descriptor of everything that was
    /// exported even when some tasks failed; their merged error is returned.
    /// Charts, images and manifests whose content did not make it into the
    /// archive are left out of the descriptor.
    pub async fn export(&self, request: ExportRequest, output: &Path) -> Result<Proto> {
        let start = Instant::now();
        let archive = ArchiveWriter::create(output)?;

        tracing::info!(
            output = %output.display(),
            charts = request.charts.len(),
            images = request.images.len(),
            concurrency = self.concurrency,
            "Starting export"
        );

        let run = Arc::new(ExportRun {
            registry: Arc::clone(&self.registry),
            charts: Arc::clone(&self.charts),
            cache: self.cache.clone(),
            stage: self.stage.clone(),
            state: Mutex::new(ExportState::default()),
            archive: AsyncMutex::new(Some(archive)),
        });

        let root = Arc::clone(&run);
        let result = executor::run(self.concurrency, move |h| root.export_all(h, request)).await;

        let proto = run.state.lock().proto.clone();
        let archive = run.archive.lock().await.take();
        let finalized = finalize(archive, &proto);

        if let Some(error) = PackError::merge(result.err().into_iter().chain(finalized.err())) {
            tracing::warn!(
                output = %output.display(),
                errors = error.count(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Export finished with errors"
            );
            return Err(error);
        }

        tracing::info!(
            output = %output.display(),
            charts = proto.charts.len(),
            manifests = proto.manifests.len(),
            cached = self.cache.saved(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Export finished"
        );
        Ok(proto)
    }
}

fn finalize(archive: Option<ArchiveWriter>, proto: &Proto) -> Result<()> {
    let mut archive = archive
        .ok_or_else(|| PackError::ArchiveError("Archive already finalized".to_string()))?;
    archive.append_bytes(bundle::DESCRIPTOR_PATH, &proto.to_yaml()?)?;
    archive.finish()
}

#[derive(Default)]
struct ExportState {
    proto: Proto,
    /// Archive paths claimed by a task, each exported once per run.
    ///
    /// The channel turns `Some(true)` once the path is in the archive. It
    /// closes without a value when the owning task gives up on it.
    seen: HashMap<String, watch::Receiver<Option<bool>>>,
}

/// Result of claiming an archive path.
enum Claim {
    /// The caller exports the path and reports success on the sender.
    Owner(watch::Sender<Option<bool>>),
    /// Another task got there first.
    Taken,
}

/// Where the bytes of an object come from on a cache miss.
enum Fetch {
    Bytes(Vec<u8>),
    Blob { reference: ImageReference, digest: String },
}

struct ExportRun {
    registry: Arc<dyn Registry>,
    charts: Arc<dyn ChartSource>,
    cache: ObjectCache,
    stage: String,
    state: Mutex<ExportState>,
    /// Kept apart from `state`: appends copy whole objects.
    archive: AsyncMutex<Option<ArchiveWriter>>,
}

impl ExportRun {
    fn export_all(self: Arc<Self>, h: TaskHandle, request: ExportRequest) -> BoxFuture<'static, Result<()>> {
        async move {
            for (name, selection) in request.charts {
                let this = Arc::clone(&self);
                h.run_async(move |h| this.export_chart(h, name, selection));
            }

            for image in request.images {
                let this = Arc::clone(&self);
                h.run_async(move |h| this.export_image(h, image));
            }

            Ok(())
        }
        .boxed()
    }

    fn export_chart(
        self: Arc<Self>,
        h: TaskHandle,
        name: String,
        selection: ChartSelection,
    ) -> BoxFuture<'static, Result<()>> {
        async move {
            let start = Instant::now();
            let version = selection.version;
            tracing::info!(chart = %name, version = %version, "Extracting chart");

            let data = match selection.chart {
                Some(data) => data,
                None => {
                    let stage = selection.stage.as_deref().unwrap_or(&self.stage);
                    self.charts.fetch(&name, &version, stage).await?
                }
            };

            let mut images = chart::chart_images(&data)?;
            if let Some(ref overrides) = selection.overrides {
                chart::apply_image_overrides(&mut images, overrides)?;
            }

            let mut surviving = BTreeMap::new();
            for (key, image) in images {
                if image.is_test() {
                    tracing::info!(chart = %name, image = %image.full_name(), "Skip test image");
                    continue;
                }

                surviving.insert(key, image.stripped());
                let this = Arc::clone(&self);
                h.run_async(move |h| this.export_image(h, image));
            }

            h.wait_for_children().await;

            let missing: Vec<String> = {
                let state = self.state.lock();
                surviving
                    .values()
                    .map(ImageRef::short_name)
                    .filter(|short| !state.proto.manifests.contains_key(short))
                    .collect()
            };
            if !missing.is_empty() {
                tracing::warn!(chart = %name, version = %version, images = ?missing, "Chart left out, images missing");
                return Ok(());
            }

            let checksum = sha256_hex(&data);
            let path = bundle::chart_path(&name, &version);
            self.save(&h, &checksum, &path, Fetch::Bytes(data)).await?;

            self.state.lock().proto.charts.insert(
                name.clone(),
                ProtoChart {
                    version: version.clone(),
                    images: surviving,
                },
            );

            tracing::info!(
                chart = %name,
                version = %version,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Extracted chart"
            );
            Ok(())
        }
        .boxed()
    }

    fn export_image(self: Arc<Self>, h: TaskHandle, image: ImageRef) -> BoxFuture<'static, Result<()>> {
        async move {
            let start = Instant::now();
            let name = image.full_name();
            tracing::info!(image = %name, "Extracting image");

            let reference = image.to_reference()?;
            let manifest = self.registry.manifest_get(&reference).await?;
            let digest = manifest.digest_hex().to_string();

            let this = Arc::clone(&self);
            h.run_async(move |h| this.export_manifest(h, reference, Some(manifest)));
            h.wait_for_children().await;

            if !self.exported(&h, &bundle::manifest_path(&digest)).await {
                tracing::warn!(image = %name, digest = %digest, "Image left out, manifest missing");
                return Ok(());
            }

            self.state
                .lock()
                .proto
                .manifests
                .insert(image.short_name(), digest.clone());

            tracing::info!(
                image = %name,
                digest = %digest,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Extracted image"
            );
            Ok(())
        }
        .boxed()
    }

    /// Export a manifest and everything it references.
    ///
    /// `manifest` is the already fetched document, if any. The manifest is
    /// written only after every manifest and blob it references.
    fn export_manifest(
        self: Arc<Self>,
        h: TaskHandle,
        reference: ImageReference,
        manifest: Option<RawManifest>,
    ) -> BoxFuture<'static, Result<()>> {
        async move {
            let manifest = match manifest {
                Some(manifest) => manifest,
                None => self.registry.manifest_get(&reference).await?,
            };
            let digest = manifest.digest_hex().to_string();
            let path = bundle::manifest_path(&digest);
            let done = match self.claim(&path) {
                Claim::Owner(done) => done,
                Claim::Taken => {
                    tracing::debug!(manifest = %reference, digest = %digest, "Manifest already exported");
                    return Ok(());
                }
            };

            let start = Instant::now();
            tracing::info!(manifest = %reference, digest = %digest, "Extracting manifest");

            let mut needs = Vec::new();
            match manifest.parse()? {
                Manifest::Index(index) => {
                    for entry in index.manifests {
                        if is_manifest_type(&entry.media_type) {
                            needs.push(bundle::manifest_path(bundle::digest_hex(&entry.digest)?));
                            let this = Arc::clone(&self);
                            let child = reference.with_digest(&entry.digest);
                            h.run_async(move |h| this.export_manifest(h, child, None));
                        } else if is_blob_type(&entry.media_type) {
                            needs.push(self.spawn_blob(&h, &reference, entry)?);
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
                    match image.config {
                        Some(config) => needs.push(self.spawn_blob(&h, &reference, config)?),
                        None => tracing::debug!(manifest = %reference, "Manifest has no config"),
                    }
                    for layer in image.layers {
                        needs.push(self.spawn_blob(&h, &reference, layer)?);
                    }
                }
                Manifest::Schema1(schema1) => {
                    tracing::debug!(manifest = %reference, "Schema 1 manifest has no config");
                    for layer in schema1.fs_layers {
                        let descriptor = Descriptor {
                            media_type: String::new(),
                            digest: layer.blob_sum,
                            size: 0,
                            platform: None,
                        };
                        needs.push(self.spawn_blob(&h, &reference, descriptor)?);
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

            for need in &needs {
                if !self.exported(&h, need).await {
                    tracing::warn!(manifest = %reference, digest = %digest, missing = %need, "Manifest left out");
                    return Ok(());
                }
            }

            self.save(&h, &digest, &path, Fetch::Bytes(manifest.data)).await?;
            done.send_replace(Some(true));

            tracing::info!(
                manifest = %reference,
                digest = %digest,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Extracted manifest"
            );
            Ok(())
        }
        .boxed()
    }

    /// Spawn the export of one blob and return its archive path.
    fn spawn_blob(
        self: &Arc<Self>,
        h: &TaskHandle,
        reference: &ImageReference,
        descriptor: Descriptor,
    ) -> Result<String> {
        let path = bundle::blob_path(bundle::digest_hex(&descriptor.digest)?);
        let this = Arc::clone(self);
        let reference = reference.clone();
        h.run_async(move |h| this.export_blob(h, reference, descriptor));
        Ok(path)
    }

    fn export_blob(
        self: Arc<Self>,
        h: TaskHandle,
        reference: ImageReference,
        descriptor: Descriptor,
    ) -> BoxFuture<'static, Result<()>> {
        async move {
            let digest = bundle::digest_hex(&descriptor.digest)?.to_string();
            let path = bundle::blob_path(&digest);
            let Claim::Owner(done) = self.claim(&path) else {
                return Ok(());
            };

            let start = Instant::now();
            tracing::info!(blob = %digest, size = descriptor.size, "Extracting blob");

            let fetch = Fetch::Blob {
                reference,
                digest: format!("sha256:{}", digest),
            };
            self.save(&h, &digest, &path, fetch).await?;
            done.send_replace(Some(true));

            tracing::info!(
                blob = %digest,
                size = descriptor.size,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Extracted blob"
            );
            Ok(())
        }
        .boxed()
    }

    fn claim(&self, path: &str) -> Claim {
        let mut state = self.state.lock();
        if state.seen.contains_key(path) {
            return Claim::Taken;
        }
        let (done, outcome) = watch::channel(None);
        state.seen.insert(path.to_string(), outcome);
        Claim::Owner(done)
    }

    /// Wait for whoever claimed `path`; true once it is in the archive.
    async fn exported(&self, h: &TaskHandle, path: &str) -> bool {
        let outcome = self.state.lock().seen.get(path).cloned();
        let Some(mut outcome) = outcome else {
            return false;
        };

        h.suspend(async move {
            let exported = outcome
                .wait_for(Option::is_some)
                .await
                .map(|done| *done == Some(true))
                .unwrap_or(false);
            exported
        })
        .await
    }

    /// Make `path` available in the cache, then copy it into the archive.
    async fn save(&self, h: &TaskHandle, checksum: &str, path: &str, fetch: Fetch) -> Result<()> {
        let mut fetch = Some(fetch);

        loop {
            match self.cache.cache_object(checksum, path)? {
                CacheLookup::Exists => {
                    tracing::debug!(path, "Already cached");
                    break;
                }
                CacheLookup::InFlight => {
                    tracing::debug!(path, "Waiting for in-flight download");
                    h.wait(IN_FLIGHT_POLL).await;
                }
                CacheLookup::Writer(mut writer) => {
                    match fetch.take() {
                        Some(Fetch::Bytes(data)) => writer.write_all(&data)?,
                        Some(Fetch::Blob { reference, digest }) => {
                            tracing::debug!(path, "Downloading");
                            self.registry.blob_get(&reference, &digest, &mut writer).await?;
                        }
                        None => {
                            return Err(PackError::TaskError(format!("{} was downloaded twice", path)));
                        }
                    }
                    writer.finish()?;
                    break;
                }
            }
        }

        self.append_cached(checksum, path).await
    }

    async fn append_cached(&self, checksum: &str, path: &str) -> Result<()> {
        let file = self
            .cache
            .get(checksum, path)?
            .ok_or_else(|| PackError::NotFound(format!("cached object {}", path)))?;
        let size = file.metadata()?.len();

        let mut archive = self.archive.lock().await;
        let archive = archive
            .as_mut()
            .ok_or_else(|| PackError::ArchiveError("Archive already finalized".to_string()))?;
        if archive.contains(path) {
            return Ok(());
        }
        archive.append(path, file, size)
    }
}
