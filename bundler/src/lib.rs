//! Chartpack - offline bundling of Helm charts and their container images.
//!
//! Export walks charts and images down to every manifest and blob and writes
//! them into a single archive; import republishes an archive into another
//! registry and produces the package specification to install from it.

#![allow(clippy::result_large_err)]

pub mod archive;
pub mod bundle;
pub mod cache;
pub mod chart;
pub mod executor;
pub mod export;
pub mod import;
pub mod oci;
pub mod package;

// Re-export common types
pub use archive::{ArchiveReader, ArchiveWriter};
pub use bundle::{ImageRef, Proto, ProtoChart};
pub use cache::{CacheLookup, CacheWriter, ObjectCache};
pub use chart::{ChartSource, HelmIndexSource, RegistryChartSource};
pub use export::{ChartSelection, ExportRequest, Exporter};
pub use import::{ImportOutcome, Importer};
pub use oci::{ImageReference, MemoryRegistry, OciRegistry, RawManifest, Registry};
pub use package::{Package, PackageRelease, PackageSpec};

/// Chartpack version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
