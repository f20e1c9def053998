//! OCI registry plumbing.
//!
//! - `reference`: image reference parsing
//! - `manifest`: byte-exact manifests and the media types walked by the pipelines
//! - `registry`: the [`Registry`] seam and its `oci-distribution` implementation
//! - `memory`: an in-process registry

pub mod manifest;
pub mod memory;
pub mod reference;
pub mod registry;

pub use manifest::{Descriptor, Manifest, RawManifest};
pub use memory::MemoryRegistry;
pub use reference::ImageReference;
pub use registry::{OciRegistry, Registry};
