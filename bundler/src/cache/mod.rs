//! Download cache shared by export runs.
//!
//! `ObjectCache` collapses concurrent downloads of the same object into one
//! and only exposes objects whose SHA256 matched on write.

pub mod object_cache;

pub use object_cache::{sha256_hex, CacheLookup, CacheWriter, ObjectCache};
