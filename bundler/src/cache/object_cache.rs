//! Content-addressed cache for downloaded bundle objects.
//!
//! Objects are addressed by a logical path (e.g. `blobs/<hex>`) and verified
//! against a SHA256 checksum before they become visible. Writes land in a
//! private temp file under `<root>/.tmp/` and are renamed into place once the
//! checksum matches, so an indexed path always holds the indexed content.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chartpack_core::error::{PackError, Result};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tokio::io::AsyncWrite;

/// Directory (relative to the cache root) holding in-progress writes.
const TMP_DIR: &str = ".tmp";

/// Outcome of [`ObjectCache::cache_object`].
pub enum CacheLookup {
    /// The object is already cached with the requested checksum.
    Exists,
    /// Another writer for the same path is in flight; retry later.
    InFlight,
    /// The caller should stream the object into this writer.
    Writer(CacheWriter),
}

impl std::fmt::Debug for CacheLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheLookup::Exists => write!(f, "Exists"),
            CacheLookup::InFlight => write!(f, "InFlight"),
            CacheLookup::Writer(w) => write!(f, "Writer({})", w.path),
        }
    }
}

#[derive(Default)]
struct CacheState {
    /// Logical path → verified checksum.
    index: HashMap<String, String>,
    /// Paths with a writer currently open.
    in_flight: HashSet<String>,
    saved: u64,
}

struct CacheInner {
    root: PathBuf,
    tmp_dir: PathBuf,
    state: Mutex<CacheState>,
}

impl CacheInner {
    fn release(&self, path: &str) {
        self.state.lock().in_flight.remove(path);
    }
}

/// Checksum-verified object cache. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ObjectCache {
    inner: Arc<CacheInner>,
}

impl ObjectCache {
    /// Open a cache rooted at `root`, creating the directory if needed.
    ///
    /// The index starts empty; files left by earlier runs are adopted lazily
    /// when a caller asks for them with a matching checksum.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let tmp_dir = root.join(TMP_DIR);
        std::fs::create_dir_all(&tmp_dir).map_err(|e| {
            PackError::CacheError(format!(
                "Failed to create cache directory {}: {}",
                tmp_dir.display(),
                e
            ))
        })?;

        Ok(Self {
            inner: Arc::new(CacheInner {
                root: root.to_path_buf(),
                tmp_dir,
                state: Mutex::new(CacheState::default()),
            }),
        })
    }

    /// Root directory of the cache.
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Claim `path` for writing an object with `checksum`.
    ///
    /// Returns [`CacheLookup::Exists`] when the object is already present
    /// (indexed, or found on disk with a matching checksum),
    /// [`CacheLookup::InFlight`] when another writer holds the path, and a
    /// fresh [`CacheWriter`] otherwise. A path already indexed under a
    /// different checksum is a [`PackError::CacheConflict`].
    pub fn cache_object(&self, checksum: &str, path: &str) -> Result<CacheLookup> {
        validate_path(path)?;

        {
            let mut state = self.inner.state.lock();
            if let Some(recorded) = state.index.get(path) {
                if recorded == checksum {
                    return Ok(CacheLookup::Exists);
                }
                return Err(PackError::CacheConflict {
                    path: path.to_string(),
                    recorded: recorded.clone(),
                    requested: checksum.to_string(),
                });
            }
            if !state.in_flight.insert(path.to_string()) {
                return Ok(CacheLookup::InFlight);
            }
        }

        let target = self.inner.root.join(path);
        if target.is_file() {
            match hash_file(&target) {
                Ok(actual) if actual == checksum => {
                    let mut state = self.inner.state.lock();
                    state.index.insert(path.to_string(), checksum.to_string());
                    state.in_flight.remove(path);

                    tracing::debug!(path, checksum, "Adopted existing cache object");
                    return Ok(CacheLookup::Exists);
                }
                Ok(actual) => {
                    tracing::debug!(
                        path,
                        expected = checksum,
                        actual = %actual,
                        "Existing cache file has a different checksum, replacing"
                    );
                }
                Err(e) => {
                    self.inner.release(path);
                    return Err(e);
                }
            }
        }

        let file = match NamedTempFile::new_in(&self.inner.tmp_dir) {
            Ok(file) => file,
            Err(e) => {
                self.inner.release(path);
                return Err(PackError::CacheError(format!(
                    "Failed to create temp file in {}: {}",
                    self.inner.tmp_dir.display(),
                    e
                )));
            }
        };

        Ok(CacheLookup::Writer(CacheWriter {
            cache: Arc::clone(&self.inner),
            path: path.to_string(),
            expected: checksum.to_string(),
            file: Some(file),
            hasher: Sha256::new(),
            released: false,
        }))
    }

    /// Open a cached object.
    ///
    /// Returns `None` unless the index records `path` with exactly `checksum`,
    /// even if some file happens to exist at that location.
    pub fn get(&self, checksum: &str, path: &str) -> Result<Option<File>> {
        validate_path(path)?;

        let indexed = self.inner.state.lock().index.get(path).cloned();
        match indexed {
            Some(recorded) if recorded == checksum => {
                let file = File::open(self.inner.root.join(path)).map_err(|e| {
                    PackError::CacheError(format!("Failed to open cached {}: {}", path, e))
                })?;
                Ok(Some(file))
            }
            _ => Ok(None),
        }
    }

    /// Number of objects committed by this cache instance.
    pub fn saved(&self) -> u64 {
        self.inner.state.lock().saved
    }
}

/// Writer returned by [`ObjectCache::cache_object`].
///
/// Every byte is forwarded to a private temp file and fed to a running
/// SHA256. Call [`CacheWriter::finish`] to verify and commit; dropping the
/// writer unfinished abandons the object and frees the path for retries.
pub struct CacheWriter {
    cache: Arc<CacheInner>,
    path: String,
    expected: String,
    file: Option<NamedTempFile>,
    hasher: Sha256,
    released: bool,
}

impl CacheWriter {
    /// Verify the checksum and move the object into place.
    pub fn finish(mut self) -> Result<()> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| PackError::CacheError(format!("Writer for {} already closed", self.path)))?;
        file.flush()?;

        let actual = hex::encode(self.hasher.finalize_reset());
        if actual != self.expected {
            // The rejected bytes stay behind as an orphaned temp file.
            if let Err(e) = file.keep() {
                tracing::warn!(path = %self.path, error = %e, "Failed to keep rejected temp file");
            }
            self.cache.release(&self.path);
            self.released = true;
            return Err(PackError::ChecksumMismatch {
                path: self.path.clone(),
                expected: self.expected.clone(),
                actual,
            });
        }

        let target = self.cache.root.join(&self.path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                PackError::CacheError(format!(
                    "Failed to create directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let mut state = self.cache.state.lock();
        file.persist(&target).map_err(|e| {
            PackError::CacheError(format!(
                "Failed to move object into {}: {}",
                target.display(),
                e.error
            ))
        })?;
        state.index.insert(self.path.clone(), self.expected.clone());
        state.in_flight.remove(&self.path);
        state.saved += 1;
        drop(state);
        self.released = true;

        tracing::debug!(path = %self.path, checksum = %self.expected, "Cached object");
        Ok(())
    }
}

impl Write for CacheWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let file = self.file.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "cache writer already closed")
        })?;
        let n = file.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// Lets registry clients stream a download straight into the cache.
///
/// The temp file is local, so each poll completes the write synchronously.
impl AsyncWrite for CacheWriter {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Poll::Ready(self.get_mut().write(buf))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(self.get_mut().flush())
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.poll_flush(cx)
    }
}

impl Drop for CacheWriter {
    fn drop(&mut self) {
        if !self.released {
            self.cache.release(&self.path);
        }
    }
}

/// Hex SHA256 of a byte slice.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Logical paths must stay inside the cache root and off the temp area.
fn validate_path(path: &str) -> Result<()> {
    let p = Path::new(path);
    let mut components = p.components().peekable();
    if components.peek().is_none() {
        return Err(PackError::CacheError("Empty cache path".to_string()));
    }
    for (i, component) in p.components().enumerate() {
        match component {
            Component::Normal(name) if i == 0 && name == TMP_DIR => {
                return Err(PackError::CacheError(format!("Reserved cache path: {}", path)));
            }
            Component::Normal(_) => {}
            _ => {
                return Err(PackError::CacheError(format!("Invalid cache path: {}", path)));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;

    fn write_object(cache: &ObjectCache, path: &str, data: &[u8]) -> Result<()> {
        match cache.cache_object(&sha256_hex(data), path)? {
            CacheLookup::Writer(mut w) => {
                w.write_all(data)?;
                w.finish()
            }
            other => panic!("expected writer, got {:?}", other),
        }
    }

    #[test]
    fn test_new_creates_directories() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("cache");
        let cache = ObjectCache::new(&root).unwrap();
        assert!(root.join(".tmp").is_dir());
        assert_eq!(cache.root(), root.as_path());
        assert_eq!(cache.saved(), 0);
    }

    #[test]
    fn test_write_then_get() {
        let tmp = TempDir::new().unwrap();
        let cache = ObjectCache::new(tmp.path()).unwrap();
        let data = b"layer bytes";

        write_object(&cache, "blobs/abc", data).unwrap();
        assert_eq!(cache.saved(), 1);
        assert!(tmp.path().join("blobs/abc").is_file());

        let mut file = cache.get(&sha256_hex(data), "blobs/abc").unwrap().unwrap();
        let mut content = Vec::new();
        file.read_to_end(&mut content).unwrap();
        assert_eq!(content, data);
    }

    #[tokio::test]
    async fn test_async_writes_are_hashed() {
        use tokio::io::AsyncWriteExt;

        let tmp = TempDir::new().unwrap();
        let cache = ObjectCache::new(tmp.path()).unwrap();
        let data = b"streamed in two chunks";

        let mut writer = match cache.cache_object(&sha256_hex(data), "blobs/s").unwrap() {
            CacheLookup::Writer(w) => w,
            other => panic!("expected writer, got {:?}", other),
        };
        // std::io::Write is in scope too.
        AsyncWriteExt::write_all(&mut writer, &data[..8]).await.unwrap();
        AsyncWriteExt::write_all(&mut writer, &data[8..]).await.unwrap();
        writer.finish().unwrap();

        assert_eq!(cache.saved(), 1);
        assert!(cache.get(&sha256_hex(data), "blobs/s").unwrap().is_some());
    }

    #[test]
    fn test_idempotent_after_commit() {
        let tmp = TempDir::new().unwrap();
        let cache = ObjectCache::new(tmp.path()).unwrap();
        let data = b"manifest";
        let checksum = sha256_hex(data);

        write_object(&cache, "manifests/m", data).unwrap();
        assert!(matches!(
            cache.cache_object(&checksum, "manifests/m").unwrap(),
            CacheLookup::Exists
        ));
        assert!(matches!(
            cache.cache_object(&checksum, "manifests/m").unwrap(),
            CacheLookup::Exists
        ));
        assert_eq!(cache.saved(), 1);
    }

    #[test]
    fn test_conflicting_checksum_is_error() {
        let tmp = TempDir::new().unwrap();
        let cache = ObjectCache::new(tmp.path()).unwrap();

        write_object(&cache, "p", b"first").unwrap();
        let err = cache.cache_object(&sha256_hex(b"second"), "p").unwrap_err();
        assert!(matches!(err, PackError::CacheConflict { .. }));
    }

    #[test]
    fn test_checksum_mismatch_rejects_object() {
        let tmp = TempDir::new().unwrap();
        let cache = ObjectCache::new(tmp.path()).unwrap();
        let declared = sha256_hex(b"expected content");

        let mut writer = match cache.cache_object(&declared, "blobs/x").unwrap() {
            CacheLookup::Writer(w) => w,
            other => panic!("expected writer, got {:?}", other),
        };
        writer.write_all(b"something else").unwrap();
        let err = writer.finish().unwrap_err();

        assert!(matches!(err, PackError::ChecksumMismatch { .. }));
        assert_eq!(cache.saved(), 0);
        assert!(cache.get(&declared, "blobs/x").unwrap().is_none());
        assert!(!tmp.path().join("blobs/x").exists());

        // The path is free again for a correct retry.
        assert!(matches!(
            cache.cache_object(&declared, "blobs/x").unwrap(),
            CacheLookup::Writer(_)
        ));
    }

    #[test]
    fn test_concurrent_writer_is_in_flight() {
        let tmp = TempDir::new().unwrap();
        let cache = ObjectCache::new(tmp.path()).unwrap();
        let data = b"shared blob";
        let checksum = sha256_hex(data);

        let mut first = match cache.cache_object(&checksum, "blobs/s").unwrap() {
            CacheLookup::Writer(w) => w,
            other => panic!("expected writer, got {:?}", other),
        };
        assert!(matches!(
            cache.cache_object(&checksum, "blobs/s").unwrap(),
            CacheLookup::InFlight
        ));

        first.write_all(data).unwrap();
        first.finish().unwrap();
        assert!(matches!(
            cache.cache_object(&checksum, "blobs/s").unwrap(),
            CacheLookup::Exists
        ));
    }

    #[test]
    fn test_dropped_writer_frees_path() {
        let tmp = TempDir::new().unwrap();
        let cache = ObjectCache::new(tmp.path()).unwrap();
        let checksum = sha256_hex(b"data");

        let writer = cache.cache_object(&checksum, "blobs/d").unwrap();
        drop(writer);

        assert!(matches!(
            cache.cache_object(&checksum, "blobs/d").unwrap(),
            CacheLookup::Writer(_)
        ));
    }

    #[test]
    fn test_adopts_existing_file_from_previous_run() {
        let tmp = TempDir::new().unwrap();
        let data = b"from an earlier run";
        std::fs::create_dir_all(tmp.path().join("blobs")).unwrap();
        std::fs::write(tmp.path().join("blobs/old"), data).unwrap();

        let cache = ObjectCache::new(tmp.path()).unwrap();
        assert!(matches!(
            cache.cache_object(&sha256_hex(data), "blobs/old").unwrap(),
            CacheLookup::Exists
        ));
        assert_eq!(cache.saved(), 0);
        assert!(cache.get(&sha256_hex(data), "blobs/old").unwrap().is_some());
    }

    #[test]
    fn test_get_requires_indexed_checksum() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("stray"), b"unindexed").unwrap();
        let cache = ObjectCache::new(tmp.path()).unwrap();

        assert!(cache.get(&sha256_hex(b"unindexed"), "stray").unwrap().is_none());
    }

    #[test]
    fn test_rejects_escaping_paths() {
        let tmp = TempDir::new().unwrap();
        let cache = ObjectCache::new(tmp.path()).unwrap();

        for path in ["../outside", "/abs/path", "", ".tmp/x"] {
            let err = cache.cache_object("00", path).unwrap_err();
            assert!(matches!(err, PackError::CacheError(_)), "path {path:?}");
        }
    }
}
