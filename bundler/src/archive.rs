//! Flat tar container used as the bundle archive.
//!
//! Entries are plain files named `proto.yaml`, `chart/...`, `manifests/...`
//! and `blobs/...`. The writer appends each name at most once; the reader
//! indexes entry offsets on open and serves random-access reads afterwards.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use chartpack_core::error::{PackError, Result};

/// Append-only archive writer.
pub struct ArchiveWriter {
    builder: tar::Builder<File>,
    entries: HashSet<String>,
}

impl ArchiveWriter {
    /// Create (or truncate) the archive at `path`.
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).map_err(|e| {
            PackError::ArchiveError(format!("Failed to create {}: {}", path.display(), e))
        })?;

        Ok(Self {
            builder: tar::Builder::new(file),
            entries: HashSet::new(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains(name)
    }

    /// Append `size` bytes read from `data` as entry `name`.
    pub fn append<R: Read>(&mut self, name: &str, data: R, size: u64) -> Result<()> {
        if !self.entries.insert(name.to_string()) {
            return Err(PackError::ArchiveError(format!("Duplicate entry: {}", name)));
        }

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(size);
        header.set_mode(0o644);
        header.set_mtime(0);

        self.builder
            .append_data(&mut header, name, data)
            .map_err(|e| PackError::ArchiveError(format!("Failed to append {}: {}", name, e)))
    }

    pub fn append_bytes(&mut self, name: &str, data: &[u8]) -> Result<()> {
        self.append(name, data, data.len() as u64)
    }

    /// Write the trailer and flush the archive to disk.
    pub fn finish(self) -> Result<()> {
        let file = self
            .builder
            .into_inner()
            .map_err(|e| PackError::ArchiveError(format!("Failed to finalize archive: {}", e)))?;
        file.sync_all()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct EntryLocation {
    offset: u64,
    size: u64,
}

/// Read-only view over an existing archive.
pub struct ArchiveReader {
    path: PathBuf,
    entries: HashMap<String, EntryLocation>,
}

impl ArchiveReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            PackError::ArchiveError(format!("Failed to open {}: {}", path.display(), e))
        })?;

        let mut archive = tar::Archive::new(file);
        let mut entries = HashMap::new();
        let iter = archive
            .entries()
            .map_err(|e| PackError::ArchiveError(format!("Failed to read archive: {}", e)))?;

        for entry in iter {
            let entry =
                entry.map_err(|e| PackError::ArchiveError(format!("Corrupt archive entry: {}", e)))?;
            if entry.header().entry_type() != tar::EntryType::Regular {
                continue;
            }
            let name = entry
                .path()
                .map_err(|e| PackError::ArchiveError(format!("Invalid entry name: {}", e)))?
                .to_string_lossy()
                .into_owned();
            entries.insert(
                name,
                EntryLocation {
                    offset: entry.raw_file_position(),
                    size: entry.size(),
                },
            );
        }

        tracing::debug!(
            path = %path.display(),
            entries = entries.len(),
            "Opened bundle archive"
        );

        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry names in sorted order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    /// Read a whole entry into memory.
    pub fn read(&self, name: &str) -> Result<Vec<u8>> {
        let location = self
            .entries
            .get(name)
            .copied()
            .ok_or_else(|| PackError::NotFound(format!("archive entry {}", name)))?;

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(location.offset))?;

        let mut data = Vec::with_capacity(location.size as usize);
        file.take(location.size).read_to_end(&mut data)?;
        if data.len() as u64 != location.size {
            return Err(PackError::ArchiveError(format!(
                "Truncated entry {}: expected {} bytes, read {}",
                name,
                location.size,
                data.len()
            )));
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_and_read_entries() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bundle.tar");

        let mut writer = ArchiveWriter::create(&path).unwrap();
        writer.append_bytes("proto.yaml", b"charts: {}\n").unwrap();
        writer.append_bytes("blobs/aaa", b"first blob").unwrap();
        writer.append_bytes("blobs/bbb", &[0u8; 1500]).unwrap();
        assert!(writer.contains("blobs/aaa"));
        writer.finish().unwrap();

        let reader = ArchiveReader::open(&path).unwrap();
        assert_eq!(reader.len(), 3);
        assert_eq!(reader.names(), vec!["blobs/aaa", "blobs/bbb", "proto.yaml"]);
        assert_eq!(reader.read("blobs/aaa").unwrap(), b"first blob");
        assert_eq!(reader.read("blobs/bbb").unwrap().len(), 1500);
        assert_eq!(reader.read("proto.yaml").unwrap(), b"charts: {}\n");
    }

    #[test]
    fn test_duplicate_entry_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut writer = ArchiveWriter::create(&tmp.path().join("a.tar")).unwrap();

        writer.append_bytes("manifests/x", b"{}").unwrap();
        let err = writer.append_bytes("manifests/x", b"{}").unwrap_err();
        assert!(matches!(err, PackError::ArchiveError(_)));
    }

    #[test]
    fn test_missing_entry_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("empty.tar");
        ArchiveWriter::create(&path).unwrap().finish().unwrap();

        let reader = ArchiveReader::open(&path).unwrap();
        assert!(reader.is_empty());
        assert!(matches!(reader.read("proto.yaml"), Err(PackError::NotFound(_))));
    }

    #[test]
    fn test_open_missing_file() {
        let result = ArchiveReader::open(Path::new("/nonexistent/bundle.tar"));
        assert!(matches!(result, Err(PackError::ArchiveError(_))));
    }
}
