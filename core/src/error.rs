use thiserror::Error;

/// Chartpack error types
#[derive(Error, Debug)]
pub enum PackError {
    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Written or archived content does not hash to the expected digest
    #[error("Checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    /// The same logical cache path was requested with a different checksum
    #[error("Cache conflict for {path}: recorded {recorded}, requested {requested}")]
    CacheConflict {
        path: String,
        recorded: String,
        requested: String,
    },

    /// Cache error
    #[error("Cache error: {0}")]
    CacheError(String),

    /// Chart, manifest or archive entry could not be resolved
    #[error("Not found: {0}")]
    NotFound(String),

    /// Container registry error
    #[error("Registry error: {registry} - {message}")]
    RegistryError { registry: String, message: String },

    /// Chart error
    #[error("Chart error: {0}")]
    ChartError(String),

    /// Archive error
    #[error("Archive error: {0}")]
    ArchiveError(String),

    /// OCI manifest error
    #[error("Manifest error: {0}")]
    ManifestError(String),

    /// A task body failed outside of its own error reporting (e.g. panicked)
    #[error("Task error: {0}")]
    TaskError(String),

    /// Several independent failures
    #[error("{} errors occurred: {}", .0.len(), join_errors(.0))]
    Multiple(Vec<PackError>),
}

impl PackError {
    /// Merge a set of errors into one.
    ///
    /// Returns `None` when there is nothing to report and the error itself
    /// when there is exactly one. Nested `Multiple` values are flattened.
    pub fn merge(errors: impl IntoIterator<Item = PackError>) -> Option<PackError> {
        let mut flat = Vec::new();
        for error in errors {
            match error {
                PackError::Multiple(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }

        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ => Some(PackError::Multiple(flat)),
        }
    }

    /// Number of leaf failures carried by this error.
    pub fn count(&self) -> usize {
        match self {
            PackError::Multiple(inner) => inner.len(),
            _ => 1,
        }
    }
}

fn join_errors(errors: &[PackError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<serde_json::Error> for PackError {
    fn from(err: serde_json::Error) -> Self {
        PackError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for PackError {
    fn from(err: serde_yaml::Error) -> Self {
        PackError::SerializationError(err.to_string())
    }
}

/// Result type alias for chartpack operations
pub type Result<T> = std::result::Result<T, PackError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_mismatch_display() {
        let error = PackError::ChecksumMismatch {
            path: "blobs/abc".to_string(),
            expected: "abc".to_string(),
            actual: "def".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Checksum mismatch for blobs/abc: expected abc, got def"
        );
    }

    #[test]
    fn test_registry_error_display() {
        let error = PackError::RegistryError {
            registry: "ghcr.io".to_string(),
            message: "manifest unknown".to_string(),
        };
        assert_eq!(error.to_string(), "Registry error: ghcr.io - manifest unknown");
    }

    #[test]
    fn test_merge_empty() {
        assert!(PackError::merge(Vec::new()).is_none());
    }

    #[test]
    fn test_merge_single_is_unwrapped() {
        let merged = PackError::merge(vec![PackError::NotFound("x".to_string())]).unwrap();
        assert!(matches!(merged, PackError::NotFound(_)));
        assert_eq!(merged.count(), 1);
    }

    #[test]
    fn test_merge_flattens_nested() {
        let nested = PackError::Multiple(vec![
            PackError::NotFound("a".to_string()),
            PackError::NotFound("b".to_string()),
        ]);
        let merged =
            PackError::merge(vec![nested, PackError::ChartError("c".to_string())]).unwrap();

        match &merged {
            PackError::Multiple(inner) => {
                assert_eq!(inner.len(), 3);
                assert!(inner.iter().all(|e| !matches!(e, PackError::Multiple(_))));
            }
            other => panic!("expected Multiple, got {other:?}"),
        }
    }

    #[test]
    fn test_multiple_display_lists_all() {
        let merged = PackError::merge(vec![
            PackError::NotFound("one".to_string()),
            PackError::NotFound("two".to_string()),
        ])
        .unwrap();
        let text = merged.to_string();
        assert!(text.starts_with("2 errors occurred"));
        assert!(text.contains("Not found: one"));
        assert!(text.contains("Not found: two"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: PackError = io_error.into();
        assert!(matches!(error, PackError::IoError(_)));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_serde_yaml_error_conversion() {
        let result: std::result::Result<serde_yaml::Value, _> =
            serde_yaml::from_str("invalid: yaml: content:");
        let error: PackError = result.unwrap_err().into();
        assert!(matches!(error, PackError::SerializationError(_)));
    }
}
