//! Error types for boot image import and listing
//!
//! Contention on the import lock is deliberately absent here: a second
//! trigger while an import is running is reported as a skip, not an error.

use std::path::PathBuf;
use thiserror::Error;

/// Configuration could not be loaded or is unusable
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file exists but could not be read
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid YAML for the cluster config shape
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// Config parsed but a value is unusable
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Failure inside the image synchronization engine
#[derive(Debug, Error)]
pub enum SyncError {
    /// Transport-level HTTP failure
    #[error("HTTP request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// HTTP client could not be constructed
    #[error("failed to build HTTP client: {source}")]
    Client {
        #[source]
        source: reqwest::Error,
    },

    /// Server answered with a non-success status
    #[error("HTTP error {status} fetching {url}")]
    Status { url: String, status: u16 },

    /// Source or file URL could not be parsed or resolved
    #[error("invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Image index could not be decoded
    #[error("invalid image index at {url}: {source}")]
    Index {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    /// Index entry that cannot be laid out safely on disk
    #[error("invalid entry in image index at {url}: {reason}")]
    InvalidEntry { url: String, reason: String },

    /// Index signature did not verify against the source keyring
    #[error("signature verification failed for {url}: {reason}")]
    Signature { url: String, reason: String },

    /// Downloaded content does not hash to the advertised digest
    #[error("checksum mismatch for {name}: expected {expected}, got {actual}")]
    Checksum {
        name: String,
        expected: String,
        actual: String,
    },

    /// Downloaded content has the wrong length
    #[error("size mismatch for {name}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        name: String,
        expected: u64,
        actual: u64,
    },

    /// Local filesystem error while writing the resource root
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SyncError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SyncError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Error type for the boot image service
#[derive(Debug, Error)]
pub enum ImageError {
    /// Configuration could not be resolved
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The synchronization step of an import failed
    #[error("boot image synchronization failed: {0}")]
    Sync(#[from] SyncError),

    /// The resource root could not be scanned
    #[error("failed to list boot images under {path}: {source}")]
    Listing {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The import worker panicked or was torn down before finishing
    #[error("import job aborted: {0}")]
    JobAborted(String),
}

/// Result type for boot image operations
pub type Result<T> = std::result::Result<T, ImageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::Checksum {
            name: "boot-kernel".to_string(),
            expected: "aa".to_string(),
            actual: "bb".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "checksum mismatch for boot-kernel: expected aa, got bb"
        );

        let err = SyncError::Status {
            url: "http://images.example.com/index.json".to_string(),
            status: 404,
        };
        assert_eq!(
            err.to_string(),
            "HTTP error 404 fetching http://images.example.com/index.json"
        );

        let err = ImageError::Config(ConfigError::Invalid(
            "resource_root must be absolute".to_string(),
        ));
        assert_eq!(
            err.to_string(),
            "invalid configuration: resource_root must be absolute"
        );
    }

    #[test]
    fn test_client_error_display() {
        let source = reqwest::Client::new()
            .get("not a url")
            .build()
            .unwrap_err();
        let err = SyncError::Client { source };
        assert!(err.to_string().starts_with("failed to build HTTP client: "));
    }

    #[test]
    fn test_sync_error_converts() {
        let err: ImageError = SyncError::SizeMismatch {
            name: "boot-initrd".to_string(),
            expected: 10,
            actual: 4,
        }
        .into();
        assert!(matches!(err, ImageError::Sync(SyncError::SizeMismatch { .. })));
        assert!(err.to_string().contains("boot-initrd"));
    }
}
