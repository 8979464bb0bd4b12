//! Defines the service provider interface for remote store implementors.

use super::error::Error;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{fmt::Debug, result};

/// Result type used by traits in this module.
pub type Result<T> = result::Result<T, Error>;

/// Uniform metadata for a single remote entry, independent of the protocol
/// that produced it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileStats {
    /// The leaf name of the entry.
    pub name: String,
    /// Size in bytes. Always `0` for directories.
    pub size: u64,
    /// Last modification instant, at least second precision.
    pub modified: DateTime<Utc>,
    /// Whether the entry is a directory.
    pub is_directory: bool,
}

impl FileStats {
    /// Metadata for a regular file.
    pub fn file<S: Into<String>>(name: S, size: u64, modified: DateTime<Utc>) -> Self {
        FileStats {
            name: name.into(),
            size,
            modified,
            is_directory: false,
        }
    }

    /// Metadata for a directory. Directories always report size `0`.
    pub fn dir<S: Into<String>>(name: S, modified: DateTime<Utc>) -> Self {
        FileStats {
            name: name.into(),
            size: 0,
            modified,
            is_directory: true,
        }
    }
}

/// The `RemoteStore` trait can be implemented to mount any remote file store.
/// Implementations own exactly one remote session plus the mutex guarding it;
/// every operation takes canonical `/`-style paths (see [`crate::path`]) and
/// translates protocol errors into the [`ErrorKind`](super::ErrorKind)
/// taxonomy at this boundary.
///
/// Transient failures (`Unavailable`, `TimedOut`) are retried *inside* the
/// implementation, re-establishing the session between attempts; permanent
/// kinds propagate immediately.
#[async_trait]
pub trait RemoteStore: Send + Sync + Debug {
    /// Establishes the remote session, performing authentication and
    /// capability detection. Idempotent if already connected.
    async fn connect(&self) -> Result<()>;

    /// Best-effort close of the remote session. Never fails.
    async fn disconnect(&self);

    /// Enumerates the direct children of a directory. `.` and `..` are
    /// excluded and the order is unspecified. Fails with `NotFound` when
    /// `path` does not name a directory.
    async fn list_dir(&self, path: &str) -> Result<Vec<FileStats>>;

    /// Returns the metadata of a single file or directory.
    async fn get_file_info(&self, path: &str) -> Result<FileStats>;

    /// Returns up to `length` bytes starting at `offset`, or everything to
    /// EOF when `length` is `None`. Reading at or past EOF yields empty bytes.
    async fn read_file(&self, path: &str, offset: u64, length: Option<u64>) -> Result<Vec<u8>>;

    /// Writes `data` at `offset`, extending the file as needed, and returns
    /// the number of bytes written. Back-ends without native random-offset
    /// writes perform read-modify-write.
    async fn write_file(&self, path: &str, data: &[u8], offset: u64) -> Result<usize>;

    /// Creates an empty regular file. Fails with `AlreadyExists` if present.
    async fn create_file(&self, path: &str) -> Result<()>;

    /// Creates a directory, creating intermediate parents when needed. An
    /// already existing directory is not an error.
    async fn create_dir(&self, path: &str) -> Result<()>;

    /// Removes a regular file (or moves it to the trash on stores that
    /// support it).
    async fn delete_file(&self, path: &str) -> Result<()>;

    /// Removes an empty directory. Fails with `NotEmpty` on strict stores
    /// when children remain.
    async fn delete_dir(&self, path: &str) -> Result<()>;

    /// Renames or moves an entry. Atomic where the protocol allows it.
    async fn rename(&self, from: &str, to: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn directories_have_zero_size() {
        let stats = FileStats::dir("docs", Utc::now());
        assert_eq!(stats.size, 0);
        assert!(stats.is_directory);
    }

    #[test]
    fn file_stats_carry_their_fields() {
        let now = Utc::now();
        let stats = FileStats::file("hello.txt", 11, now);
        assert_eq!(stats.name, "hello.txt");
        assert_eq!(stats.size, 11);
        assert_eq!(stats.modified, now);
        assert!(!stats.is_directory);
    }
}
