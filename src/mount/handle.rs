//! Per-open state managed by the translator.

use crate::mount::filetime::filetime_from;
use crate::storage::FileStats;
use bitflags::bitflags;

bitflags! {
    /// The subset of host file-attribute flags the translator produces.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct FileAttributes: u32 {
        /// The entry is a directory.
        const DIRECTORY = 0x0000_0010;
        /// A regular file with no other attributes.
        const NORMAL = 0x0000_0080;
    }
}

bitflags! {
    /// Create-disposition options passed by the host driver.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct CreateOptions: u32 {
        /// The caller is creating a directory rather than a file.
        const DIRECTORY_FILE = 0x0000_0001;
    }
}

bitflags! {
    /// Flags passed to the cleanup callback.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct CleanupFlags: u32 {
        /// The handle was opened delete-on-close; remove the entry now.
        const DELETE = 0x0000_0001;
    }
}

/// The attribute record the host driver consumes for every entry: attribute
/// flags, sizes, and four FILETIME-shaped timestamps.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileInfo {
    /// Attribute flags (directory or normal).
    pub attributes: FileAttributes,
    /// File size in bytes.
    pub size: u64,
    /// Allocation size; always equal to `size` here.
    pub allocation_size: u64,
    /// Creation timestamp.
    pub creation_time: u64,
    /// Last-access timestamp.
    pub last_access_time: u64,
    /// Last-write timestamp.
    pub last_write_time: u64,
    /// Change timestamp.
    pub change_time: u64,
    /// Index number; the stores expose no stable inode, so always `0`.
    pub index_number: u64,
}

impl FileInfo {
    /// Builds the record straight from remote metadata, all four timestamps
    /// set to the modification time.
    pub fn from_stats(stats: &FileStats) -> FileInfo {
        let mtime = filetime_from(stats.modified);
        FileInfo {
            attributes: if stats.is_directory {
                FileAttributes::DIRECTORY
            } else {
                FileAttributes::NORMAL
            },
            size: stats.size,
            allocation_size: stats.size,
            creation_time: mtime,
            last_access_time: mtime,
            last_write_time: mtime,
            change_time: mtime,
            index_number: 0,
        }
    }
}

/// Per-handle state for one host-driver open.
///
/// Created by the `open` and `create` callbacks, mutated by `write`,
/// `set_file_size`, `overwrite` and `rename`, and dropped after `cleanup`.
/// The host driver serializes calls per handle, so the translator mutates a
/// handle without further locking.
#[derive(Debug)]
pub struct OpenHandle {
    pub(crate) path: String,
    pub(crate) is_directory: bool,
    pub(crate) size: u64,
    pub(crate) attributes: FileAttributes,
    pub(crate) creation_time: u64,
    pub(crate) last_access_time: u64,
    pub(crate) last_write_time: u64,
    pub(crate) change_time: u64,
    /// In-memory file content; `None` until the first write materializes it.
    /// Always `None` for directories.
    pub(crate) write_buffer: Option<Vec<u8>>,
    /// True once the buffer holds bytes that have not been uploaded yet.
    pub(crate) dirty: bool,
}

impl OpenHandle {
    /// Builds a handle from remote metadata, as the `open` callback does.
    /// All four timestamps start at the remote modification time.
    pub fn from_stats(path: String, stats: &FileStats) -> Self {
        let mtime = filetime_from(stats.modified);
        OpenHandle {
            path,
            is_directory: stats.is_directory,
            size: stats.size,
            attributes: if stats.is_directory {
                FileAttributes::DIRECTORY
            } else {
                FileAttributes::NORMAL
            },
            creation_time: mtime,
            last_access_time: mtime,
            last_write_time: mtime,
            change_time: mtime,
            write_buffer: None,
            dirty: false,
        }
    }

    /// Builds a handle for an entry that was just created. New files start
    /// with an empty materialized buffer; directories never carry one.
    pub fn new_created(path: String, is_directory: bool, now: u64) -> Self {
        OpenHandle {
            path,
            is_directory,
            size: 0,
            attributes: if is_directory {
                FileAttributes::DIRECTORY
            } else {
                FileAttributes::NORMAL
            },
            creation_time: now,
            last_access_time: now,
            last_write_time: now,
            change_time: now,
            write_buffer: if is_directory { None } else { Some(Vec::new()) },
            dirty: false,
        }
    }

    /// The canonical remote path this handle refers to. Updated by `rename`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether the handle refers to a directory.
    pub fn is_directory(&self) -> bool {
        self.is_directory
    }

    /// The current size in bytes, tracking un-flushed writes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether the write buffer holds bytes not yet uploaded.
    pub fn dirty(&self) -> bool {
        self.dirty
    }

    /// The attribute record for this handle in host-driver shape.
    pub fn file_info(&self) -> FileInfo {
        FileInfo {
            attributes: self.attributes,
            size: self.size,
            allocation_size: self.size,
            creation_time: self.creation_time,
            last_access_time: self.last_access_time,
            last_write_time: self.last_write_time,
            change_time: self.change_time,
            index_number: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    #[test]
    fn from_stats_seeds_all_timestamps_from_mtime() {
        let modified = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).single().unwrap();
        let stats = FileStats::file("f.bin", 1024, modified);
        let handle = OpenHandle::from_stats("/f.bin".into(), &stats);
        let info = handle.file_info();
        assert_eq!(info.size, 1024);
        assert_eq!(info.allocation_size, 1024);
        assert_eq!(info.attributes, FileAttributes::NORMAL);
        assert_eq!(info.creation_time, filetime_from(modified));
        assert_eq!(info.last_access_time, info.creation_time);
        assert_eq!(info.last_write_time, info.creation_time);
        assert_eq!(info.change_time, info.creation_time);
        assert_eq!(info.index_number, 0);
        assert!(handle.write_buffer.is_none());
        assert!(!handle.dirty());
    }

    #[test]
    fn directory_handles_have_no_buffer() {
        let stats = FileStats::dir("d", Utc::now());
        let handle = OpenHandle::from_stats("/d".into(), &stats);
        assert!(handle.is_directory());
        assert_eq!(handle.size(), 0);
        assert_eq!(handle.file_info().attributes, FileAttributes::DIRECTORY);
        assert!(handle.write_buffer.is_none());
    }

    #[test]
    fn created_file_starts_with_empty_buffer() {
        let handle = OpenHandle::new_created("/new.txt".into(), false, 1);
        assert_eq!(handle.write_buffer.as_deref(), Some(&[][..]));
        assert!(!handle.dirty());
        let dir = OpenHandle::new_created("/newdir".into(), true, 1);
        assert!(dir.write_buffer.is_none());
    }
}
