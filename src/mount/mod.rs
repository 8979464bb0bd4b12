//! The filesystem translator: host-driver callbacks → remote store calls.
//!
//! [`FsMount`] is handed to a host-driver shim which invokes one method per
//! driver callback, possibly from several worker threads at once. Each open
//! file or directory is represented by an [`OpenHandle`]; the driver
//! serializes calls per handle, so handle mutation needs no locking here. The
//! directory and metadata caches carry their own locks and no lock is ever
//! held across a remote call.

mod filetime;
mod handle;
mod status;

pub use filetime::{datetime_from, filetime_from, filetime_now};
pub use handle::{CleanupFlags, CreateOptions, FileAttributes, FileInfo, OpenHandle};
pub use status::{
    ntstatus_of, STATUS_ACCESS_DENIED, STATUS_DIRECTORY_NOT_EMPTY, STATUS_IO_DEVICE_ERROR,
    STATUS_IO_TIMEOUT, STATUS_LOGON_FAILURE, STATUS_OBJECT_NAME_COLLISION,
    STATUS_OBJECT_NAME_NOT_FOUND, STATUS_SUCCESS,
};

use crate::cache::{DirCache, MetaCache};
use crate::config::{CacheConfig, MountConfig};
use crate::path;
use crate::storage::{ErrorKind, FileStats, RemoteStore, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Volume totals reported to the host driver. The stores expose no quota
/// interface, so the values are constant.
const VOLUME_TOTAL_BYTES: u64 = 1 << 40;
const VOLUME_FREE_BYTES: u64 = VOLUME_TOTAL_BYTES / 2;

/// A constant permissive self-relative security descriptor: revision 1,
/// `SE_DACL_PRESENT | SE_SELF_RELATIVE`, null DACL. The stores carry no
/// per-file ACLs, so every entry reports this one.
const PERMISSIVE_SECURITY_DESCRIPTOR: &[u8] = &[
    0x01, 0x00, 0x04, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00,
];

/// The volume-information record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VolumeInfo {
    /// Total size in bytes.
    pub total_bytes: u64,
    /// Free size in bytes.
    pub free_bytes: u64,
    /// The configured volume label.
    pub volume_label: String,
}

/// One entry of a directory enumeration in host-driver shape.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirEntry {
    /// Leaf name of the entry.
    pub name: String,
    /// Attribute record for the entry.
    pub info: FileInfo,
}

/// The filesystem translator.
///
/// Owns the directory and metadata caches and a single abstract remote store;
/// it never inspects which back-end it is talking to.
pub struct FsMount {
    store: Arc<dyn RemoteStore>,
    dir_cache: DirCache,
    meta_cache: MetaCache,
    volume_label: String,
}

impl FsMount {
    /// Creates a translator over a connected store.
    pub fn new(store: Arc<dyn RemoteStore>, cache: &CacheConfig, mount: MountConfig) -> Self {
        FsMount {
            store,
            dir_cache: DirCache::new(Duration::from_secs(cache.directory_ttl_seconds)),
            meta_cache: MetaCache::new(Duration::from_secs(cache.metadata_ttl_seconds)),
            volume_label: mount.volume_label,
        }
    }

    /// The volume-information record. Totals are constant.
    pub fn volume_info(&self) -> VolumeInfo {
        VolumeInfo {
            total_bytes: VOLUME_TOTAL_BYTES,
            free_bytes: VOLUME_FREE_BYTES,
            volume_label: self.volume_label.clone(),
        }
    }

    /// Metadata lookup through the cache; a miss populates it.
    async fn lookup(&self, path: &str) -> Result<FileStats> {
        if let Some(stats) = self.meta_cache.get(path) {
            return Ok(stats);
        }
        let stats = self.store.get_file_info(path).await?;
        self.meta_cache.put(path, stats.clone());
        Ok(stats)
    }

    /// Resolves attributes and the security descriptor for a path, before any
    /// handle exists.
    pub async fn get_security_by_name(
        &self,
        file_name: &str,
    ) -> Result<(FileAttributes, &'static [u8])> {
        let remote_path = path::normalize(file_name);
        let stats = self.lookup(&remote_path).await?;
        let attributes = if stats.is_directory {
            FileAttributes::DIRECTORY
        } else {
            FileAttributes::NORMAL
        };
        Ok((attributes, PERMISSIVE_SECURITY_DESCRIPTOR))
    }

    /// Opens an existing file or directory.
    pub async fn open(&self, file_name: &str) -> Result<OpenHandle> {
        let remote_path = path::normalize(file_name);
        debug!(path = %remote_path, "open");
        let stats = self.lookup(&remote_path).await?;
        Ok(OpenHandle::from_stats(remote_path, &stats))
    }

    /// Creates a new file or directory; the directory bit of `create_options`
    /// selects which. Reports `AlreadyExists` when the target is present.
    pub async fn create(
        &self,
        file_name: &str,
        create_options: CreateOptions,
        _granted_access: u32,
        _attributes: FileAttributes,
        _security_descriptor: Option<&[u8]>,
        _allocation_size: u64,
    ) -> Result<OpenHandle> {
        let remote_path = path::normalize(file_name);
        debug!(path = %remote_path, "create");
        match self.lookup(&remote_path).await {
            Ok(_) => return Err(ErrorKind::AlreadyExists.into()),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        let is_directory = create_options.contains(CreateOptions::DIRECTORY_FILE);
        if is_directory {
            self.store.create_dir(&remote_path).await?;
        } else {
            self.store.create_file(&remote_path).await?;
        }
        self.dir_cache.invalidate_parent(&remote_path);
        Ok(OpenHandle::new_created(remote_path, is_directory, filetime_now()))
    }

    /// Releases a handle. The interesting work already happened in `cleanup`.
    pub fn close(&self, _handle: OpenHandle) {}

    /// Reads up to `length` bytes at `offset`. Reads at or past EOF return
    /// empty bytes without contacting the store; a materialized write buffer
    /// is served directly so un-flushed writes stay visible.
    pub async fn read(&self, handle: &OpenHandle, offset: u64, length: u64) -> Result<Vec<u8>> {
        if offset >= handle.size {
            return Ok(Vec::new());
        }
        let length = length.min(handle.size - offset);
        if let Some(buffer) = &handle.write_buffer {
            let start = (offset as usize).min(buffer.len());
            let end = ((offset + length) as usize).min(buffer.len());
            return Ok(buffer[start..end].to_vec());
        }
        self.store.read_file(&handle.path, offset, Some(length)).await
    }

    /// Downloads the current remote content into the write buffer if it is
    /// not materialized yet.
    async fn materialize_buffer(&self, handle: &mut OpenHandle) -> Result<()> {
        if handle.write_buffer.is_some() {
            return Ok(());
        }
        let existing = if handle.size > 0 {
            self.store.read_file(&handle.path, 0, None).await?
        } else {
            Vec::new()
        };
        handle.write_buffer = Some(existing);
        Ok(())
    }

    /// Splices `buffer` into the handle's write buffer at `offset`, extending
    /// the file as needed, and marks the handle dirty. `write_to_end` appends
    /// regardless of `offset`; `constrained` forbids growing the file.
    pub async fn write(
        &self,
        handle: &mut OpenHandle,
        buffer: &[u8],
        offset: u64,
        write_to_end: bool,
        constrained: bool,
    ) -> Result<usize> {
        self.materialize_buffer(handle).await?;
        let offset = if write_to_end { handle.size } else { offset };
        let data = if constrained {
            if offset >= handle.size {
                return Ok(0);
            }
            let room = (handle.size - offset) as usize;
            &buffer[..buffer.len().min(room)]
        } else {
            buffer
        };
        let content = handle.write_buffer.as_mut().ok_or(ErrorKind::Fatal)?;
        let offset = offset as usize;
        if offset > content.len() {
            content.resize(offset, 0);
        }
        let overlap = data.len().min(content.len().saturating_sub(offset));
        content[offset..offset + overlap].copy_from_slice(&data[..overlap]);
        content.extend_from_slice(&data[overlap..]);
        handle.size = content.len() as u64;
        handle.dirty = true;
        handle.last_write_time = filetime_now();
        handle.change_time = handle.last_write_time;
        Ok(data.len())
    }

    /// Uploads the write buffer when dirty and invalidates the caches the
    /// upload staled.
    pub async fn flush(&self, handle: &mut OpenHandle) -> Result<()> {
        if !handle.dirty {
            return Ok(());
        }
        let Some(buffer) = handle.write_buffer.as_deref() else {
            return Ok(());
        };
        debug!(path = %handle.path, bytes = buffer.len(), "flush");
        self.store.write_file(&handle.path, buffer, 0).await?;
        handle.dirty = false;
        self.meta_cache.invalidate(&handle.path);
        self.dir_cache.invalidate_parent(&handle.path);
        Ok(())
    }

    /// The attribute record for an open handle.
    pub fn get_file_info(&self, handle: &OpenHandle) -> FileInfo {
        handle.file_info()
    }

    /// Accepts timestamp updates from the driver. The stores expose no way to
    /// set times, so the values live on the handle only; zero means "leave
    /// unchanged", as the driver sends it.
    pub fn set_basic_info(
        &self,
        handle: &mut OpenHandle,
        creation_time: u64,
        last_access_time: u64,
        last_write_time: u64,
        change_time: u64,
    ) -> FileInfo {
        if creation_time != 0 {
            handle.creation_time = creation_time;
        }
        if last_access_time != 0 {
            handle.last_access_time = last_access_time;
        }
        if last_write_time != 0 {
            handle.last_write_time = last_write_time;
        }
        if change_time != 0 {
            handle.change_time = change_time;
        }
        handle.file_info()
    }

    /// Truncates or zero-extends the file to `new_size` and marks the handle
    /// dirty. A pure allocation-size update that does not shrink the file is
    /// a no-op.
    pub async fn set_file_size(
        &self,
        handle: &mut OpenHandle,
        new_size: u64,
        set_allocation_size: bool,
    ) -> Result<()> {
        if set_allocation_size && new_size >= handle.size {
            return Ok(());
        }
        self.materialize_buffer(handle).await?;
        let content = handle.write_buffer.as_mut().ok_or(ErrorKind::Fatal)?;
        content.resize(new_size as usize, 0);
        handle.size = new_size;
        handle.dirty = true;
        handle.change_time = filetime_now();
        Ok(())
    }

    /// Resets the file to empty, as the driver requests when an existing file
    /// is opened for overwrite.
    pub async fn overwrite(
        &self,
        handle: &mut OpenHandle,
        _attributes: FileAttributes,
        _replace_attributes: bool,
        _allocation_size: u64,
    ) -> Result<FileInfo> {
        handle.write_buffer = Some(Vec::new());
        handle.size = 0;
        handle.dirty = true;
        handle.last_write_time = filetime_now();
        handle.change_time = handle.last_write_time;
        Ok(handle.file_info())
    }

    /// Final per-handle work before the driver releases it: upload a dirty
    /// buffer, then honor delete-on-close. A failed upload is logged and
    /// swallowed — the driver has already committed to releasing the handle —
    /// but a non-empty directory still refuses deletion.
    pub async fn cleanup(
        &self,
        handle: &mut OpenHandle,
        file_name: &str,
        flags: CleanupFlags,
    ) -> Result<()> {
        if handle.dirty {
            if let Err(err) = self.flush(handle).await {
                warn!(path = %handle.path, error = %err, "flush during cleanup failed");
            }
        }
        if !flags.contains(CleanupFlags::DELETE) {
            return Ok(());
        }
        let remote_path = if file_name.is_empty() {
            handle.path.clone()
        } else {
            path::normalize(file_name)
        };
        debug!(path = %remote_path, "delete on close");
        let result = if handle.is_directory {
            self.store.delete_dir(&remote_path).await
        } else {
            self.store.delete_file(&remote_path).await
        };
        match result {
            Ok(()) => {}
            // Already gone remotely; release the handle cleanly.
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        if handle.is_directory {
            self.dir_cache.invalidate(&remote_path);
        }
        self.meta_cache.invalidate(&remote_path);
        self.dir_cache.invalidate_parent(&remote_path);
        Ok(())
    }

    /// Enumerates a directory, resuming after `marker` when given. Listings
    /// are sorted by name so the resume point is stable; a cache miss
    /// populates both the directory cache and each child's metadata.
    pub async fn read_directory(
        &self,
        handle: &OpenHandle,
        marker: Option<&str>,
    ) -> Result<Vec<DirEntry>> {
        let listing = match self.dir_cache.get(&handle.path) {
            Some(listing) => listing,
            None => {
                let mut listing = self.store.list_dir(&handle.path).await?;
                listing.sort_by(|a, b| a.name.cmp(&b.name));
                for stats in &listing {
                    self.meta_cache
                        .put(&path::join(&handle.path, &stats.name), stats.clone());
                }
                self.dir_cache.put(&handle.path, listing.clone());
                listing
            }
        };
        let entries = listing
            .iter()
            .filter(|stats| marker.is_none_or(|m| stats.name.as_str() > m))
            .map(|stats| DirEntry {
                name: stats.name.clone(),
                info: FileInfo::from_stats(stats),
            })
            .collect();
        Ok(entries)
    }

    /// Renames or moves the entry behind a handle. Without `replace_if_exists`
    /// an existing destination is a name collision; with it, the destination
    /// is deleted first. The handle follows the entry to its new path.
    pub async fn rename(
        &self,
        handle: &mut OpenHandle,
        file_name: &str,
        new_file_name: &str,
        replace_if_exists: bool,
    ) -> Result<()> {
        let old_path = path::normalize(file_name);
        let new_path = path::normalize(new_file_name);
        debug!(from = %old_path, to = %new_path, "rename");
        match self.store.get_file_info(&new_path).await {
            Ok(existing) => {
                if !replace_if_exists {
                    return Err(ErrorKind::AlreadyExists.into());
                }
                if existing.is_directory {
                    self.store.delete_dir(&new_path).await?;
                } else {
                    self.store.delete_file(&new_path).await?;
                }
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        self.store.rename(&old_path, &new_path).await?;
        self.meta_cache.invalidate(&old_path);
        self.meta_cache.invalidate(&new_path);
        self.dir_cache.invalidate_parent(&old_path);
        self.dir_cache.invalidate_parent(&new_path);
        if handle.is_directory {
            self.dir_cache.invalidate(&old_path);
        }
        handle.path = new_path;
        Ok(())
    }

    /// The security descriptor for an open handle; constant for every entry.
    pub fn get_security(&self, _handle: &OpenHandle) -> &'static [u8] {
        PERMISSIVE_SECURITY_DESCRIPTOR
    }

    #[cfg(test)]
    pub(crate) fn caches(&self) -> (&DirCache, &MetaCache) {
        (&self.dir_cache, &self.meta_cache)
    }
}
