#![deny(clippy::all)]
#![deny(missing_docs)]
#![forbid(unsafe_code)]

//! A [libremfs](https://docs.rs/libremfs) remote-store back-end for Google
//! Drive, speaking the Drive API v3.
//!
//! Drive is ID-keyed rather than path-keyed, so every operation first walks
//! the folder hierarchy to resolve its path to a file ID, caching each
//! partial path (see the path-to-ID cache TTL in
//! [`CacheConfig`](libremfs::config::CacheConfig)). Workspace documents have
//! no downloadable bytes; the four exportable kinds are listed with a
//! synthetic extension (`.docx`, `.xlsx`, `.pptx`, `.pdf`) and read through
//! the export endpoint, while writes to any Workspace document are refused.
//! Deletion moves entries to the trash, never hard-deletes.
//!
//! # Usage
//!
//! ```no_run
//! use libremfs::config::{CacheConfig, ConnectionConfig, DriveConfig};
//! use libremfs::storage::RemoteStore;
//! use remfs_be_gdrive::DriveStorage;
//!
//! #[tokio::main]
//! async fn main() -> libremfs::storage::Result<()> {
//!     let store = DriveStorage::new(
//!         DriveConfig {
//!             client_secrets: Some("client_secrets.json".into()),
//!             ..DriveConfig::default()
//!         },
//!         CacheConfig::default(),
//!         ConnectionConfig::default(),
//!     );
//!     store.connect().await?;
//!     for entry in store.list_dir("/").await? {
//!         println!("{}", entry.name);
//!     }
//!     Ok(())
//! }
//! ```

mod auth;
mod client;
mod path_ids;

use auth::TokenSource;
use bytes::Bytes;
use client::{DriveClient, DriveFile, FOLDER_MIME};
use futures::future::{BoxFuture, FutureExt};
use libremfs::config::{CacheConfig, ConnectionConfig, DriveConfig};
use libremfs::path;
use libremfs::storage::{Error, ErrorKind, FileStats, RemoteStore, Result};
use path_ids::PathResolver;
use std::fmt;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// A Workspace document kind that can be exported to a portable format.
struct ExportFormat {
    source_mime: &'static str,
    export_mime: &'static str,
    extension: &'static str,
}

/// The four exportable Workspace kinds and their projections.
const WORKSPACE_EXPORTS: [ExportFormat; 4] = [
    ExportFormat {
        source_mime: "application/vnd.google-apps.document",
        export_mime: "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        extension: ".docx",
    },
    ExportFormat {
        source_mime: "application/vnd.google-apps.spreadsheet",
        export_mime: "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        extension: ".xlsx",
    },
    ExportFormat {
        source_mime: "application/vnd.google-apps.presentation",
        export_mime: "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        extension: ".pptx",
    },
    ExportFormat {
        source_mime: "application/vnd.google-apps.drawing",
        export_mime: "application/pdf",
        extension: ".pdf",
    },
];

/// All Workspace MIME types, including the ones with no export projection;
/// those are hidden from listings entirely.
const WORKSPACE_MIMES: [&str; 9] = [
    "application/vnd.google-apps.document",
    "application/vnd.google-apps.spreadsheet",
    "application/vnd.google-apps.presentation",
    "application/vnd.google-apps.drawing",
    "application/vnd.google-apps.form",
    "application/vnd.google-apps.map",
    "application/vnd.google-apps.site",
    "application/vnd.google-apps.jam",
    "application/vnd.google-apps.script",
];

fn export_for_mime(mime: &str) -> Option<&'static ExportFormat> {
    WORKSPACE_EXPORTS.iter().find(|e| e.source_mime == mime)
}

fn is_workspace_mime(mime: &str) -> bool {
    WORKSPACE_MIMES.contains(&mime)
}

/// Strips a known synthetic export extension, returning the bare Drive name.
fn strip_export_extension(name: &str) -> Option<&str> {
    WORKSPACE_EXPORTS
        .iter()
        .find_map(|e| name.strip_suffix(e.extension))
}

/// Converts wire metadata to [`FileStats`], appending the synthetic extension
/// to exportable Workspace documents. Workspace documents report size zero
/// until exported.
fn stats_from_file(file: &DriveFile) -> FileStats {
    let is_dir = file.mime_type == FOLDER_MIME;
    if is_dir {
        return FileStats::dir(file.name.clone(), file.modified());
    }
    let mut name = file.name.clone();
    match export_for_mime(&file.mime_type) {
        Some(export) if !name.ends_with(export.extension) => name.push_str(export.extension),
        _ => {}
    }
    let size = if is_workspace_mime(&file.mime_type) {
        0
    } else {
        file.size_bytes()
    };
    FileStats::file(name, size, file.modified())
}

/// One authenticated API session: the HTTP client plus the path resolver
/// rooted at the configured folder or shared drive.
struct DriveState {
    client: DriveClient,
    resolver: PathResolver,
}

/// A [`RemoteStore`] backed by Google Drive.
pub struct DriveStorage {
    config: DriveConfig,
    cache: CacheConfig,
    connection: ConnectionConfig,
    state: Mutex<Option<DriveState>>,
}

impl fmt::Debug for DriveStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriveStorage")
            .field("shared_drive", &self.config.shared_drive)
            .field("root_folder_id", &self.config.root_folder_id)
            .finish()
    }
}

impl DriveStorage {
    /// Creates a back-end for the configured drive. Nothing connects until
    /// [`RemoteStore::connect`] or the first operation.
    pub fn new(config: DriveConfig, cache: CacheConfig, connection: ConnectionConfig) -> Self {
        DriveStorage {
            config,
            cache,
            connection,
            state: Mutex::new(None),
        }
    }

    async fn open_state(&self) -> Result<DriveState> {
        let tokens = TokenSource::new(&self.config).await?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.connection.timeout_seconds))
            .build()
            .map_err(|err| Error::new(ErrorKind::Fatal, err))?;
        let mut client = DriveClient::new(http, tokens);

        // A shared drive may be configured as an opaque ID or a display name;
        // names are resolved once here.
        if let Some(shared) = &self.config.shared_drive {
            let drive_id = if shared.len() > 20 && !shared.contains(' ') {
                shared.clone()
            } else {
                client
                    .find_drive_by_name(shared)
                    .await?
                    .ok_or_else(|| {
                        Error::new(ErrorKind::Fatal, format!("shared drive not found: {shared}"))
                    })?
            };
            info!(shared_drive = %shared, drive_id = %drive_id, "using shared drive");
            client.set_shared_drive(drive_id);
        }

        let root_id = client
            .shared_drive_id()
            .map(str::to_string)
            .or_else(|| self.config.root_folder_id.clone())
            .unwrap_or_else(|| "root".to_string());
        let resolver = PathResolver::new(
            Duration::from_secs(self.cache.path_id_ttl_seconds),
            root_id,
        );
        info!("connected to Google Drive");
        Ok(DriveState { client, resolver })
    }

    async fn ensure_connected<'a>(
        &self,
        guard: &'a mut Option<DriveState>,
    ) -> Result<&'a mut DriveState> {
        if guard.is_none() {
            *guard = Some(self.open_state().await?);
        }
        guard
            .as_mut()
            .ok_or_else(|| Error::from(ErrorKind::Unavailable))
    }

    /// Runs `operation`, retrying transient failures. Rate-limit push-back
    /// backs off exponentially (`delay * 2^attempt`); other transient
    /// failures wait the fixed delay. The state mutex is released while
    /// sleeping.
    async fn with_retry<T, F>(&self, operation: &str, mut f: F) -> Result<T>
    where
        F: for<'a> FnMut(&'a DriveState) -> BoxFuture<'a, Result<T>>,
    {
        let attempts = self.connection.retry_attempts.max(1);
        let base_delay = self.connection.retry_delay_seconds;
        let mut last_error: Option<Error> = None;
        for attempt in 1..=attempts {
            let delay = {
                let mut guard = self.state.lock().await;
                let outcome = match self.ensure_connected(&mut guard).await {
                    Ok(state) => f(state).await,
                    Err(err) => Err(err),
                };
                match outcome {
                    Ok(value) => return Ok(value),
                    Err(err) if !err.kind().is_transient() => return Err(err),
                    Err(err) => {
                        let delay = if client::rate_limited(&err) {
                            let backoff = base_delay.saturating_mul(1u64 << (attempt - 1).min(31));
                            warn!(operation, attempt, attempts, backoff, "rate limited");
                            backoff
                        } else {
                            warn!(operation, attempt, attempts, error = %err, "attempt failed");
                            base_delay
                        };
                        last_error = Some(err);
                        delay
                    }
                }
            };
            if attempt < attempts {
                tokio::time::sleep(Duration::from_secs(delay)).await;
            }
        }
        error!(operation, attempts, "all attempts failed");
        Err(last_error.unwrap_or_else(|| Error::from(ErrorKind::Unavailable)))
    }

    /// Resolves a path to an ID, retrying with the synthetic export extension
    /// stripped so names produced by `list_dir` round-trip through `open`.
    async fn resolve_path(state: &DriveState, target: &str) -> Result<String> {
        if let Some(id) = state.resolver.resolve(&state.client, target).await? {
            return Ok(id);
        }
        let name = path::leaf(target);
        if let Some(bare) = strip_export_extension(&name) {
            let stripped = path::join(&path::parent(target), bare);
            if let Some(id) = state.resolver.resolve(&state.client, &stripped).await? {
                return Ok(id);
            }
        }
        Err(Error::new(
            ErrorKind::NotFound,
            format!("no such file or directory: {target}"),
        ))
    }
}

#[async_trait::async_trait]
impl RemoteStore for DriveStorage {
    async fn connect(&self) -> Result<()> {
        let mut guard = self.state.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        *guard = Some(self.open_state().await?);
        Ok(())
    }

    async fn disconnect(&self) {
        let mut guard = self.state.lock().await;
        if let Some(state) = guard.take() {
            state.resolver.clear();
        }
    }

    #[tracing_attributes::instrument]
    async fn list_dir(&self, dir: &str) -> Result<Vec<FileStats>> {
        let dir = path::normalize(dir);
        self.with_retry("list_dir", |state| {
            let dir = dir.clone();
            async move {
                let folder_id = Self::resolve_path(state, &dir).await?;
                let mut entries = Vec::new();
                let mut page_token: Option<String> = None;
                loop {
                    let page = state
                        .client
                        .list_children(&folder_id, page_token.as_deref())
                        .await?;
                    for file in &page.files {
                        // Workspace kinds with no export projection are
                        // invisible to the mount.
                        if is_workspace_mime(&file.mime_type)
                            && export_for_mime(&file.mime_type).is_none()
                        {
                            continue;
                        }
                        entries.push(stats_from_file(file));
                    }
                    page_token = page.next_page_token;
                    if page_token.is_none() {
                        break;
                    }
                }
                debug!(dir = %dir, entries = entries.len(), "listed");
                Ok(entries)
            }
            .boxed()
        })
        .await
    }

    #[tracing_attributes::instrument]
    async fn get_file_info(&self, target: &str) -> Result<FileStats> {
        let target = path::normalize(target);
        self.with_retry("get_file_info", |state| {
            let target = target.clone();
            async move {
                let id = Self::resolve_path(state, &target).await?;
                let file = state.client.get_file(&id).await?;
                Ok(stats_from_file(&file))
            }
            .boxed()
        })
        .await
    }

    async fn read_file(&self, target: &str, offset: u64, length: Option<u64>) -> Result<Vec<u8>> {
        let target = path::normalize(target);
        self.with_retry("read_file", |state| {
            let target = target.clone();
            async move {
                let id = Self::resolve_path(state, &target).await?;
                let file = state.client.get_file(&id).await?;
                let mut data = match export_for_mime(&file.mime_type) {
                    Some(export) => state.client.export(&id, export.export_mime).await?,
                    None => state.client.download(&id).await?,
                };
                if offset > 0 {
                    let skip = (offset as usize).min(data.len());
                    data.drain(..skip);
                }
                if let Some(length) = length {
                    data.truncate(length as usize);
                }
                debug!(target = %target, bytes = data.len(), "read");
                Ok(data)
            }
            .boxed()
        })
        .await
    }

    async fn write_file(&self, target: &str, data: &[u8], offset: u64) -> Result<usize> {
        let target = path::normalize(target);
        let payload = Bytes::copy_from_slice(data);
        self.with_retry("write_file", |state| {
            let target = target.clone();
            let payload = payload.clone();
            async move {
                let id = Self::resolve_path(state, &target).await?;
                let file = state.client.get_file(&id).await?;
                if is_workspace_mime(&file.mime_type) {
                    return Err(Error::new(
                        ErrorKind::AccessDenied,
                        format!("cannot write to a Workspace document: {target}"),
                    ));
                }
                let content = if offset > 0 {
                    let mut existing = state.client.download(&id).await?;
                    let offset = offset as usize;
                    if offset > existing.len() {
                        existing.resize(offset, 0);
                    }
                    let overlap = payload.len().min(existing.len() - offset);
                    existing[offset..offset + overlap].copy_from_slice(&payload[..overlap]);
                    existing.extend_from_slice(&payload[overlap..]);
                    existing
                } else {
                    payload.to_vec()
                };
                state.client.upload_content(&id, &content).await?;
                state.resolver.invalidate_subtree(&path::parent(&target));
                debug!(target = %target, bytes = payload.len(), offset, "wrote");
                Ok(payload.len())
            }
            .boxed()
        })
        .await
    }

    #[tracing_attributes::instrument]
    async fn create_file(&self, target: &str) -> Result<()> {
        let target = path::normalize(target);
        self.with_retry("create_file", |state| {
            let target = target.clone();
            async move {
                let parent = path::parent(&target);
                let parent_id = Self::resolve_path(state, &parent).await?;
                state
                    .client
                    .create_metadata(&path::leaf(&target), &parent_id, None)
                    .await?;
                state.resolver.invalidate_subtree(&parent);
                Ok(())
            }
            .boxed()
        })
        .await
    }

    #[tracing_attributes::instrument]
    async fn create_dir(&self, target: &str) -> Result<()> {
        let target = path::normalize(target);
        self.with_retry("create_dir", |state| {
            let target = target.clone();
            async move {
                let parent = path::parent(&target);
                let parent_id = Self::resolve_path(state, &parent).await?;
                state
                    .client
                    .create_metadata(&path::leaf(&target), &parent_id, Some(FOLDER_MIME))
                    .await?;
                state.resolver.invalidate_subtree(&parent);
                Ok(())
            }
            .boxed()
        })
        .await
    }

    #[tracing_attributes::instrument]
    async fn delete_file(&self, target: &str) -> Result<()> {
        let target = path::normalize(target);
        self.with_retry("delete_file", |state| {
            let target = target.clone();
            async move {
                let id = Self::resolve_path(state, &target).await?;
                state.client.trash(&id).await?;
                state.resolver.invalidate(&target);
                state.resolver.invalidate_subtree(&path::parent(&target));
                Ok(())
            }
            .boxed()
        })
        .await
    }

    #[tracing_attributes::instrument]
    async fn delete_dir(&self, target: &str) -> Result<()> {
        let target = path::normalize(target);
        self.with_retry("delete_dir", |state| {
            let target = target.clone();
            async move {
                let id = Self::resolve_path(state, &target).await?;
                // Trashing a folder trashes its subtree; Drive has no
                // emptiness requirement.
                state.client.trash(&id).await?;
                state.resolver.invalidate_subtree(&target);
                state.resolver.invalidate_subtree(&path::parent(&target));
                Ok(())
            }
            .boxed()
        })
        .await
    }

    #[tracing_attributes::instrument]
    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = path::normalize(from);
        let to = path::normalize(to);
        self.with_retry("rename", |state| {
            let from = from.clone();
            let to = to.clone();
            async move {
                let id = Self::resolve_path(state, &from).await?;
                let old_parent = path::parent(&from);
                let new_parent = path::parent(&to);
                let body = serde_json::json!({ "name": path::leaf(&to) });
                // Re-parent and rename in one call when the move crosses
                // directories.
                let mut extra: Vec<(&str, String)> = Vec::new();
                if old_parent != new_parent {
                    let old_parent_id = Self::resolve_path(state, &old_parent).await?;
                    let new_parent_id = Self::resolve_path(state, &new_parent).await?;
                    extra.push(("addParents", new_parent_id));
                    extra.push(("removeParents", old_parent_id));
                }
                state.client.update_metadata(&id, body, &extra).await?;
                state.resolver.invalidate(&from);
                state.resolver.invalidate_subtree(&old_parent);
                if old_parent != new_parent {
                    state.resolver.invalidate_subtree(&new_parent);
                }
                Ok(())
            }
            .boxed()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn wire_file(name: &str, mime: &str, size: Option<&str>) -> DriveFile {
        DriveFile {
            id: "id1".to_string(),
            name: name.to_string(),
            mime_type: mime.to_string(),
            size: size.map(str::to_string),
            modified_time: Some("2024-06-15T10:30:00.000Z".to_string()),
            trashed: false,
        }
    }

    #[test]
    fn folders_map_to_directories() {
        let stats = stats_from_file(&wire_file("photos", FOLDER_MIME, None));
        assert!(stats.is_directory);
        assert_eq!(stats.size, 0);
        assert_eq!(stats.name, "photos");
    }

    #[test]
    fn exportable_documents_gain_synthetic_extensions() {
        let cases = [
            ("application/vnd.google-apps.document", "Report", "Report.docx"),
            ("application/vnd.google-apps.spreadsheet", "Budget", "Budget.xlsx"),
            ("application/vnd.google-apps.presentation", "Deck", "Deck.pptx"),
            ("application/vnd.google-apps.drawing", "Sketch", "Sketch.pdf"),
        ];
        for (mime, name, expected) in cases {
            let stats = stats_from_file(&wire_file(name, mime, None));
            assert_eq!(stats.name, expected);
            assert_eq!(stats.size, 0, "Workspace documents have no size");
            assert!(!stats.is_directory);
        }
    }

    #[test]
    fn extension_is_not_doubled() {
        let stats = stats_from_file(&wire_file(
            "Report.docx",
            "application/vnd.google-apps.document",
            None,
        ));
        assert_eq!(stats.name, "Report.docx");
    }

    #[test]
    fn regular_files_keep_their_size() {
        let stats = stats_from_file(&wire_file("movie.mp4", "video/mp4", Some("4096")));
        assert_eq!(stats.name, "movie.mp4");
        assert_eq!(stats.size, 4096);
    }

    #[test]
    fn stripping_synthetic_extensions() {
        assert_eq!(strip_export_extension("Report.docx"), Some("Report"));
        assert_eq!(strip_export_extension("Sketch.pdf"), Some("Sketch"));
        assert_eq!(strip_export_extension("archive.zip"), None);
    }

    #[test]
    fn non_exportable_workspace_kinds_are_recognized() {
        assert!(is_workspace_mime("application/vnd.google-apps.form"));
        assert!(export_for_mime("application/vnd.google-apps.form").is_none());
        assert!(!is_workspace_mime("text/plain"));
    }
}
