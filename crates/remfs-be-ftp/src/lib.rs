#![deny(clippy::all)]
#![deny(missing_docs)]
#![forbid(unsafe_code)]

//! A [libremfs](https://docs.rs/libremfs) remote-store back-end speaking FTP,
//! or FTPS when the `secure` flag negotiates explicit TLS on the control
//! channel.
//!
//! # Usage
//!
//! ```no_run
//! use libremfs::config::{ConnectionConfig, FtpConfig};
//! use libremfs::storage::RemoteStore;
//! use remfs_be_ftp::FtpStorage;
//!
//! #[tokio::main]
//! async fn main() -> libremfs::storage::Result<()> {
//!     let store = FtpStorage::new(
//!         FtpConfig {
//!             host: "192.168.0.130".to_string(),
//!             port: 2121,
//!             ..FtpConfig::default()
//!         },
//!         ConnectionConfig::default(),
//!     );
//!     store.connect().await?;
//!     for entry in store.list_dir("/").await? {
//!         println!("{}", entry.name);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! The session is a single multiplexed control connection guarded by a mutex;
//! transient failures close it, wait the configured delay and reconnect, up
//! to the configured attempt count. Permanent server replies are never
//! retried.

mod control;
mod parser;

use bytes::Bytes;
use control::FtpSession;
use futures::future::{BoxFuture, FutureExt};
use libremfs::config::{ConnectionConfig, FtpConfig};
use libremfs::path;
use libremfs::storage::{Error, ErrorKind, FileStats, RemoteStore, Result};
use std::fmt;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

/// A [`RemoteStore`] backed by an FTP or FTPS server.
pub struct FtpStorage {
    config: FtpConfig,
    connection: ConnectionConfig,
    session: Mutex<Option<FtpSession>>,
}

impl fmt::Debug for FtpStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FtpStorage")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("secure", &self.config.secure)
            .finish()
    }
}

impl FtpStorage {
    /// Creates a back-end for the given server. Nothing connects until
    /// [`RemoteStore::connect`] or the first operation.
    pub fn new(config: FtpConfig, connection: ConnectionConfig) -> Self {
        FtpStorage {
            config,
            connection,
            session: Mutex::new(None),
        }
    }

    /// Makes sure the guarded session is alive, reconnecting when the
    /// liveness probe fails. Returns the session for the current operation.
    async fn ensure_connected<'a>(
        &self,
        guard: &'a mut Option<FtpSession>,
    ) -> Result<&'a mut FtpSession> {
        let alive = match guard.as_mut() {
            Some(session) => session.noop().await.is_ok(),
            None => false,
        };
        if !alive {
            if guard.take().is_some() {
                debug!("connection lost, reconnecting");
            }
            *guard = Some(FtpSession::connect(&self.config, &self.connection).await?);
        }
        guard
            .as_mut()
            .ok_or_else(|| Error::from(ErrorKind::Unavailable))
    }

    /// Runs `operation` against the session, retrying transient failures with
    /// a fixed delay. The session mutex is released between attempts and the
    /// connection is re-established on the next one.
    async fn with_retry<T, F>(&self, operation: &str, mut f: F) -> Result<T>
    where
        F: for<'a> FnMut(&'a mut FtpSession) -> BoxFuture<'a, Result<T>>,
    {
        let attempts = self.connection.retry_attempts.max(1);
        let mut last_error: Option<Error> = None;
        for attempt in 1..=attempts {
            {
                let mut guard = self.session.lock().await;
                let outcome = match self.ensure_connected(&mut guard).await {
                    Ok(session) => f(session).await,
                    Err(err) => Err(err),
                };
                match outcome {
                    Ok(value) => return Ok(value),
                    Err(err) if !err.kind().is_transient() => return Err(err),
                    Err(err) => {
                        warn!(operation, attempt, attempts, error = %err, "attempt failed");
                        *guard = None;
                        last_error = Some(err);
                    }
                }
            }
            if attempt < attempts {
                tokio::time::sleep(Duration::from_secs(self.connection.retry_delay_seconds)).await;
            }
        }
        error!(operation, attempts, "all attempts failed");
        Err(last_error.unwrap_or_else(|| Error::from(ErrorKind::Unavailable)))
    }
}

#[async_trait::async_trait]
impl RemoteStore for FtpStorage {
    async fn connect(&self) -> Result<()> {
        let mut guard = self.session.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        *guard = Some(FtpSession::connect(&self.config, &self.connection).await?);
        Ok(())
    }

    async fn disconnect(&self) {
        let mut guard = self.session.lock().await;
        if let Some(mut session) = guard.take() {
            session.quit().await;
        }
    }

    #[tracing_attributes::instrument]
    async fn list_dir(&self, dir: &str) -> Result<Vec<FileStats>> {
        let dir = path::normalize(dir);
        self.with_retry("list_dir", |session| {
            let dir = dir.clone();
            async move { session.list_dir(&dir).await }.boxed()
        })
        .await
    }

    #[tracing_attributes::instrument]
    async fn get_file_info(&self, target: &str) -> Result<FileStats> {
        let target = path::normalize(target);
        self.with_retry("get_file_info", |session| {
            let target = target.clone();
            async move { session.file_info(&target).await }.boxed()
        })
        .await
    }

    async fn read_file(&self, target: &str, offset: u64, length: Option<u64>) -> Result<Vec<u8>> {
        let target = path::normalize(target);
        let mut data = self
            .with_retry("read_file", |session| {
                let target = target.clone();
                async move { session.retrieve(&target, offset).await }.boxed()
            })
            .await?;
        if let Some(length) = length {
            data.truncate(length as usize);
        }
        debug!(target = %target, bytes = data.len(), "read");
        Ok(data)
    }

    async fn write_file(&self, target: &str, data: &[u8], offset: u64) -> Result<usize> {
        let target = path::normalize(target);
        let payload = Bytes::copy_from_slice(data);
        let written = self
            .with_retry("write_file", |session| {
                let target = target.clone();
                let payload = payload.clone();
                async move {
                    if offset == 0 {
                        session.store(&target, &payload).await?;
                        return Ok(payload.len());
                    }
                    // FTP has no random-offset writes: read-modify-write.
                    let mut existing = match session.retrieve(&target, 0).await {
                        Ok(existing) => existing,
                        Err(err) if err.kind() == ErrorKind::NotFound => Vec::new(),
                        Err(err) => return Err(err),
                    };
                    let offset = offset as usize;
                    if offset > existing.len() {
                        existing.resize(offset, 0);
                    }
                    let overlap = payload.len().min(existing.len() - offset);
                    existing[offset..offset + overlap].copy_from_slice(&payload[..overlap]);
                    existing.extend_from_slice(&payload[overlap..]);
                    session.store(&target, &existing).await?;
                    Ok(payload.len())
                }
                .boxed()
            })
            .await?;
        debug!(target = %target, written, offset, "wrote");
        Ok(written)
    }

    #[tracing_attributes::instrument]
    async fn create_file(&self, target: &str) -> Result<()> {
        let target = path::normalize(target);
        self.with_retry("create_file", |session| {
            let target = target.clone();
            async move { session.store(&target, &[]).await }.boxed()
        })
        .await
    }

    #[tracing_attributes::instrument]
    async fn create_dir(&self, target: &str) -> Result<()> {
        let target = path::normalize(target);
        self.with_retry("create_dir", |session| {
            let target = target.clone();
            async move { session.make_dir(&target).await }.boxed()
        })
        .await
    }

    #[tracing_attributes::instrument]
    async fn delete_file(&self, target: &str) -> Result<()> {
        let target = path::normalize(target);
        self.with_retry("delete_file", |session| {
            let target = target.clone();
            async move { session.delete(&target).await }.boxed()
        })
        .await
    }

    #[tracing_attributes::instrument]
    async fn delete_dir(&self, target: &str) -> Result<()> {
        let target = path::normalize(target);
        self.with_retry("delete_dir", |session| {
            let target = target.clone();
            async move { session.remove_dir(&target).await }.boxed()
        })
        .await
    }

    #[tracing_attributes::instrument]
    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = path::normalize(from);
        let to = path::normalize(to);
        self.with_retry("rename", |session| {
            let from = from.clone();
            let to = to.clone();
            async move { session.rename(&from, &to).await }.boxed()
        })
        .await
    }
}
