#![deny(clippy::all)]
#![deny(missing_docs)]
#![forbid(unsafe_code)]

//! A [libremfs](https://docs.rs/libremfs) remote-store back-end speaking SFTP
//! over SSH.
//!
//! Host keys follow the OpenSSH trust-on-first-use model against the standard
//! known-hosts file: an unknown host is accepted and persisted, a changed key
//! for a known host aborts the connection — that is what an interception
//! attempt looks like. Authentication is tried in a fixed order: an explicit
//! key file, then the SSH agent and default identities, then the password.
//!
//! # Usage
//!
//! ```no_run
//! use libremfs::config::{ConnectionConfig, SshConfig};
//! use libremfs::storage::RemoteStore;
//! use remfs_be_sftp::SftpStorage;
//!
//! #[tokio::main]
//! async fn main() -> libremfs::storage::Result<()> {
//!     let store = SftpStorage::new(
//!         SshConfig {
//!             host: "myserver.com".to_string(),
//!             username: Some("deploy".to_string()),
//!             key_file: Some("/home/deploy/.ssh/id_ed25519".into()),
//!             ..SshConfig::default()
//!         },
//!         ConnectionConfig::default(),
//!     );
//!     store.connect().await?;
//!     println!("{:?}", store.get_file_info("/etc/hostname").await?);
//!     Ok(())
//! }
//! ```

use bytes::Bytes;
use chrono::{TimeZone, Utc};
use futures::future::{BoxFuture, FutureExt};
use libremfs::config::{ConnectionConfig, SshConfig};
use libremfs::path;
use libremfs::storage::{Error, ErrorKind, FileStats, RemoteStore, Result};
use russh::client;
use russh::keys::agent::client::AgentClient;
use russh::keys::known_hosts::learn_known_hosts;
use russh::keys::{check_known_hosts, Algorithm, PrivateKeyWithHashAlg};
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{OpenFlags, StatusCode};
use std::fmt;
use std::io::SeekFrom;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Trust-on-first-use host key policy, the OpenSSH model: unknown hosts are
/// learned into the known-hosts file, a changed key is rejected.
struct TofuHandler {
    host: String,
    port: u16,
    key_changed: Arc<AtomicBool>,
}

impl client::Handler for TofuHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        match check_known_hosts(&self.host, self.port, server_public_key) {
            Ok(true) => Ok(true),
            Ok(false) => {
                info!(host = %self.host, "unknown host, adding key to known_hosts");
                if let Err(err) = learn_known_hosts(&self.host, self.port, server_public_key) {
                    warn!(error = %err, "could not persist known_hosts entry");
                }
                Ok(true)
            }
            Err(russh::keys::Error::KeyChanged { line }) => {
                error!(
                    host = %self.host,
                    line,
                    "host key has CHANGED; this could indicate a man-in-the-middle attack"
                );
                self.key_changed.store(true, Ordering::SeqCst);
                Ok(false)
            }
            Err(err) => {
                // An unreadable known-hosts file degrades to first use.
                warn!(error = %err, "could not read known_hosts, trusting on first use");
                if let Err(err) = learn_known_hosts(&self.host, self.port, server_public_key) {
                    warn!(error = %err, "could not persist known_hosts entry");
                }
                Ok(true)
            }
        }
    }
}

/// Translates an SFTP status into the error taxonomy. `Failure` is the
/// protocol's catch-all, so the operation supplies what it means in context
/// (`NotEmpty` for directory removal, `AlreadyExists` for exclusive create).
fn translate_with(err: SftpError, failure_kind: ErrorKind) -> Error {
    let kind = match &err {
        SftpError::Status(status) => match status.status_code {
            StatusCode::NoSuchFile => ErrorKind::NotFound,
            StatusCode::PermissionDenied => ErrorKind::AccessDenied,
            StatusCode::NoConnection | StatusCode::ConnectionLost => ErrorKind::Unavailable,
            StatusCode::Failure => failure_kind,
            _ => ErrorKind::Fatal,
        },
        _ => ErrorKind::Unavailable,
    };
    Error::new(kind, err)
}

fn translate(err: SftpError) -> Error {
    translate_with(err, ErrorKind::Fatal)
}

fn ssh_unavailable(err: russh::Error) -> Error {
    Error::new(ErrorKind::Unavailable, err)
}

fn stats_from_attrs(name: String, attrs: &russh_sftp::protocol::FileAttributes) -> FileStats {
    let modified = attrs
        .mtime
        .and_then(|secs| Utc.timestamp_opt(i64::from(secs), 0).single())
        .unwrap_or_else(Utc::now);
    if attrs.is_dir() {
        FileStats::dir(name, modified)
    } else {
        FileStats::file(name, attrs.size.unwrap_or(0), modified)
    }
}

/// One SSH connection with its SFTP subsystem channel.
struct SshSession {
    handle: client::Handle<TofuHandler>,
    sftp: SftpSession,
}

impl SshSession {
    async fn alive(&self) -> bool {
        self.sftp.canonicalize(".").await.is_ok()
    }

    async fn close(self) {
        let _ = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await;
    }
}

/// A [`RemoteStore`] backed by an SFTP server.
pub struct SftpStorage {
    config: SshConfig,
    connection: ConnectionConfig,
    session: Mutex<Option<SshSession>>,
}

impl fmt::Debug for SftpStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SftpStorage")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .finish()
    }
}

impl SftpStorage {
    /// Creates a back-end for the given server. Nothing connects until
    /// [`RemoteStore::connect`] or the first operation.
    pub fn new(config: SshConfig, connection: ConnectionConfig) -> Self {
        SftpStorage {
            config,
            connection,
            session: Mutex::new(None),
        }
    }

    fn username(&self) -> String {
        self.config
            .username
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "root".to_string())
    }

    async fn open_session(&self) -> Result<SshSession> {
        let limit = Duration::from_secs(self.connection.timeout_seconds);
        let key_changed = Arc::new(AtomicBool::new(false));
        let handler = TofuHandler {
            host: self.config.host.clone(),
            port: self.config.port,
            key_changed: key_changed.clone(),
        };
        let ssh_config = Arc::new(client::Config {
            keepalive_interval: Some(Duration::from_secs(
                self.connection.keepalive_interval_seconds,
            )),
            ..client::Config::default()
        });

        debug!(host = %self.config.host, port = self.config.port, "connecting");
        let connect = client::connect(
            ssh_config,
            (self.config.host.as_str(), self.config.port),
            handler,
        );
        let mut handle = match tokio::time::timeout(limit, connect).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(err)) => {
                if key_changed.load(Ordering::SeqCst) {
                    return Err(Error::new(
                        ErrorKind::Fatal,
                        format!(
                            "host key for {} has changed; remove the stale known_hosts entry \
                             if the key rotation was legitimate",
                            self.config.host
                        ),
                    ));
                }
                return Err(ssh_unavailable(err));
            }
            Err(_) => return Err(Error::new(ErrorKind::TimedOut, "SSH connection")),
        };

        self.authenticate(&mut handle).await?;

        let channel = handle
            .channel_open_session()
            .await
            .map_err(ssh_unavailable)?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(ssh_unavailable)?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(translate)?;
        info!(host = %self.config.host, port = self.config.port, "connected");
        Ok(SshSession { handle, sftp })
    }

    /// Key file first, then agent identities, then password.
    async fn authenticate(&self, handle: &mut client::Handle<TofuHandler>) -> Result<()> {
        let user = self.username();

        if let Some(key_file) = &self.config.key_file {
            debug!(user, key_file = %key_file.display(), "authenticating with key file");
            let key = russh::keys::load_secret_key(key_file, self.config.key_passphrase.as_deref())
                .map_err(|err| Error::new(ErrorKind::AuthFailed, err))?;
            let hash_alg = handle
                .best_supported_rsa_hash()
                .await
                .map_err(ssh_unavailable)?
                .flatten();
            let auth = handle
                .authenticate_publickey(&user, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
                .await
                .map_err(ssh_unavailable)?;
            if auth.success() {
                return Ok(());
            }
        }

        if self.config.use_agent {
            match AgentClient::connect_env().await {
                Ok(mut agent) => {
                    let identities = agent.request_identities().await.unwrap_or_default();
                    let hash_alg = handle
                        .best_supported_rsa_hash()
                        .await
                        .map_err(ssh_unavailable)?
                        .flatten();
                    for identity in identities {
                        let alg = match identity.algorithm() {
                            Algorithm::Dsa | Algorithm::Rsa { .. } => hash_alg,
                            _ => None,
                        };
                        let auth = handle
                            .authenticate_publickey_with(&user, identity, alg, &mut agent)
                            .await
                            .map_err(|err| Error::new(ErrorKind::Unavailable, err))?;
                        if auth.success() {
                            debug!(user, "authenticated via SSH agent");
                            return Ok(());
                        }
                    }
                }
                Err(err) => debug!(error = %err, "no SSH agent available"),
            }
        }

        if let Some(password) = &self.config.password {
            debug!(user, "authenticating with password");
            let auth = handle
                .authenticate_password(&user, password)
                .await
                .map_err(ssh_unavailable)?;
            if auth.success() {
                return Ok(());
            }
        }

        Err(Error::new(
            ErrorKind::AuthFailed,
            format!("no authentication method succeeded for user {user}"),
        ))
    }

    async fn ensure_connected<'a>(
        &self,
        guard: &'a mut Option<SshSession>,
    ) -> Result<&'a mut SshSession> {
        let alive = match guard.as_ref() {
            Some(session) => session.alive().await,
            None => false,
        };
        if !alive {
            if let Some(stale) = guard.take() {
                debug!("SSH transport lost, reconnecting");
                stale.close().await;
            }
            *guard = Some(self.open_session().await?);
        }
        guard
            .as_mut()
            .ok_or_else(|| Error::from(ErrorKind::Unavailable))
    }

    /// Runs `operation` against the SFTP session with the configured timeout,
    /// retrying transient failures with a fixed delay. The session mutex is
    /// released between attempts and the connection re-established.
    async fn with_retry<T, F>(&self, operation: &str, mut f: F) -> Result<T>
    where
        F: for<'a> FnMut(&'a SftpSession) -> BoxFuture<'a, Result<T>>,
    {
        let attempts = self.connection.retry_attempts.max(1);
        let limit = Duration::from_secs(self.connection.timeout_seconds);
        let mut last_error: Option<Error> = None;
        for attempt in 1..=attempts {
            {
                let mut guard = self.session.lock().await;
                let outcome = match self.ensure_connected(&mut guard).await {
                    Ok(session) => match tokio::time::timeout(limit, f(&session.sftp)).await {
                        Ok(outcome) => outcome,
                        Err(_) => Err(Error::new(ErrorKind::TimedOut, operation.to_string())),
                    },
                    Err(err) => Err(err),
                };
                match outcome {
                    Ok(value) => return Ok(value),
                    Err(err) if !err.kind().is_transient() => return Err(err),
                    Err(err) => {
                        warn!(operation, attempt, attempts, error = %err, "attempt failed");
                        if let Some(stale) = guard.take() {
                            stale.close().await;
                        }
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
impl RemoteStore for SftpStorage {
    async fn connect(&self) -> Result<()> {
        let mut guard = self.session.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        *guard = Some(self.open_session().await?);
        Ok(())
    }

    async fn disconnect(&self) {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.take() {
            session.close().await;
        }
    }

    #[tracing_attributes::instrument]
    async fn list_dir(&self, dir: &str) -> Result<Vec<FileStats>> {
        let dir = path::normalize(dir);
        self.with_retry("list_dir", |sftp| {
            let dir = dir.clone();
            async move {
                let entries = sftp
                    .read_dir(dir.as_str())
                    .await
                    .map_err(|err| translate_with(err, ErrorKind::NotFound))?;
                Ok(entries
                    .filter(|entry| entry.file_name() != "." && entry.file_name() != "..")
                    .map(|entry| stats_from_attrs(entry.file_name(), &entry.metadata()))
                    .collect())
            }
            .boxed()
        })
        .await
    }

    #[tracing_attributes::instrument]
    async fn get_file_info(&self, target: &str) -> Result<FileStats> {
        let target = path::normalize(target);
        self.with_retry("get_file_info", |sftp| {
            let target = target.clone();
            async move {
                let attrs = sftp.metadata(target.as_str()).await.map_err(translate)?;
                Ok(stats_from_attrs(path::leaf(&target), &attrs))
            }
            .boxed()
        })
        .await
    }

    async fn read_file(&self, target: &str, offset: u64, length: Option<u64>) -> Result<Vec<u8>> {
        let target = path::normalize(target);
        let data = self
            .with_retry("read_file", |sftp| {
                let target = target.clone();
                async move {
                    let mut file = sftp
                        .open_with_flags(target.as_str(), OpenFlags::READ)
                        .await
                        .map_err(translate)?;
                    if offset > 0 {
                        file.seek(SeekFrom::Start(offset))
                            .await
                            .map_err(|err| Error::new(ErrorKind::Unavailable, err))?;
                    }
                    let mut data = Vec::new();
                    match length {
                        Some(length) => {
                            let mut limited = (&mut file).take(length);
                            limited
                                .read_to_end(&mut data)
                                .await
                                .map_err(|err| Error::new(ErrorKind::Unavailable, err))?;
                        }
                        None => {
                            file.read_to_end(&mut data)
                                .await
                                .map_err(|err| Error::new(ErrorKind::Unavailable, err))?;
                        }
                    }
                    Ok(data)
                }
                .boxed()
            })
            .await?;
        debug!(target = %target, bytes = data.len(), offset, "read");
        Ok(data)
    }

    async fn write_file(&self, target: &str, data: &[u8], offset: u64) -> Result<usize> {
        let target = path::normalize(target);
        let payload = Bytes::copy_from_slice(data);
        self.with_retry("write_file", |sftp| {
            let target = target.clone();
            let payload = payload.clone();
            async move {
                if offset == 0 {
                    let mut file = sftp.create(target.as_str()).await.map_err(translate)?;
                    file.write_all(&payload)
                        .await
                        .map_err(|err| Error::new(ErrorKind::Unavailable, err))?;
                    file.shutdown()
                        .await
                        .map_err(|err| Error::new(ErrorKind::Unavailable, err))?;
                } else {
                    // SFTP supports random-offset writes natively.
                    let mut file = sftp
                        .open_with_flags(target.as_str(), OpenFlags::READ | OpenFlags::WRITE)
                        .await
                        .map_err(translate)?;
                    file.seek(SeekFrom::Start(offset))
                        .await
                        .map_err(|err| Error::new(ErrorKind::Unavailable, err))?;
                    file.write_all(&payload)
                        .await
                        .map_err(|err| Error::new(ErrorKind::Unavailable, err))?;
                    file.shutdown()
                        .await
                        .map_err(|err| Error::new(ErrorKind::Unavailable, err))?;
                }
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
        self.with_retry("create_file", |sftp| {
            let target = target.clone();
            async move {
                let mut file = sftp
                    .open_with_flags(
                        target.as_str(),
                        OpenFlags::CREATE | OpenFlags::WRITE | OpenFlags::EXCLUDE,
                    )
                    .await
                    .map_err(|err| translate_with(err, ErrorKind::AlreadyExists))?;
                file.shutdown()
                    .await
                    .map_err(|err| Error::new(ErrorKind::Unavailable, err))?;
                Ok(())
            }
            .boxed()
        })
        .await
    }

    #[tracing_attributes::instrument]
    async fn create_dir(&self, target: &str) -> Result<()> {
        let target = path::normalize(target);
        self.with_retry("create_dir", |sftp| {
            let target = target.clone();
            async move {
                if sftp.create_dir(target.as_str()).await.is_ok() {
                    return Ok(());
                }
                // Create missing parents segment by segment; an existing
                // directory along the way is fine.
                let mut current = String::new();
                for segment in target.split('/').filter(|s| !s.is_empty()) {
                    current.push('/');
                    current.push_str(segment);
                    if sftp.metadata(current.as_str()).await.is_ok() {
                        continue;
                    }
                    sftp.create_dir(current.as_str()).await.map_err(translate)?;
                }
                Ok(())
            }
            .boxed()
        })
        .await
    }

    #[tracing_attributes::instrument]
    async fn delete_file(&self, target: &str) -> Result<()> {
        let target = path::normalize(target);
        self.with_retry("delete_file", |sftp| {
            let target = target.clone();
            async move { sftp.remove_file(target.as_str()).await.map_err(translate) }.boxed()
        })
        .await
    }

    #[tracing_attributes::instrument]
    async fn delete_dir(&self, target: &str) -> Result<()> {
        let target = path::normalize(target);
        self.with_retry("delete_dir", |sftp| {
            let target = target.clone();
            async move {
                sftp.remove_dir(target.as_str())
                    .await
                    .map_err(|err| translate_with(err, ErrorKind::NotEmpty))
            }
            .boxed()
        })
        .await
    }

    #[tracing_attributes::instrument]
    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = path::normalize(from);
        let to = path::normalize(to);
        self.with_retry("rename", |sftp| {
            let from = from.clone();
            let to = to.clone();
            async move {
                sftp.rename(from.as_str(), to.as_str())
                    .await
                    .map_err(translate)
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
    use russh_sftp::protocol::FileAttributes;

    fn status_error(code: StatusCode) -> SftpError {
        SftpError::Status(russh_sftp::protocol::Status {
            id: 0,
            status_code: code,
            error_message: String::new(),
            language_tag: String::new(),
        })
    }

    #[test]
    fn status_codes_translate_to_taxonomy() {
        assert_eq!(
            translate(status_error(StatusCode::NoSuchFile)).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            translate(status_error(StatusCode::PermissionDenied)).kind(),
            ErrorKind::AccessDenied
        );
        assert_eq!(
            translate(status_error(StatusCode::ConnectionLost)).kind(),
            ErrorKind::Unavailable
        );
    }

    #[test]
    fn failure_takes_the_contextual_kind() {
        assert_eq!(
            translate_with(status_error(StatusCode::Failure), ErrorKind::NotEmpty).kind(),
            ErrorKind::NotEmpty
        );
        assert_eq!(
            translate_with(status_error(StatusCode::Failure), ErrorKind::AlreadyExists).kind(),
            ErrorKind::AlreadyExists
        );
    }

    #[test]
    fn attrs_map_to_stats() {
        let attrs = FileAttributes {
            size: Some(42),
            mtime: Some(1_700_000_000),
            ..FileAttributes::default()
        };
        let stats = stats_from_attrs("f.txt".to_string(), &attrs);
        assert_eq!(stats.name, "f.txt");
        assert_eq!(stats.size, 42);
        assert!(!stats.is_directory);
        assert_eq!(stats.modified.timestamp(), 1_700_000_000);
    }
}
