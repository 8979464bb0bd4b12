//! Configuration records consumed by the core.
//!
//! The external entry point is responsible for locating and reading the
//! configuration source; the core consumes the enumerated records below, not
//! a free-form mapping. Unknown keys are rejected at parse time.

use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

/// Selects which remote store a mount talks to.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteKind {
    /// Plain FTP.
    #[default]
    Ftp,
    /// Explicit FTPS (FTP over TLS).
    Ftps,
    /// SFTP over SSH.
    Sftp,
    /// Google Drive.
    Gdrive,
}

/// FTP and FTPS transport parameters.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FtpConfig {
    /// Server host name or address.
    pub host: String,
    /// Control-channel port.
    pub port: u16,
    /// Login user. Anonymous login when absent.
    pub username: Option<String>,
    /// Login password.
    pub password: Option<String>,
    /// Whether to use passive-mode data connections.
    pub passive_mode: bool,
    /// Control-channel text encoding.
    pub encoding: String,
    /// Whether to negotiate explicit TLS on the control channel.
    pub secure: bool,
}

impl Default for FtpConfig {
    fn default() -> Self {
        FtpConfig {
            host: String::new(),
            port: 21,
            username: None,
            password: None,
            passive_mode: true,
            encoding: "utf-8".to_string(),
            secure: false,
        }
    }
}

/// SSH/SFTP transport parameters.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SshConfig {
    /// Server host name or address.
    pub host: String,
    /// SSH port.
    pub port: u16,
    /// Login user.
    pub username: Option<String>,
    /// Password, tried only when no key authentication is possible.
    pub password: Option<String>,
    /// Path to an SSH private key file.
    pub key_file: Option<PathBuf>,
    /// Passphrase for an encrypted private key.
    pub key_passphrase: Option<String>,
    /// Whether to try the SSH agent for authentication.
    pub use_agent: bool,
}

impl Default for SshConfig {
    fn default() -> Self {
        SshConfig {
            host: String::new(),
            port: 22,
            username: None,
            password: None,
            key_file: None,
            key_passphrase: None,
            use_agent: true,
        }
    }
}

/// Google Drive parameters.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DriveConfig {
    /// Path to the OAuth client secrets JSON from the cloud console.
    pub client_secrets: Option<PathBuf>,
    /// Where the OAuth token document is persisted. A user-scoped default is
    /// chosen when absent.
    pub token_file: Option<PathBuf>,
    /// Folder ID to treat as the mount root. The drive root when absent.
    pub root_folder_id: Option<String>,
    /// Shared drive, given either as an opaque ID or a display name.
    pub shared_drive: Option<String>,
}

/// Mount-point parameters.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MountConfig {
    /// Identifier of the mount target (drive letter or mount point path).
    pub mount_point: String,
    /// Label reported through the volume-information callback.
    pub volume_label: String,
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            mount_point: String::new(),
            volume_label: "Remote Drive".to_string(),
        }
    }
}

/// TTLs for the three caches, in seconds.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CacheConfig {
    /// TTL for directory listings.
    pub directory_ttl_seconds: u64,
    /// TTL for single-entry metadata.
    pub metadata_ttl_seconds: u64,
    /// TTL for remote-identifier resolution (ID-based back-ends only).
    pub path_id_ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            directory_ttl_seconds: 30,
            metadata_ttl_seconds: 60,
            path_id_ttl_seconds: 120,
        }
    }
}

/// Socket and retry behavior shared by all back-ends.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ConnectionConfig {
    /// Per-operation socket/API timeout.
    pub timeout_seconds: u64,
    /// How many times a transient failure is attempted in total.
    pub retry_attempts: u32,
    /// Fixed delay between attempts; also the base of the rate-limit backoff.
    pub retry_delay_seconds: u64,
    /// Session keepalive interval.
    pub keepalive_interval_seconds: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            timeout_seconds: 30,
            retry_attempts: 3,
            retry_delay_seconds: 1,
            keepalive_interval_seconds: 60,
        }
    }
}

/// The complete configuration record for one mount process.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Which back-end to mount.
    pub remote: RemoteKind,
    /// FTP/FTPS transport section.
    pub ftp: FtpConfig,
    /// SSH/SFTP transport section.
    pub ssh: SshConfig,
    /// Google Drive section.
    pub gdrive: DriveConfig,
    /// Mount-point section.
    pub mount: MountConfig,
    /// Cache TTL section.
    pub cache: CacheConfig,
    /// Connection and retry section.
    pub connection: ConnectionConfig,
}

/// Error produced when a configuration document cannot be parsed.
#[derive(Debug, Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(#[from] toml::de::Error);

impl Config {
    /// Parses a TOML configuration document. Unknown keys anywhere in the
    /// document are an error.
    pub fn from_toml_str(input: &str) -> Result<Config, ConfigError> {
        Ok(toml::from_str(input)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.remote, RemoteKind::Ftp);
        assert_eq!(config.ftp.port, 21);
        assert!(config.ftp.passive_mode);
        assert_eq!(config.ssh.port, 22);
        assert!(config.ssh.use_agent);
        assert_eq!(config.cache.directory_ttl_seconds, 30);
        assert_eq!(config.cache.metadata_ttl_seconds, 60);
        assert_eq!(config.cache.path_id_ttl_seconds, 120);
        assert_eq!(config.connection.timeout_seconds, 30);
        assert_eq!(config.connection.retry_attempts, 3);
        assert_eq!(config.connection.retry_delay_seconds, 1);
        assert_eq!(config.connection.keepalive_interval_seconds, 60);
        assert_eq!(config.mount.volume_label, "Remote Drive");
    }

    #[test]
    fn parses_a_minimal_document() {
        let config = Config::from_toml_str(
            r#"
            remote = "sftp"

            [ssh]
            host = "files.example.com"
            username = "deploy"
            key_file = "/home/deploy/.ssh/id_ed25519"

            [mount]
            mount_point = "Z"
            "#,
        )
        .unwrap();
        assert_eq!(config.remote, RemoteKind::Sftp);
        assert_eq!(config.ssh.host, "files.example.com");
        assert_eq!(config.ssh.username.as_deref(), Some("deploy"));
        assert_eq!(config.mount.mount_point, "Z");
        // Untouched sections keep their defaults.
        assert_eq!(config.cache.directory_ttl_seconds, 30);
    }

    #[test]
    fn parses_a_full_document() {
        let config = Config::from_toml_str(
            r#"
            remote = "gdrive"

            [gdrive]
            client_secrets = "/home/me/client_secrets.json"
            root_folder_id = "1a2b3c"
            shared_drive = "Engineering"

            [mount]
            mount_point = "Y"
            volume_label = "Drive"

            [cache]
            directory_ttl_seconds = 10
            metadata_ttl_seconds = 20
            path_id_ttl_seconds = 240

            [connection]
            timeout_seconds = 15
            retry_attempts = 5
            retry_delay_seconds = 2
            keepalive_interval_seconds = 30
            "#,
        )
        .unwrap();
        assert_eq!(config.remote, RemoteKind::Gdrive);
        assert_eq!(config.gdrive.root_folder_id.as_deref(), Some("1a2b3c"));
        assert_eq!(config.gdrive.shared_drive.as_deref(), Some("Engineering"));
        assert_eq!(config.cache.path_id_ttl_seconds, 240);
        assert_eq!(config.connection.retry_attempts, 5);
        assert_eq!(config.mount.volume_label, "Drive");
    }

    #[test]
    fn rejects_unknown_keys() {
        let err = Config::from_toml_str(
            r#"
            [ftp]
            host = "h"
            blocksize = 42
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("blocksize"));
    }

    #[test]
    fn rejects_unknown_remote_kind() {
        assert!(Config::from_toml_str(r#"remote = "webdav""#).is_err());
    }
}
