//! Contains the [`RemoteStore`] trait that every remote back-end implements.
//!
//! Back-end implementations live in their own crates (`remfs-be-ftp`,
//! `remfs-be-sftp`, `remfs-be-gdrive`). All of them expose the same eleven
//! operations over canonical `/`-style paths and report failures through the
//! [`ErrorKind`] taxonomy; nothing protocol-specific crosses this boundary.

mod error;
pub use error::{Error, ErrorKind};

mod remote_store;
pub use remote_store::{FileStats, RemoteStore, Result};
