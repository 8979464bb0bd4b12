#![deny(clippy::all)]
#![deny(missing_docs)]
#![forbid(unsafe_code)]

//! libremfs exposes a remote file store as a locally mounted filesystem volume.
//!
//! A host filesystem driver (WinFsp- or FUSE-like) delivers callbacks such as
//! open, read, write, flush and directory enumeration. The [`mount::FsMount`]
//! translator maps those callbacks onto the [`storage::RemoteStore`] contract,
//! buffering writes in memory and keeping directory and metadata reads cheap
//! through TTL caches. Concrete back-ends live in their own crates (search for
//! `remfs-be-`): FTP(S), SFTP and Google Drive ship with this workspace, and
//! anything that can implement the eleven `RemoteStore` operations can be
//! mounted the same way.
//!
//! # Quick Start
//!
//! Add libremfs, a back-end crate and tokio to Cargo.toml:
//!
//! ```toml
//! [dependencies]
//! libremfs = "0.3"
//! remfs-be-sftp = "0.3"
//! tokio = { version = "1", features = ["full"] }
//! ```
//!
//! Then build a translator around a connected store and hand it to your
//! host-driver shim:
//!
//! ```no_run
//! use std::sync::Arc;
//! use libremfs::config::{CacheConfig, MountConfig};
//! use libremfs::mount::FsMount;
//! use libremfs::storage::RemoteStore;
//!
//! async fn mount(store: Arc<dyn RemoteStore>) -> libremfs::storage::Result<()> {
//!     store.connect().await?;
//!     let fs = FsMount::new(store, &CacheConfig::default(), MountConfig::default());
//!     let _ = fs.volume_info();
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod mount;
pub mod path;
pub mod storage;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
