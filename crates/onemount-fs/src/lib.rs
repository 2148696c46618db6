//! OneMount FS - the synchronization core behind the mount point
//!
//! Ties the metadata store, content cache and Graph port together:
//! - [`inode`] - arena + index projection of the catalog for FUSE
//! - [`download`] - priority-ordered bounded hydration pool
//! - [`upload`] - resumable upload manager with ID reconciliation
//! - [`delta_loop`] - adaptive polling + realtime ingest
//! - [`requests`] - serialized metadata request manager
//! - [`offline`] - offline mode tracking and drain-on-reconnect
//! - [`status`] - bounded file-status egress
//! - [`filesystem`] - the `fuser::Filesystem` adapter
//! - [`mount`] - composition root and ordered shutdown

pub mod delta_loop;
pub mod download;
pub mod error;
pub mod filesystem;
pub mod inode;
pub mod mount;
pub mod offline;
pub mod realtime;
pub mod requests;
pub mod status;
pub mod upload;
pub mod xattr;

pub use error::FsError;
pub use filesystem::OneMountFs;
pub use mount::{OneMount, ShutdownHandle};
