//! Domain model for the OneMount synchronization core
//!
//! Pure data and rules: the `Entry` metadata record, its state machine,
//! strongly-typed identifiers, and the records persisted by the upload
//! manager and offline queue. No I/O happens in this module.

pub mod entry;
pub mod newtypes;
pub mod offline;
pub mod session;
pub mod status;
pub mod transition;

pub use entry::{validate_name, Entry, ItemKind, ItemState, NAME_MAX};
pub use newtypes::{DeltaCursor, ETag, ItemId, NodeId, QuickXorHash};
pub use offline::{OfflineChange, OfflineChangeKind};
pub use session::{DownloadState, Priority, UploadSession};
pub use status::FileStatus;
pub use transition::{StateController, TransitionCause, TransitionRecord};
