//! Extended attributes
//!
//! A read-only reserved namespace exposes sync state to desktop shells:
//!
//! - `user.onemount.state` - item state (`ghost`, `hydrated`, ...)
//! - `user.onemount.size` - body size in bytes
//! - `user.onemount.id` - the item ID
//! - `user.onemount.progress` - transfer progress (0-100), present only
//!   while a download or upload for the item is in flight
//!
//! Writes into the reserved namespace are denied with `EACCES`. Other
//! `user.*` attributes live in the in-memory per-inode map.

use crate::inode::Inode;

/// Reserved namespace prefix.
pub const RESERVED_PREFIX: &str = "user.onemount.";

pub const XATTR_STATE: &str = "user.onemount.state";
pub const XATTR_SIZE: &str = "user.onemount.size";
pub const XATTR_ID: &str = "user.onemount.id";
pub const XATTR_PROGRESS: &str = "user.onemount.progress";

/// All reserved attribute names, for `listxattr`.
#[must_use]
pub fn reserved_xattrs() -> [&'static str; 4] {
    [XATTR_STATE, XATTR_SIZE, XATTR_ID, XATTR_PROGRESS]
}

/// True when a name is inside the reserved namespace.
#[must_use]
pub fn is_reserved(name: &str) -> bool {
    name.starts_with(RESERVED_PREFIX)
}

/// Value of a reserved attribute for an inode, if defined.
///
/// `progress` is the transfer percentage supplied by the caller (from the
/// download or upload manager); without an active transfer the attribute
/// does not exist.
#[must_use]
pub fn get_reserved(inode: &Inode, name: &str, progress: Option<u8>) -> Option<Vec<u8>> {
    match name {
        XATTR_STATE => Some(inode.state().name().as_bytes().to_vec()),
        XATTR_SIZE => Some(inode.size().to_string().into_bytes()),
        XATTR_ID => Some(inode.id().as_str().as_bytes().to_vec()),
        XATTR_PROGRESS => progress.map(|pct| pct.to_string().into_bytes()),
        _ => None,
    }
}
