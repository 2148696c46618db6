//! Domain newtypes with validation
//!
//! Strongly-typed wrappers for the identifiers and opaque tokens that flow
//! through the sync core. Each newtype validates at construction time so the
//! rest of the code can assume well-formed values.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::CoreError;

// ============================================================================
// ItemId
// ============================================================================

/// Prefix carried by client-minted identifiers until reconciled with the
/// server-assigned ID after a successful upload.
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Identifier of a drive item.
///
/// Server-assigned IDs come from the Graph API verbatim. Locally created
/// items carry a `local-` prefixed ID until upload completion performs ID
/// reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    /// Wraps a server-assigned or previously validated identifier.
    pub fn new(id: impl Into<String>) -> Result<Self, CoreError> {
        let id = id.into();
        if id.is_empty() {
            return Err(CoreError::InvalidArgument("empty item id".to_string()));
        }
        if id.contains('/') || id.contains('\0') {
            return Err(CoreError::InvalidArgument(format!(
                "item id contains forbidden character: {id:?}"
            )));
        }
        Ok(Self(id))
    }

    /// Mints a fresh local (temporary) identifier.
    #[must_use]
    pub fn local() -> Self {
        Self(format!("{}{}", LOCAL_ID_PREFIX, Uuid::new_v4().simple()))
    }

    /// True while this ID is a client-minted temporary one.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_ID_PREFIX)
    }

    /// The identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ItemId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ItemId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for ItemId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// NodeId
// ============================================================================

/// FUSE node identifier.
///
/// Assigned monotonically on first insertion into the inode graph and stable
/// across rename and ID reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u64);

impl NodeId {
    /// Root node number (always 1 per FUSE convention)
    pub const ROOT: NodeId = NodeId(1);

    /// Create a node ID from a raw value
    #[must_use]
    pub const fn new(val: u64) -> Self {
        NodeId(val)
    }

    /// Get the raw u64 value
    #[must_use]
    pub const fn get(&self) -> u64 {
        self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(val: u64) -> Self {
        NodeId(val)
    }
}

impl From<NodeId> for u64 {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

// ============================================================================
// ETag
// ============================================================================

/// Server-provided opaque version tag; inequality implies the body changed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ETag(String);

impl ETag {
    /// Wraps a non-empty etag value.
    pub fn new(value: impl Into<String>) -> Result<Self, CoreError> {
        let value = value.into();
        if value.is_empty() {
            return Err(CoreError::InvalidArgument("empty etag".to_string()));
        }
        Ok(Self(value))
    }

    /// The etag as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ETag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// QuickXorHash
// ============================================================================

/// Content hash with OneDrive quickXorHash semantics (opaque Base64 string).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QuickXorHash(String);

impl QuickXorHash {
    /// Wraps a non-empty hash value.
    pub fn new(value: impl Into<String>) -> Result<Self, CoreError> {
        let value = value.into();
        if value.is_empty() {
            return Err(CoreError::InvalidArgument("empty content hash".to_string()));
        }
        Ok(Self(value))
    }

    /// The hash as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for QuickXorHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// DeltaCursor
// ============================================================================

/// Opaque token identifying the last successfully ingested change set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeltaCursor(String);

impl DeltaCursor {
    /// Wraps a non-empty cursor token.
    pub fn new(value: impl Into<String>) -> Result<Self, CoreError> {
        let value = value.into();
        if value.is_empty() {
            return Err(CoreError::InvalidArgument("empty delta cursor".to_string()));
        }
        Ok(Self(value))
    }

    /// The cursor as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DeltaCursor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
