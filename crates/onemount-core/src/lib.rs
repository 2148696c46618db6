//! OneMount Core - Domain model and synchronization state machine
//!
//! This crate contains the pieces every other OneMount crate builds on:
//! - **Domain entities** - `Entry`, the persisted metadata record, and its
//!   four-state lifecycle (`ghost`, `hydrated`, `dirty_local`, `deleted`)
//! - **State controller** - validated transitions with a journaled cause code
//! - **Newtypes** - `ItemId`, `NodeId`, `ETag`, `QuickXorHash`, `DeltaCursor`
//! - **Ports** - the `RemoteDrive` trait the sync core consumes; adapter
//!   crates (the Graph client, test stubs) implement it
//! - **Configuration** - typed config with range validation
//!
//! The domain module has no I/O; everything here is deterministic and
//! unit-testable without a network or a disk.

pub mod config;
pub mod domain;
pub mod errors;
pub mod ports;

pub use domain::entry::{Entry, ItemKind, ItemState};
pub use domain::newtypes::{DeltaCursor, ETag, ItemId, NodeId, QuickXorHash};
pub use errors::CoreError;
