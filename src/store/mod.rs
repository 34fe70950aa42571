//! Capability contracts for the durable coordination substrate.
//!
//! The subsystem never talks to a concrete store directly; it is written
//! against these traits. The in-process [`memory`] implementation backs the
//! simulator and the integration tests.

pub mod memory;

use std::collections::BTreeSet;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::assignment::{AssignmentMap, ProcessId};
use crate::error::Result;

pub use memory::InMemoryCoordination;

/// Outcome of a marker-create attempt. Contention is a normal outcome of
/// the create-uniqueness race, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TakeOwnership {
    Acquired,
    AlreadyOwnedBySelf,
    OwnedByOther(ProcessId),
}

impl TakeOwnership {
    /// Whether this process now holds the marker.
    pub fn is_owned(&self) -> bool {
        matches!(self, TakeOwnership::Acquired | TakeOwnership::AlreadyOwnedBySelf)
    }
}

/// A bucket's ownership marker disappeared (owner released it, owner
/// disconnected, or the marker was removed out of band).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnershipRemoved {
    pub bucket: u32,
}

/// Fleet membership change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    Joined(ProcessId),
    Left(ProcessId),
}

/// Durable store for the bucket→process assignment map of one service kind.
///
/// Change notifications are eventually delivered to all subscribers after a
/// successful `replace`, though not necessarily exactly once; readers must
/// re-read the latest map rather than trust cached values.
#[async_trait]
pub trait AssignmentStore: Send + Sync {
    /// Idempotently create the map root; safe to call concurrently from
    /// multiple processes at first startup.
    async fn create_root(&self) -> Result<()>;

    async fn read(&self) -> Result<AssignmentMap>;

    /// Atomically replace the whole map. Only the current leader writes.
    async fn replace(&self, map: &AssignmentMap) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<()>;
}

/// Store for per-bucket ephemeral ownership markers.
#[async_trait]
pub trait OwnershipStore: Send + Sync {
    /// Idempotently create the ownership root.
    async fn create_root(&self) -> Result<()>;

    /// Idempotently create the structural placeholder for one bucket.
    async fn init_bucket(&self, bucket: u32) -> Result<()>;

    /// Create the marker for `bucket` tagged with `process` if absent.
    /// Exactly one creator wins a concurrent race.
    async fn try_take(&self, bucket: u32, process: &str) -> Result<TakeOwnership>;

    /// Remove the marker if `process` holds it.
    async fn release(&self, bucket: u32, process: &str) -> Result<()>;

    fn subscribe_removals(&self) -> broadcast::Receiver<OwnershipRemoved>;

    /// Whether the store connection is currently usable.
    fn is_connected(&self) -> bool;
}

/// Reports the live controller fleet.
///
/// Consumers must always re-query the full set on change instead of
/// tracking deltas, so a missed notification cannot cause drift.
#[async_trait]
pub trait MembershipWatcher: Send + Sync {
    async fn current_members(&self) -> Result<BTreeSet<ProcessId>>;

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent>;
}
