//! Leadership primitive contract.
//!
//! Grants at most one process exclusive leader status per service kind.
//! Connection-state transitions are delivered as tagged events on the same
//! channel as acquisition, so a manager drives its whole leadership
//! lifecycle off one receiver.

pub mod memory;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

pub use memory::{InMemoryElection, InMemoryElector};

/// Releases leadership when dropped. Held by the elected process for the
/// duration of its tenure.
#[derive(Debug)]
pub struct LeadershipGuard {
    epoch: u64,
    release: Option<mpsc::UnboundedSender<u64>>,
}

impl LeadershipGuard {
    pub(crate) fn new(epoch: u64, release: mpsc::UnboundedSender<u64>) -> Self {
        Self {
            epoch,
            release: Some(release),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl Drop for LeadershipGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            let _ = release.send(self.epoch);
        }
    }
}

/// Leadership lifecycle notification.
#[derive(Debug)]
pub enum LeadershipEvent {
    /// This process now holds leadership; the tenure lasts until the guard
    /// is dropped or leadership is interrupted.
    Acquired(LeadershipGuard),
    /// Connectivity to the coordination substrate is gone; leadership must
    /// be abandoned immediately.
    Lost,
    /// Connectivity degraded while leadership is still nominally held.
    Suspended,
    /// Connectivity recovered after a suspension.
    Recovered,
    /// Any other connection-state transition, reported for logging only.
    StateChanged(String),
}

/// Per-process handle into the election for one service kind.
#[async_trait]
pub trait LeadershipPrimitive: Send + Sync {
    /// Register this process as a leadership candidate. Events arrive on
    /// the returned receiver; candidates are automatically re-queued after
    /// each tenure ends.
    async fn campaign(&self) -> Result<mpsc::UnboundedReceiver<LeadershipEvent>>;

    /// Abandon currently held leadership, if any. The candidate stays in
    /// the election and may be re-elected later.
    async fn interrupt_leadership(&self);

    /// Leave the election permanently, releasing leadership if held.
    async fn close(&self);

    /// Whether this process currently holds leadership.
    fn has_leadership(&self) -> bool;
}
