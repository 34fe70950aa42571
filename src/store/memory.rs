//! In-process coordination substrate.
//!
//! One `InMemoryCoordination` instance plays the role of the durable store
//! for a whole simulated fleet: every process handle shares the same inner
//! state, markers are ephemeral (a leaving process loses its markers), and
//! change notifications fan out over broadcast channels. Connectivity can be
//! toggled to exercise the transient-failure paths.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};

use crate::assignment::{AssignmentMap, ProcessId};
use crate::config::ServiceConfig;
use crate::error::{BucketError, Result};
use crate::store::{
    AssignmentStore, MembershipEvent, MembershipWatcher, OwnershipRemoved, OwnershipStore,
    TakeOwnership,
};

struct State {
    /// Encoded assignment map; `None` until the root is created. Stored in
    /// its wire encoding so reads go through the same path a remote store
    /// would use.
    assignment: Option<String>,
    bucket_roots: BTreeSet<u32>,
    markers: HashMap<u32, ProcessId>,
    members: BTreeSet<ProcessId>,
}

struct Inner {
    service: ServiceConfig,
    state: RwLock<State>,
    connected: AtomicBool,
    assignment_tx: broadcast::Sender<()>,
    removal_tx: broadcast::Sender<OwnershipRemoved>,
    membership_tx: broadcast::Sender<MembershipEvent>,
}

/// Shared in-memory coordination substrate for one service kind.
#[derive(Clone)]
pub struct InMemoryCoordination {
    inner: Arc<Inner>,
}

impl InMemoryCoordination {
    pub fn new(service: ServiceConfig) -> Self {
        let (assignment_tx, _) = broadcast::channel(64);
        let (removal_tx, _) = broadcast::channel(64);
        let (membership_tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                service,
                state: RwLock::new(State {
                    assignment: None,
                    bucket_roots: BTreeSet::new(),
                    markers: HashMap::new(),
                    members: BTreeSet::new(),
                }),
                connected: AtomicBool::new(true),
                assignment_tx,
                removal_tx,
                membership_tx,
            }),
        }
    }

    pub fn service(&self) -> &ServiceConfig {
        &self.inner.service
    }

    fn check_connected(&self) -> Result<()> {
        if self.inner.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BucketError::Store(format!(
                "{}: coordination store unreachable",
                self.inner.service.kind
            )))
        }
    }

    /// Toggle simulated store connectivity.
    pub fn set_connected(&self, connected: bool) {
        self.inner.connected.store(connected, Ordering::SeqCst);
    }

    /// Register a process as a live fleet member.
    pub async fn join(&self, process: &str) {
        let mut state = self.inner.state.write().await;
        if state.members.insert(process.to_string()) {
            let _ = self
                .inner
                .membership_tx
                .send(MembershipEvent::Joined(process.to_string()));
        }
    }

    /// Remove a process from the fleet. Its ephemeral markers disappear
    /// with it, as they would on session expiry.
    pub async fn leave(&self, process: &str) {
        let mut state = self.inner.state.write().await;
        if !state.members.remove(process) {
            return;
        }
        let orphaned: Vec<u32> = state
            .markers
            .iter()
            .filter(|(_, owner)| owner.as_str() == process)
            .map(|(&bucket, _)| bucket)
            .collect();
        for bucket in orphaned {
            state.markers.remove(&bucket);
            let _ = self.inner.removal_tx.send(OwnershipRemoved { bucket });
        }
        let _ = self
            .inner
            .membership_tx
            .send(MembershipEvent::Left(process.to_string()));
    }

    /// Delete a marker out of band, regardless of owner. Emits the same
    /// removal notification a store-side expiry would.
    pub async fn remove_marker(&self, bucket: u32) -> Option<ProcessId> {
        let mut state = self.inner.state.write().await;
        let owner = state.markers.remove(&bucket);
        if owner.is_some() {
            let _ = self.inner.removal_tx.send(OwnershipRemoved { bucket });
        }
        owner
    }

    /// Current marker owners, keyed by bucket.
    pub async fn marker_owners(&self) -> BTreeMap<u32, ProcessId> {
        let state = self.inner.state.read().await;
        state.markers.iter().map(|(&b, p)| (b, p.clone())).collect()
    }
}

#[async_trait]
impl AssignmentStore for InMemoryCoordination {
    async fn create_root(&self) -> Result<()> {
        self.check_connected()?;
        let mut state = self.inner.state.write().await;
        if state.assignment.is_none() {
            let encoded = serde_json::to_string(&AssignmentMap::new())
                .map_err(|e| BucketError::Store(e.to_string()))?;
            state.assignment = Some(encoded);
        }
        Ok(())
    }

    async fn read(&self) -> Result<AssignmentMap> {
        self.check_connected()?;
        let state = self.inner.state.read().await;
        match &state.assignment {
            Some(encoded) => {
                serde_json::from_str(encoded).map_err(|e| BucketError::Store(e.to_string()))
            }
            None => Err(BucketError::Store(format!(
                "{}: assignment root does not exist",
                self.inner.service.kind
            ))),
        }
    }

    async fn replace(&self, map: &AssignmentMap) -> Result<()> {
        self.check_connected()?;
        let encoded =
            serde_json::to_string(map).map_err(|e| BucketError::Store(e.to_string()))?;
        let mut state = self.inner.state.write().await;
        state.assignment = Some(encoded);
        drop(state);
        let _ = self.inner.assignment_tx.send(());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<()> {
        self.inner.assignment_tx.subscribe()
    }
}

#[async_trait]
impl OwnershipStore for InMemoryCoordination {
    async fn create_root(&self) -> Result<()> {
        self.check_connected()
    }

    async fn init_bucket(&self, bucket: u32) -> Result<()> {
        self.check_connected()?;
        let mut state = self.inner.state.write().await;
        state.bucket_roots.insert(bucket);
        Ok(())
    }

    async fn try_take(&self, bucket: u32, process: &str) -> Result<TakeOwnership> {
        self.check_connected()?;
        let mut state = self.inner.state.write().await;
        match state.markers.get(&bucket) {
            Some(owner) if owner == process => Ok(TakeOwnership::AlreadyOwnedBySelf),
            Some(owner) => Ok(TakeOwnership::OwnedByOther(owner.clone())),
            None => {
                state.markers.insert(bucket, process.to_string());
                Ok(TakeOwnership::Acquired)
            }
        }
    }

    async fn release(&self, bucket: u32, process: &str) -> Result<()> {
        self.check_connected()?;
        let mut state = self.inner.state.write().await;
        if state.markers.get(&bucket).is_some_and(|owner| owner == process) {
            state.markers.remove(&bucket);
            let _ = self.inner.removal_tx.send(OwnershipRemoved { bucket });
        }
        Ok(())
    }

    fn subscribe_removals(&self) -> broadcast::Receiver<OwnershipRemoved> {
        self.inner.removal_tx.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MembershipWatcher for InMemoryCoordination {
    async fn current_members(&self) -> Result<BTreeSet<ProcessId>> {
        self.check_connected()?;
        let state = self.inner.state.read().await;
        Ok(state.members.clone())
    }

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.inner.membership_tx.subscribe()
    }
}
