//! Per-process bucket enactment.
//!
//! The `BucketManager` is the local authority for one service kind on one
//! controller process: it tracks which buckets the assignment map gives this
//! process, acquires and releases the ephemeral ownership markers, runs the
//! per-bucket background tasks, and participates in leader election.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex, Notify, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::{CoordinatorConfig, ServiceConfig};
use crate::distributor::BucketDistributor;
use crate::election::{LeadershipEvent, LeadershipPrimitive};
use crate::error::{BucketError, Result};
use crate::leader::{CoordinatorState, LeaderCoordinator};
use crate::retry::{jitter, with_indefinite_retries};
use crate::store::{AssignmentStore, MembershipWatcher, OwnershipStore, TakeOwnership};

/// Handle to one running bucket task.
#[async_trait]
pub trait BucketHandle: Send + Sync {
    async fn stop(self: Box<Self>);
}

/// Supplies the per-bucket background task. What a bucket actually does is
/// owned by the caller; the manager only starts and stops it.
#[async_trait]
pub trait BucketWorker: Send + Sync {
    async fn start(&self, bucket: u32) -> Box<dyn BucketHandle>;
}

/// Worker whose bucket tasks do nothing. Useful for tests and for running
/// the coordination layer on its own.
pub struct NoopWorker;

struct NoopHandle;

#[async_trait]
impl BucketHandle for NoopHandle {
    async fn stop(self: Box<Self>) {}
}

#[async_trait]
impl BucketWorker for NoopWorker {
    async fn start(&self, _bucket: u32) -> Box<dyn BucketHandle> {
        Box::new(NoopHandle)
    }
}

pub struct BucketManager {
    service: ServiceConfig,
    config: CoordinatorConfig,
    assignment: Arc<dyn AssignmentStore>,
    ownership: Arc<dyn OwnershipStore>,
    membership: Arc<dyn MembershipWatcher>,
    election: Arc<dyn LeadershipPrimitive>,
    distributor: Arc<dyn BucketDistributor>,
    worker: Arc<dyn BucketWorker>,
    /// Buckets this process has enacted: marker held, task running.
    held: Arc<RwLock<HashMap<u32, Box<dyn BucketHandle>>>>,
    /// Wakes the assignment listener for an immediate local reconcile,
    /// used by the leader coordinator after publishing a new map.
    local_reconcile: Arc<Notify>,
    /// Fires after each completed reconciliation pass.
    reconciled_tx: broadcast::Sender<()>,
    current_tenure: Arc<Mutex<Option<Arc<LeaderCoordinator>>>>,
    cancel: CancellationToken,
}

impl BucketManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        service: ServiceConfig,
        config: CoordinatorConfig,
        assignment: Arc<dyn AssignmentStore>,
        ownership: Arc<dyn OwnershipStore>,
        membership: Arc<dyn MembershipWatcher>,
        election: Arc<dyn LeadershipPrimitive>,
        distributor: Arc<dyn BucketDistributor>,
        worker: Arc<dyn BucketWorker>,
    ) -> Self {
        let (reconciled_tx, _) = broadcast::channel(64);
        Self {
            service,
            config,
            assignment,
            ownership,
            membership,
            election,
            distributor,
            worker,
            held: Arc::new(RwLock::new(HashMap::new())),
            local_reconcile: Arc::new(Notify::new()),
            reconciled_tx,
            current_tenure: Arc::new(Mutex::new(None)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn process_id(&self) -> &str {
        &self.config.process_id
    }

    pub fn service(&self) -> &ServiceConfig {
        &self.service
    }

    /// Whether the underlying store connection is currently usable.
    pub fn is_healthy(&self) -> bool {
        self.ownership.is_connected()
    }

    /// Buckets currently enacted by this process.
    pub async fn held_buckets(&self) -> BTreeSet<u32> {
        self.held.read().await.keys().copied().collect()
    }

    /// State of this process's leader coordinator, `Idle` when not leader.
    pub async fn coordinator_state(&self) -> CoordinatorState {
        match self.current_tenure.lock().await.as_ref() {
            Some(coordinator) => coordinator.state(),
            None => CoordinatorState::Idle,
        }
    }

    /// Notified after each completed reconciliation pass.
    pub fn subscribe_reconciled(&self) -> broadcast::Receiver<()> {
        self.reconciled_tx.subscribe()
    }

    /// Idempotently create the service's durable roots. Safe to call
    /// concurrently from multiple processes at first startup.
    pub async fn initialize_service(&self) -> Result<()> {
        self.assignment.create_root().await?;
        self.ownership.create_root().await
    }

    /// Idempotently create the structural placeholder for one bucket.
    pub async fn initialize_bucket(&self, bucket: u32) -> Result<()> {
        self.check_bucket(bucket)?;
        self.ownership.init_bucket(bucket).await
    }

    /// Attempt to create the ownership marker for `bucket` tagged with this
    /// process. The sole mechanism by which enacted ownership is
    /// established; concurrent attempts are resolved by the store's
    /// create-uniqueness guarantee.
    pub async fn take_bucket_ownership(&self, bucket: u32) -> Result<TakeOwnership> {
        self.check_bucket(bucket)?;
        self.ownership.try_take(bucket, &self.config.process_id).await
    }

    fn check_bucket(&self, bucket: u32) -> Result<()> {
        if bucket >= self.service.bucket_count {
            return Err(BucketError::InvalidBucket {
                bucket,
                bucket_count: self.service.bucket_count,
            });
        }
        Ok(())
    }

    /// Start all listeners and leadership participation.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        self.initialize_service().await?;
        self.clone().start_ownership_listener();
        self.clone().start_assignment_listener().await;
        self.start_leader_election().await?;
        Ok(())
    }

    /// Reconcile held buckets against the latest assignment map: acquire
    /// markers and start tasks for newly assigned buckets, release markers
    /// and stop tasks for buckets assigned elsewhere. Re-entrant; with an
    /// unchanged map and unchanged held set it performs no store operations.
    pub async fn manage_buckets(&self) -> Result<()> {
        let map = self.assignment.read().await?;
        let assigned = map.buckets_for(&self.config.process_id);
        tracing::debug!(
            service = %self.service.kind,
            process = %self.config.process_id,
            ?assigned,
            "Reconciling assigned buckets"
        );

        let mut held = self.held.write().await;

        let to_release: Vec<u32> = held
            .keys()
            .filter(|bucket| !assigned.contains(bucket))
            .copied()
            .collect();
        for bucket in to_release {
            self.ownership
                .release(bucket, &self.config.process_id)
                .await?;
            if let Some(handle) = held.remove(&bucket) {
                handle.stop().await;
            }
            tracing::info!(
                service = %self.service.kind,
                bucket,
                "Released bucket, reassigned to another process"
            );
        }

        for bucket in assigned {
            if held.contains_key(&bucket) {
                continue;
            }
            match self
                .ownership
                .try_take(bucket, &self.config.process_id)
                .await?
            {
                outcome @ (TakeOwnership::Acquired | TakeOwnership::AlreadyOwnedBySelf) => {
                    let handle = self.worker.start(bucket).await;
                    held.insert(bucket, handle);
                    tracing::info!(
                        service = %self.service.kind,
                        bucket,
                        ?outcome,
                        "Took bucket ownership, task started"
                    );
                }
                TakeOwnership::OwnedByOther(other) => {
                    // Normal outcome of the create-uniqueness race; the
                    // marker removal notification drives a later retry.
                    tracing::debug!(
                        service = %self.service.kind,
                        bucket,
                        owner = %other,
                        "Bucket marker still held elsewhere"
                    );
                }
            }
        }
        drop(held);

        let _ = self.reconciled_tx.send(());
        Ok(())
    }

    /// React to ownership-marker removals. A removed marker for a bucket
    /// the latest map still assigns to this process is re-acquired with
    /// unbounded retries; a deliberate reassignment is left alone.
    pub fn start_ownership_listener(self: Arc<Self>) {
        let manager = self;
        let mut removals = manager.ownership.subscribe_removals();
        let cancel = manager.cancel.clone();
        tokio::spawn(async move {
            tracing::info!(
                service = %manager.service.kind,
                "Bucket ownership listener registered"
            );
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = removals.recv() => match event {
                        Ok(removed) => {
                            // Re-acquisition runs asynchronously so it never
                            // blocks listener dispatch.
                            let manager = manager.clone();
                            tokio::spawn(async move {
                                manager.reacquire_after_loss(removed.bucket).await;
                            });
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::warn!(
                                service = %manager.service.kind,
                                missed,
                                "Ownership listener lagged, reconciling"
                            );
                            manager.local_reconcile.notify_one();
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
    }

    /// Indefinitely retry marker re-acquisition for `bucket`. The map is
    /// re-read on every attempt, so a reassignment that lands mid-retry
    /// stops the loop instead of fighting the new owner.
    async fn reacquire_after_loss(&self, bucket: u32) {
        let service = self.service.kind;
        let process = self.config.process_id.clone();
        let assignment = self.assignment.clone();
        let ownership = self.ownership.clone();
        let reacquired = with_indefinite_retries(
            &self.config.retry,
            &self.cancel,
            || {
                let assignment = assignment.clone();
                let ownership = ownership.clone();
                let process = process.clone();
                async move {
                    let map = assignment.read().await.map_err(|e| e.to_string())?;
                    if !map.buckets_for(&process).contains(&bucket) {
                        // Reassigned to another process; nothing to repair.
                        return Ok(false);
                    }
                    match ownership
                        .try_take(bucket, &process)
                        .await
                        .map_err(|e| e.to_string())?
                    {
                        TakeOwnership::Acquired | TakeOwnership::AlreadyOwnedBySelf => Ok(true),
                        TakeOwnership::OwnedByOther(other) => {
                            Err(format!("bucket {bucket} marker held by {other}"))
                        }
                    }
                }
            },
            |e| {
                tracing::warn!(
                    service = %service,
                    bucket,
                    error = %e,
                    "Attempt to take bucket ownership failed, will retry"
                );
            },
        )
        .await;

        match reacquired {
            Some(true) => {
                let mut held = self.held.write().await;
                if !held.contains_key(&bucket) {
                    let handle = self.worker.start(bucket).await;
                    held.insert(bucket, handle);
                }
                tracing::info!(service = %service, bucket, "Re-acquired bucket ownership after marker loss");
            }
            Some(false) => {
                // Deliberate reassignment; the releasing side of
                // reconciliation already stopped the local task if any.
                tracing::debug!(service = %service, bucket, "Marker loss was a reassignment, not retrying");
            }
            None => {}
        }
    }

    /// Watch the assignment map and reconcile on every change. Also runs
    /// one pass at startup so a late-joining process picks up the current
    /// map, and one whenever the local leader coordinator asks.
    pub async fn start_assignment_listener(self: Arc<Self>) {
        let manager = self;
        let mut changes = manager.assignment.subscribe();
        let cancel = manager.cancel.clone();
        tokio::spawn(async move {
            tracing::info!(
                service = %manager.service.kind,
                "Assignment map listener registered"
            );
            let mut retry_delay = manager.config.retry.initial_delay;
            manager.reconcile_logged(&mut retry_delay).await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = manager.local_reconcile.notified() => {
                        manager.reconcile_logged(&mut retry_delay).await;
                    }
                    event = changes.recv() => match event {
                        Ok(()) => manager.reconcile_logged(&mut retry_delay).await,
                        Err(broadcast::error::RecvError::Lagged(_)) => {
                            manager.reconcile_logged(&mut retry_delay).await;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
    }

    /// Run one reconciliation pass. A failed pass schedules its own
    /// delayed retry through `local_reconcile` so convergence after a
    /// store blip does not depend on unrelated events; the delay backs
    /// off until a pass succeeds.
    async fn reconcile_logged(&self, retry_delay: &mut Duration) {
        match self.manage_buckets().await {
            Ok(()) => *retry_delay = self.config.retry.initial_delay,
            Err(e) => {
                tracing::warn!(
                    service = %self.service.kind,
                    error = %e,
                    "Bucket reconciliation failed, will retry"
                );
                let notify = self.local_reconcile.clone();
                let cancel = self.cancel.clone();
                let delay = jitter(*retry_delay);
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(delay) => notify.notify_one(),
                    }
                });
                *retry_delay =
                    (*retry_delay * self.config.retry.multiplier).min(self.config.retry.max_delay);
            }
        }
    }

    /// Register as a leadership candidate and drive the leadership
    /// lifecycle: a coordinator per tenure, suspension on degraded
    /// connectivity, immediate interruption on connectivity loss.
    pub async fn start_leader_election(self: Arc<Self>) -> Result<()> {
        let mut events = self.election.campaign().await?;
        let manager = self;
        let cancel = manager.cancel.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                match event {
                    LeadershipEvent::Acquired(guard) => {
                        tracing::debug!(
                            service = %manager.service.kind,
                            epoch = guard.epoch(),
                            "Leadership tenure starting"
                        );
                        let coordinator = Arc::new(LeaderCoordinator::new(
                            manager.service.clone(),
                            manager.config.min_rebalance_interval,
                            manager.assignment.clone(),
                            manager.membership.clone(),
                            manager.distributor.clone(),
                            manager.local_reconcile.clone(),
                        ));
                        *manager.current_tenure.lock().await = Some(coordinator.clone());
                        let tenure_slot = manager.current_tenure.clone();
                        let service = manager.service.kind;
                        tokio::spawn(async move {
                            let result = coordinator.run().await;
                            // Only clear the slot if a newer tenure has not
                            // already replaced it.
                            let mut slot = tenure_slot.lock().await;
                            if slot
                                .as_ref()
                                .is_some_and(|current| Arc::ptr_eq(current, &coordinator))
                            {
                                *slot = None;
                            }
                            drop(slot);
                            // Dropping the guard returns control to the
                            // primitive, which elects the next leader.
                            drop(guard);
                            if let Err(e) = result {
                                tracing::warn!(service = %service, error = %e, "Leadership tenure ended with error");
                            }
                        });
                    }
                    LeadershipEvent::Lost => {
                        // A partitioned leader must not keep issuing stale
                        // assignments: abandon leadership immediately.
                        tracing::warn!(
                            service = %manager.service.kind,
                            "Connectivity lost, interrupting leadership"
                        );
                        manager.election.interrupt_leadership().await;
                        if let Some(coordinator) = manager.current_tenure.lock().await.as_ref() {
                            coordinator.interrupt();
                        }
                    }
                    LeadershipEvent::Suspended => {
                        if manager.election.has_leadership() {
                            tracing::info!(
                                service = %manager.service.kind,
                                "Connectivity suspended, pausing the coordinator"
                            );
                            if let Some(coordinator) =
                                manager.current_tenure.lock().await.as_ref()
                            {
                                coordinator.suspend();
                            }
                        }
                    }
                    LeadershipEvent::Recovered => {
                        if manager.election.has_leadership() {
                            tracing::info!(
                                service = %manager.service.kind,
                                "Connectivity recovered, resuming the coordinator"
                            );
                            if let Some(coordinator) =
                                manager.current_tenure.lock().await.as_ref()
                            {
                                coordinator.resume();
                            }
                        }
                    }
                    LeadershipEvent::StateChanged(state) => {
                        tracing::debug!(
                            service = %manager.service.kind,
                            state = %state,
                            "Leadership connection state changed"
                        );
                    }
                }
            }
        });
        Ok(())
    }

    /// Stop listeners, leadership participation and all bucket tasks.
    /// Markers are released explicitly rather than left to expire.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(coordinator) = self.current_tenure.lock().await.take() {
            coordinator.interrupt();
        }
        self.election.interrupt_leadership().await;
        self.election.close().await;

        let mut held = self.held.write().await;
        let buckets: Vec<u32> = held.keys().copied().collect();
        for bucket in buckets {
            if let Some(handle) = held.remove(&bucket) {
                handle.stop().await;
            }
            if let Err(e) = self.ownership.release(bucket, &self.config.process_id).await {
                tracing::debug!(
                    service = %self.service.kind,
                    bucket,
                    error = %e,
                    "Marker release on shutdown failed, marker will expire"
                );
            }
        }
        tracing::info!(
            service = %self.service.kind,
            process = %self.config.process_id,
            "Bucket manager stopped"
        );
    }
}

/// Convenience alias for a fully shared manager.
pub type SharedBucketManager = Arc<BucketManager>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceKind;
    use crate::distributor::UniformDistributor;
    use crate::election::InMemoryElection;
    use crate::store::InMemoryCoordination;

    fn manager_for(
        coordination: &InMemoryCoordination,
        election: &InMemoryElection,
        process: &str,
    ) -> Arc<BucketManager> {
        Arc::new(BucketManager::new(
            coordination.service().clone(),
            CoordinatorConfig::new(process),
            Arc::new(coordination.clone()),
            Arc::new(coordination.clone()),
            Arc::new(coordination.clone()),
            Arc::new(election.participant(process)),
            Arc::new(UniformDistributor),
            Arc::new(NoopWorker),
        ))
    }

    fn setup() -> (InMemoryCoordination, InMemoryElection) {
        let coordination =
            InMemoryCoordination::new(ServiceConfig::new(ServiceKind::Retention, 4));
        let election = InMemoryElection::new(ServiceKind::Retention);
        (coordination, election)
    }

    #[tokio::test]
    async fn initialize_bucket_rejects_out_of_range() {
        let (coordination, election) = setup();
        let manager = manager_for(&coordination, &election, "p1");
        manager.initialize_service().await.unwrap();

        manager.initialize_bucket(3).await.unwrap();
        let err = manager.initialize_bucket(5).await.unwrap_err();
        assert!(matches!(
            err,
            BucketError::InvalidBucket {
                bucket: 5,
                bucket_count: 4
            }
        ));
    }

    #[tokio::test]
    async fn initialize_service_is_concurrently_safe() {
        let (coordination, election) = setup();
        let a = manager_for(&coordination, &election, "p1");
        let b = manager_for(&coordination, &election, "p2");
        let (ra, rb) = tokio::join!(a.initialize_service(), b.initialize_service());
        ra.unwrap();
        rb.unwrap();
        assert!(AssignmentStore::read(&coordination).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn take_ownership_is_idempotent_for_self() {
        let (coordination, election) = setup();
        let manager = manager_for(&coordination, &election, "p1");
        manager.initialize_service().await.unwrap();

        assert_eq!(
            manager.take_bucket_ownership(1).await.unwrap(),
            TakeOwnership::Acquired
        );
        assert_eq!(
            manager.take_bucket_ownership(1).await.unwrap(),
            TakeOwnership::AlreadyOwnedBySelf
        );
        assert!(manager.take_bucket_ownership(9).await.is_err());
    }

    #[tokio::test]
    async fn manage_buckets_enacts_assignment() {
        let (coordination, election) = setup();
        let manager = manager_for(&coordination, &election, "p1");
        manager.initialize_service().await.unwrap();

        let mut map = crate::assignment::AssignmentMap::new();
        map.insert("p1".to_string(), [0u32, 2].into_iter().collect());
        map.insert("p2".to_string(), [1u32, 3].into_iter().collect());
        coordination.replace(&map).await.unwrap();

        manager.manage_buckets().await.unwrap();
        assert_eq!(
            manager.held_buckets().await,
            [0u32, 2].into_iter().collect::<BTreeSet<u32>>()
        );
        let owners = coordination.marker_owners().await;
        assert_eq!(owners.get(&0).map(String::as_str), Some("p1"));
        assert_eq!(owners.get(&2).map(String::as_str), Some("p1"));
        assert!(!owners.contains_key(&1));
    }

    #[tokio::test]
    async fn manage_buckets_releases_reassigned_buckets() {
        let (coordination, election) = setup();
        let manager = manager_for(&coordination, &election, "p1");
        manager.initialize_service().await.unwrap();

        let mut map = crate::assignment::AssignmentMap::new();
        map.insert("p1".to_string(), (0u32..4).collect());
        coordination.replace(&map).await.unwrap();
        manager.manage_buckets().await.unwrap();
        assert_eq!(manager.held_buckets().await.len(), 4);

        let mut map = crate::assignment::AssignmentMap::new();
        map.insert("p1".to_string(), [0u32, 1].into_iter().collect());
        map.insert("p2".to_string(), [2u32, 3].into_iter().collect());
        coordination.replace(&map).await.unwrap();
        manager.manage_buckets().await.unwrap();

        assert_eq!(
            manager.held_buckets().await,
            [0u32, 1].into_iter().collect::<BTreeSet<u32>>()
        );
        let owners = coordination.marker_owners().await;
        assert!(!owners.contains_key(&2));
        assert!(!owners.contains_key(&3));
    }

    #[tokio::test]
    async fn manage_buckets_skips_contended_buckets() {
        let (coordination, election) = setup();
        let manager = manager_for(&coordination, &election, "p1");
        manager.initialize_service().await.unwrap();

        // p2 still holds bucket 0's marker (it has not released yet).
        coordination.try_take(0, "p2").await.unwrap();
        let mut map = crate::assignment::AssignmentMap::new();
        map.insert("p1".to_string(), (0u32..4).collect());
        coordination.replace(&map).await.unwrap();

        manager.manage_buckets().await.unwrap();
        let held = manager.held_buckets().await;
        assert!(!held.contains(&0));
        assert_eq!(held, [1u32, 2, 3].into_iter().collect::<BTreeSet<u32>>());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_reconciliation_retries_until_store_recovers() {
        let (coordination, election) = setup();
        let config = CoordinatorConfig::new("p1").with_retry(crate::config::RetryPolicy {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            multiplier: 2,
        });
        let manager = Arc::new(BucketManager::new(
            coordination.service().clone(),
            config,
            Arc::new(coordination.clone()),
            Arc::new(coordination.clone()),
            Arc::new(coordination.clone()),
            Arc::new(election.participant("p1")),
            Arc::new(UniformDistributor),
            Arc::new(NoopWorker),
        ));
        manager.initialize_service().await.unwrap();

        let mut map = crate::assignment::AssignmentMap::new();
        map.insert("p1".to_string(), (0u32..4).collect());
        coordination.replace(&map).await.unwrap();

        // The store goes dark before the listener's first pass, which
        // must fail and reschedule itself.
        coordination.set_connected(false);
        manager.clone().start_assignment_listener().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(manager.held_buckets().await.is_empty());

        // No assignment change, no removal event: only the failure retry
        // can drive convergence once the store is back.
        coordination.set_connected(true);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while manager.held_buckets().await.len() < 4 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "reconciliation was not retried after the store recovered"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        manager.stop().await;
    }

    #[tokio::test]
    async fn health_follows_store_connectivity() {
        let (coordination, election) = setup();
        let manager = manager_for(&coordination, &election, "p1");
        assert!(manager.is_healthy());
        coordination.set_connected(false);
        assert!(!manager.is_healthy());
    }
}
