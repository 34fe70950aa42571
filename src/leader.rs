//! Leader-side rebalancing.
//!
//! One `LeaderCoordinator` is created per leadership tenure and runs only
//! while this process holds the service's leadership. It watches fleet
//! membership, coalesces change signals into single rebalance passes, and
//! publishes new assignment maps through the assignment store.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ServiceConfig;
use crate::distributor::BucketDistributor;
use crate::error::{BucketError, Result};
use crate::store::{AssignmentStore, MembershipWatcher};

/// Coordinator lifecycle for one leadership tenure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    /// Not leader; no activity.
    Idle,
    /// Leader with usable connectivity; rebalance passes run.
    Active,
    /// Leader with degraded connectivity; all rebalance scheduling is held
    /// and no assignment writes occur.
    Suspended,
    /// Tenure over, either by interruption or a fatal rebalance failure.
    Relinquished,
}

pub struct LeaderCoordinator {
    service: ServiceConfig,
    min_rebalance_interval: Duration,
    assignment: Arc<dyn AssignmentStore>,
    membership: Arc<dyn MembershipWatcher>,
    distributor: Arc<dyn BucketDistributor>,
    /// Signals the local manager to reconcile after a pass.
    local_reconcile: Arc<Notify>,
    /// Coalescing rebalance trigger: any number of signals before the loop
    /// drains them collapse into a single pass.
    rebalance: Arc<Notify>,
    suspend_tx: watch::Sender<bool>,
    state_tx: watch::Sender<CoordinatorState>,
    cancel: CancellationToken,
}

impl LeaderCoordinator {
    pub fn new(
        service: ServiceConfig,
        min_rebalance_interval: Duration,
        assignment: Arc<dyn AssignmentStore>,
        membership: Arc<dyn MembershipWatcher>,
        distributor: Arc<dyn BucketDistributor>,
        local_reconcile: Arc<Notify>,
    ) -> Self {
        let (suspend_tx, _) = watch::channel(false);
        let (state_tx, _) = watch::channel(CoordinatorState::Idle);
        Self {
            service,
            min_rebalance_interval,
            assignment,
            membership,
            distributor,
            local_reconcile,
            rebalance: Arc::new(Notify::new()),
            suspend_tx,
            state_tx,
            cancel: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<CoordinatorState> {
        self.state_tx.subscribe()
    }

    /// Hold all rebalance scheduling while connectivity is degraded.
    pub fn suspend(&self) {
        self.suspend_tx.send_replace(true);
    }

    /// Wake the loop after connectivity recovers, without re-triggering
    /// leadership acquisition.
    pub fn resume(&self) {
        self.suspend_tx.send_replace(false);
    }

    /// End this tenure. Interrupts any in-flight rebalance pass.
    pub fn interrupt(&self) {
        self.cancel.cancel();
    }

    /// Schedule a rebalance pass.
    pub fn request_rebalance(&self) {
        self.rebalance.notify_one();
    }

    /// Run the tenure until interrupted or a fatal failure.
    ///
    /// On entry one pass is scheduled immediately, repairing any membership
    /// events missed during leadership handoff. Failures while suspended
    /// are swallowed (the cause is transient connectivity, already being
    /// handled); failures while active end the tenure with
    /// `LeadershipLost` so the primitive can elect a new leader.
    pub async fn run(&self) -> Result<()> {
        self.state_tx.send_replace(CoordinatorState::Active);
        tracing::info!(
            service = %self.service.kind,
            "Obtained leadership, monitoring fleet for bucket rebalancing"
        );
        self.rebalance.notify_one();

        let forwarder_cancel = self.cancel.child_token();
        self.spawn_membership_forwarder(forwarder_cancel.clone());

        let mut suspend_rx = self.suspend_tx.subscribe();
        let mut last_pass: Option<Instant> = None;

        let result = loop {
            if *suspend_rx.borrow() {
                self.state_tx.send_replace(CoordinatorState::Suspended);
                tracing::info!(service = %self.service.kind, "Coordinator suspended, waiting for recovery");
                tokio::select! {
                    _ = self.cancel.cancelled() => break Ok(()),
                    changed = suspend_rx.wait_for(|suspended| !*suspended) => {
                        if changed.is_err() {
                            break Ok(());
                        }
                    }
                }
                self.state_tx.send_replace(CoordinatorState::Active);
                tracing::info!(service = %self.service.kind, "Coordinator resumed");
                continue;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break Ok(()),
                _ = self.rebalance.notified() => {}
            }
            if *suspend_rx.borrow() {
                // Re-arm the signal and handle the suspension first.
                self.rebalance.notify_one();
                continue;
            }

            // Throttle consecutive passes within this tenure. Not enforced
            // across leadership handoffs.
            if self.min_rebalance_interval > Duration::ZERO {
                if let Some(last) = last_pass {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break Ok(()),
                        _ = tokio::time::sleep_until(last + self.min_rebalance_interval) => {}
                    }
                    if *suspend_rx.borrow() {
                        // Suspended while the pass sat in the throttle
                        // window; it stays queued until recovery.
                        self.rebalance.notify_one();
                        continue;
                    }
                }
            }

            let pass = tokio::select! {
                _ = self.cancel.cancelled() => break Ok(()),
                result = self.rebalance_pass() => result,
            };
            match pass {
                Ok(_) => {
                    last_pass = Some(Instant::now());
                }
                Err(e) if *suspend_rx.borrow() => {
                    tracing::warn!(
                        service = %self.service.kind,
                        error = %e,
                        "Rebalance failed while suspended, keeping leadership"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        service = %self.service.kind,
                        error = %e,
                        "Rebalance failed, relinquishing leadership"
                    );
                    break Err(BucketError::LeadershipLost(e.to_string()));
                }
            }
        };

        forwarder_cancel.cancel();
        self.state_tx.send_replace(CoordinatorState::Relinquished);
        result
    }

    /// Forward fleet join/leave notifications into the coalescing trigger.
    /// The full membership set is re-read on every pass; events only wake
    /// the loop.
    fn spawn_membership_forwarder(&self, cancel: CancellationToken) {
        let mut membership_rx = self.membership.subscribe();
        let rebalance = self.rebalance.clone();
        let service = self.service.kind;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = membership_rx.recv() => match event {
                        Ok(event) => {
                            tracing::info!(service = %service, ?event, "Fleet changed, waking leader for rebalance");
                            rebalance.notify_one();
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {
                            rebalance.notify_one();
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
    }

    /// One rebalance pass: read the latest membership and assignment map,
    /// distribute, write back only if the result differs, then ask the
    /// local manager to reconcile.
    async fn rebalance_pass(&self) -> Result<()> {
        let members = self.membership.current_members().await?;
        let old = self.assignment.read().await?;
        let new = self
            .distributor
            .distribute(&old, &members, self.service.bucket_count);
        if new != old {
            self.assignment.replace(&new).await?;
            tracing::info!(
                service = %self.service.kind,
                processes = members.len(),
                buckets = new.assigned_count(),
                "Published new bucket assignment"
            );
        }
        self.local_reconcile.notify_one();
        Ok(())
    }
}
