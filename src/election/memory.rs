//! In-process leader election.
//!
//! Candidates queue in campaign order; the head of the queue holds
//! leadership until it releases the guard, is interrupted, or closes, at
//! which point the next candidate is elected. Connectivity faults are
//! injected per process for tests and the simulator.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::assignment::ProcessId;
use crate::config::ServiceKind;
use crate::election::{LeadershipEvent, LeadershipGuard, LeadershipPrimitive};
use crate::error::Result;

#[derive(Debug)]
enum ElectionMsg {
    Campaign {
        process: ProcessId,
        events: mpsc::UnboundedSender<LeadershipEvent>,
    },
    Interrupt {
        process: ProcessId,
    },
    Close {
        process: ProcessId,
    },
    Inject {
        process: ProcessId,
        event: Connectivity,
    },
}

#[derive(Debug, Clone)]
enum Connectivity {
    Lost,
    Suspended,
    Recovered,
    Other(String),
}

struct ElectionState {
    leader: Option<(ProcessId, u64)>,
    epoch: u64,
    queue: VecDeque<ProcessId>,
    senders: HashMap<ProcessId, mpsc::UnboundedSender<LeadershipEvent>>,
    closed: HashSet<ProcessId>,
}

/// Cluster-wide election state for one service kind, shared by all
/// simulated processes.
#[derive(Clone)]
pub struct InMemoryElection {
    msg_tx: mpsc::UnboundedSender<ElectionMsg>,
    current_leader: Arc<Mutex<Option<ProcessId>>>,
}

impl InMemoryElection {
    pub fn new(service: ServiceKind) -> Self {
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let (release_tx, release_rx) = mpsc::unbounded_channel();
        let current_leader = Arc::new(Mutex::new(None));

        tokio::spawn(run_election(
            service,
            msg_rx,
            release_rx,
            release_tx,
            current_leader.clone(),
        ));

        Self {
            msg_tx,
            current_leader,
        }
    }

    /// Handle for one process to participate in this election.
    pub fn participant(&self, process: &str) -> InMemoryElector {
        InMemoryElector {
            election: self.clone(),
            process: process.to_string(),
        }
    }

    /// The process currently holding leadership, if any.
    pub fn leader(&self) -> Option<ProcessId> {
        self.current_leader
            .lock()
            .expect("election mutex poisoned")
            .clone()
    }

    /// Simulate a connectivity loss for one process.
    pub fn inject_connection_lost(&self, process: &str) {
        self.inject(process, Connectivity::Lost);
    }

    /// Simulate a connectivity suspension for one process.
    pub fn inject_suspended(&self, process: &str) {
        self.inject(process, Connectivity::Suspended);
    }

    /// Simulate connectivity recovery for one process.
    pub fn inject_recovered(&self, process: &str) {
        self.inject(process, Connectivity::Recovered);
    }

    /// Report an uninteresting connection-state transition.
    pub fn inject_state_change(&self, process: &str, text: &str) {
        self.inject(process, Connectivity::Other(text.to_string()));
    }

    fn inject(&self, process: &str, event: Connectivity) {
        let _ = self.msg_tx.send(ElectionMsg::Inject {
            process: process.to_string(),
            event,
        });
    }
}

/// One process's participation handle.
#[derive(Clone)]
pub struct InMemoryElector {
    election: InMemoryElection,
    process: ProcessId,
}

#[async_trait]
impl LeadershipPrimitive for InMemoryElector {
    async fn campaign(&self) -> Result<mpsc::UnboundedReceiver<LeadershipEvent>> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let _ = self.election.msg_tx.send(ElectionMsg::Campaign {
            process: self.process.clone(),
            events: events_tx,
        });
        Ok(events_rx)
    }

    async fn interrupt_leadership(&self) {
        let _ = self.election.msg_tx.send(ElectionMsg::Interrupt {
            process: self.process.clone(),
        });
    }

    async fn close(&self) {
        let _ = self.election.msg_tx.send(ElectionMsg::Close {
            process: self.process.clone(),
        });
    }

    fn has_leadership(&self) -> bool {
        self.election.leader().as_deref() == Some(self.process.as_str())
    }
}

async fn run_election(
    service: ServiceKind,
    mut msg_rx: mpsc::UnboundedReceiver<ElectionMsg>,
    mut release_rx: mpsc::UnboundedReceiver<u64>,
    release_tx: mpsc::UnboundedSender<u64>,
    current_leader: Arc<Mutex<Option<ProcessId>>>,
) {
    let mut state = ElectionState {
        leader: None,
        epoch: 0,
        queue: VecDeque::new(),
        senders: HashMap::new(),
        closed: HashSet::new(),
    };

    loop {
        tokio::select! {
            Some(msg) = msg_rx.recv() => match msg {
                ElectionMsg::Campaign { process, events } => {
                    tracing::debug!(service = %service, process = %process, "Candidate joined election");
                    state.closed.remove(&process);
                    state.senders.insert(process.clone(), events);
                    if !state.queue.contains(&process) {
                        state.queue.push_back(process);
                    }
                    if state.leader.is_none() {
                        elect_next(service, &mut state, &release_tx, &current_leader);
                    }
                }
                ElectionMsg::Interrupt { process } => {
                    if state.leader.as_ref().is_some_and(|(p, _)| *p == process) {
                        tracing::info!(service = %service, process = %process, "Leadership interrupted");
                        vacate(&mut state, &current_leader, true);
                        elect_next(service, &mut state, &release_tx, &current_leader);
                    }
                }
                ElectionMsg::Close { process } => {
                    state.closed.insert(process.clone());
                    state.senders.remove(&process);
                    state.queue.retain(|p| *p != process);
                    if state.leader.as_ref().is_some_and(|(p, _)| *p == process) {
                        vacate(&mut state, &current_leader, false);
                        elect_next(service, &mut state, &release_tx, &current_leader);
                    }
                }
                ElectionMsg::Inject { process, event } => {
                    if let Some(sender) = state.senders.get(&process) {
                        let mapped = match event {
                            Connectivity::Lost => LeadershipEvent::Lost,
                            Connectivity::Suspended => LeadershipEvent::Suspended,
                            Connectivity::Recovered => LeadershipEvent::Recovered,
                            Connectivity::Other(s) => LeadershipEvent::StateChanged(s),
                        };
                        let _ = sender.send(mapped);
                    }
                }
            },
            Some(epoch) = release_rx.recv() => {
                // Stale releases from guards of earlier tenures are ignored.
                if state.leader.as_ref().is_some_and(|(_, e)| *e == epoch) {
                    tracing::debug!(service = %service, epoch, "Leadership released");
                    vacate(&mut state, &current_leader, true);
                    elect_next(service, &mut state, &release_tx, &current_leader);
                }
            }
            else => break,
        }
    }
}

/// Clear the current leader; optionally re-queue it for a later tenure.
fn vacate(
    state: &mut ElectionState,
    current_leader: &Arc<Mutex<Option<ProcessId>>>,
    requeue: bool,
) {
    if let Some((process, _)) = state.leader.take() {
        *current_leader.lock().expect("election mutex poisoned") = None;
        if requeue && !state.closed.contains(&process) && !state.queue.contains(&process) {
            state.queue.push_back(process);
        }
    }
}

fn elect_next(
    service: ServiceKind,
    state: &mut ElectionState,
    release_tx: &mpsc::UnboundedSender<u64>,
    current_leader: &Arc<Mutex<Option<ProcessId>>>,
) {
    while let Some(candidate) = state.queue.pop_front() {
        if state.closed.contains(&candidate) {
            continue;
        }
        let Some(sender) = state.senders.get(&candidate) else {
            continue;
        };
        state.epoch += 1;
        let guard = LeadershipGuard::new(state.epoch, release_tx.clone());
        if sender.send(LeadershipEvent::Acquired(guard)).is_ok() {
            tracing::info!(service = %service, process = %candidate, epoch = state.epoch, "Leadership acquired");
            *current_leader.lock().expect("election mutex poisoned") = Some(candidate.clone());
            state.leader = Some((candidate, state.epoch));
            return;
        }
        // Receiver gone; treat as closed and try the next candidate.
        state.senders.remove(&candidate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn recv_acquired(
        rx: &mut mpsc::UnboundedReceiver<LeadershipEvent>,
    ) -> Option<LeadershipGuard> {
        match tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv()).await {
            Ok(Some(LeadershipEvent::Acquired(guard))) => Some(guard),
            _ => None,
        }
    }

    #[tokio::test]
    async fn first_candidate_wins() {
        let election = InMemoryElection::new(ServiceKind::Retention);
        let p1 = election.participant("p1");
        let mut rx = p1.campaign().await.unwrap();
        let guard = recv_acquired(&mut rx).await.expect("p1 elected");
        assert!(p1.has_leadership());
        assert_eq!(election.leader().as_deref(), Some("p1"));
        drop(guard);
    }

    #[tokio::test]
    async fn release_hands_leadership_to_next_candidate() {
        let election = InMemoryElection::new(ServiceKind::Retention);
        let p1 = election.participant("p1");
        let p2 = election.participant("p2");
        let mut rx1 = p1.campaign().await.unwrap();
        let mut rx2 = p2.campaign().await.unwrap();

        let guard = recv_acquired(&mut rx1).await.expect("p1 elected");
        drop(guard);

        let guard2 = recv_acquired(&mut rx2).await.expect("p2 elected next");
        assert!(p2.has_leadership());
        assert!(!p1.has_leadership());
        drop(guard2);

        // p1 was auto-requeued and gets leadership back.
        let guard1 = recv_acquired(&mut rx1).await.expect("p1 re-elected");
        assert!(p1.has_leadership());
        drop(guard1);
    }

    #[tokio::test]
    async fn interrupt_moves_leadership() {
        let election = InMemoryElection::new(ServiceKind::Retention);
        let p1 = election.participant("p1");
        let p2 = election.participant("p2");
        let mut rx1 = p1.campaign().await.unwrap();
        let mut rx2 = p2.campaign().await.unwrap();

        let _guard = recv_acquired(&mut rx1).await.expect("p1 elected");
        p1.interrupt_leadership().await;

        let _guard2 = recv_acquired(&mut rx2).await.expect("p2 elected");
        assert!(p2.has_leadership());
    }

    #[tokio::test]
    async fn stale_guard_release_is_ignored() {
        let election = InMemoryElection::new(ServiceKind::Retention);
        let p1 = election.participant("p1");
        let p2 = election.participant("p2");
        let mut rx1 = p1.campaign().await.unwrap();
        let mut rx2 = p2.campaign().await.unwrap();

        let stale = recv_acquired(&mut rx1).await.expect("p1 elected");
        p1.interrupt_leadership().await;
        let _guard2 = recv_acquired(&mut rx2).await.expect("p2 elected");

        // The old tenure's guard drops late; p2 must stay leader.
        drop(stale);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(p2.has_leadership());
    }

    #[tokio::test]
    async fn closed_candidate_is_never_elected() {
        let election = InMemoryElection::new(ServiceKind::Retention);
        let p1 = election.participant("p1");
        let p2 = election.participant("p2");
        let mut rx1 = p1.campaign().await.unwrap();
        let mut rx2 = p2.campaign().await.unwrap();

        let guard = recv_acquired(&mut rx1).await.expect("p1 elected");
        p2.close().await;
        drop(guard);

        // p2 closed, so p1 is re-elected instead.
        let _guard = recv_acquired(&mut rx1).await.expect("p1 re-elected");
        assert!(p1.has_leadership());
        assert!(recv_acquired(&mut rx2).await.is_none());
    }

    #[tokio::test]
    async fn injected_connectivity_events_are_delivered() {
        let election = InMemoryElection::new(ServiceKind::Retention);
        let p1 = election.participant("p1");
        let mut rx = p1.campaign().await.unwrap();
        let _guard = recv_acquired(&mut rx).await.expect("p1 elected");

        election.inject_suspended("p1");
        election.inject_recovered("p1");
        election.inject_state_change("p1", "read-only");

        assert!(matches!(rx.recv().await, Some(LeadershipEvent::Suspended)));
        assert!(matches!(rx.recv().await, Some(LeadershipEvent::Recovered)));
        assert!(matches!(rx.recv().await, Some(LeadershipEvent::StateChanged(_))));
    }
}
