use crate::error::{BoardError, Result};
use crate::peer::Peer;
use crate::types::ReplicaId;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Default wait for the winner to announce itself after a "Take-Over"
pub const DEFAULT_ELECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// What this replica believes about leadership
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CoordinatorState {
    pub coordinator: Option<ReplicaId>,
    pub election_in_flight: bool,
}

/// Bully leader election
///
/// `peers` is the full replica list indexed by ID, this replica included.
/// The highest reachable ID always wins. State changes are published on a
/// watch channel so callers blocked on an election wake as soon as somebody
/// announces a coordinator.
pub struct LeaderElection {
    my_id: ReplicaId,
    peers: Vec<Arc<dyn Peer>>,
    state: watch::Sender<CoordinatorState>,
    election_timeout: Option<Duration>,
}

impl LeaderElection {
    pub fn new(
        my_id: ReplicaId,
        peers: Vec<Arc<dyn Peer>>,
        election_timeout: Option<Duration>,
    ) -> Self {
        let (state, _) = watch::channel(CoordinatorState::default());
        Self {
            my_id,
            peers,
            state,
            election_timeout,
        }
    }

    pub fn my_id(&self) -> ReplicaId {
        self.my_id
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state.borrow()
    }

    /// Coordinator currently known, without probing or electing
    pub fn current(&self) -> Option<ReplicaId> {
        self.state.borrow().coordinator
    }

    /// Handle for calling a replica by ID
    pub fn peer(&self, id: ReplicaId) -> Result<Arc<dyn Peer>> {
        self.peers
            .get(id)
            .cloned()
            .ok_or(BoardError::UnknownReplica(id))
    }

    /// Known coordinator if it still answers, otherwise the winner of a new
    /// election
    pub async fn get_coordinator(&self) -> Result<ReplicaId> {
        if let Some(id) = self.current() {
            if id == self.my_id {
                return Ok(id);
            }
            match self.peer(id)?.are_you_alive().await {
                Ok(true) => return Ok(id),
                Ok(false) => warn!("Coordinator {} did not confirm liveness", id),
                Err(e) => warn!("Coordinator {} unreachable: {}", id, e),
            }
            self.state.send_modify(|s| {
                if s.coordinator == Some(id) {
                    s.coordinator = None;
                }
            });
        }
        self.start_election().await
    }

    /// Run an election, or join the one already running, and return the
    /// coordinator it settles on
    pub async fn start_election(&self) -> Result<ReplicaId> {
        let mut rx = self.state.subscribe();
        if !self.try_claim() {
            debug!("Replica {} waiting on election in flight", self.my_id);
            return self.wait_for_coordinator(&mut rx).await;
        }
        self.lead(&mut rx).await
    }

    /// Mark an election as running; false if one already is
    fn try_claim(&self) -> bool {
        let mut claimed = false;
        self.state.send_modify(|s| {
            if !s.election_in_flight {
                s.election_in_flight = true;
                s.coordinator = None;
                claimed = true;
            }
        });
        claimed
    }

    async fn lead(&self, rx: &mut watch::Receiver<CoordinatorState>) -> Result<ReplicaId> {
        loop {
            info!("Replica {} starting election", self.my_id);
            let higher: Vec<(ReplicaId, Arc<dyn Peer>)> = self
                .peers
                .iter()
                .enumerate()
                .skip(self.my_id + 1)
                .map(|(id, peer)| (id, Arc::clone(peer)))
                .collect();

            let replies = join_all(
                higher
                    .iter()
                    .map(|(id, peer)| async move { (*id, peer.election().await) }),
            )
            .await;

            let mut taken_over = false;
            for (id, reply) in replies {
                match reply {
                    Ok(true) => {
                        debug!("Replica {} took over from {}", id, self.my_id);
                        taken_over = true;
                    }
                    Ok(false) => debug!("Replica {} declined election", id),
                    Err(e) => debug!("Replica {} unreachable during election: {}", id, e),
                }
            }

            if !taken_over {
                self.announce().await;
                return Ok(self.my_id);
            }

            let Some(limit) = self.election_timeout else {
                return self.wait_for_coordinator(rx).await;
            };
            match tokio::time::timeout(limit, self.wait_for_coordinator(rx)).await {
                Ok(result) => return result,
                Err(_) => warn!(
                    "Replica {}: no coordinator announced within {:?}, re-electing",
                    self.my_id, limit
                ),
            }
        }
    }

    async fn wait_for_coordinator(
        &self,
        rx: &mut watch::Receiver<CoordinatorState>,
    ) -> Result<ReplicaId> {
        let state = rx
            .wait_for(|s| s.coordinator.is_some())
            .await
            .map(|s| *s)
            .map_err(|_| BoardError::NoElection)?;
        state.coordinator.ok_or(BoardError::NoElection)
    }

    /// Become coordinator and tell everybody, ignoring replicas that do not
    /// answer
    async fn announce(&self) {
        info!("Replica {} is the new coordinator", self.my_id);
        self.set_coordinator(self.my_id);

        let calls = self
            .peers
            .iter()
            .enumerate()
            .filter(|(id, _)| *id != self.my_id)
            .map(|(id, peer)| async move { (id, peer.set_coordinator(self.my_id).await) });
        for (id, result) in join_all(calls).await {
            if let Err(e) = result {
                debug!("Could not announce coordinator to replica {}: {}", id, e);
            }
        }
    }

    /// Remote ELECTION message: the caller is answered "Take-Over" and this
    /// replica runs its own election in the background
    pub fn on_election(self: &Arc<Self>) {
        if !self.try_claim() {
            debug!("Replica {} already electing", self.my_id);
            return;
        }
        let election = Arc::clone(self);
        tokio::spawn(async move {
            let mut rx = election.state.subscribe();
            if let Err(e) = election.lead(&mut rx).await {
                warn!("Election on replica {} failed: {}", election.my_id, e);
            }
        });
    }

    /// Record a coordinator announcement and wake local waiters
    pub fn set_coordinator(&self, coordinator: ReplicaId) {
        info!(
            "Replica {} accepts {} as coordinator",
            self.my_id, coordinator
        );
        self.state.send_modify(|s| {
            s.coordinator = Some(coordinator);
            s.election_in_flight = false;
        });
    }
}
