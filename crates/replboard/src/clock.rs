use crate::types::{ReplicaId, VectorTime};
use tokio::sync::RwLock;
use tracing::trace;

/// Vector clock owned by one replica
///
/// Reading the clock for a new timestamp (`tick`) counts as an event and
/// advances the owner's component. `merge` is applied whenever a remote
/// timestamp is received.
pub struct VectorClock {
    owner: ReplicaId,
    time: RwLock<VectorTime>,
}

impl VectorClock {
    pub fn new(replicas: usize, owner: ReplicaId) -> Self {
        Self {
            owner,
            time: RwLock::new(VectorTime::new(replicas.max(owner + 1))),
        }
    }

    pub fn owner(&self) -> ReplicaId {
        self.owner
    }

    /// Advance own component and return the resulting snapshot
    pub async fn tick(&self) -> VectorTime {
        let mut time = self.time.write().await;
        time.increment(self.owner);
        trace!("clock {} ticked to {}", self.owner, time);
        time.clone()
    }

    /// Current time without advancing
    pub async fn peek(&self) -> VectorTime {
        self.time.read().await.clone()
    }

    /// Fold in a timestamp received from another replica
    pub async fn merge(&self, remote: &VectorTime) {
        let mut time = self.time.write().await;
        *time = time.merged(remote, self.owner);
        trace!("clock {} merged {} -> {}", self.owner, remote, time);
    }
}
