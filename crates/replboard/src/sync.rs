use crate::board::Board;
use crate::error::{BoardError, Result};
use crate::peer::Peer;
use crate::types::{Message, Origin, ReplicaId};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pairwise reconciliation of board contents
///
/// Messages are matched by value, not position. Each side receives what it
/// is missing, so both end up holding the union. Deletions are not carried
/// over: a message deleted on one side comes back from the other.
pub struct AntiEntropy {
    my_id: ReplicaId,
    local: Arc<dyn Board>,
    peers: Vec<Arc<dyn Peer>>,
}

/// Outcome of one synchronisation round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncReport {
    pub pushed: usize,
    pub pulled: usize,
}

impl AntiEntropy {
    /// `local` should be the replica's own store, so pulled messages are not
    /// propagated again; `peers` is indexed by replica ID
    pub fn new(my_id: ReplicaId, local: Arc<dyn Board>, peers: Vec<Arc<dyn Peer>>) -> Self {
        Self {
            my_id,
            local,
            peers,
        }
    }

    pub async fn synchronize(&self, peer_id: ReplicaId) -> Result<SyncReport> {
        if peer_id == self.my_id {
            return Ok(SyncReport::default());
        }
        let peer = self
            .peers
            .get(peer_id)
            .ok_or(BoardError::UnknownReplica(peer_id))?;

        let remote = peer.get_board().await?;
        let local = self.local.get_board(Origin::Replica(self.my_id)).await?;

        let remote_set: HashSet<&Message> = remote.iter().collect();
        let local_set: HashSet<&Message> = local.iter().collect();
        let push: Vec<Message> = local
            .iter()
            .filter(|m| !remote_set.contains(m))
            .cloned()
            .collect();
        let pull: Vec<Message> = remote
            .iter()
            .filter(|m| !local_set.contains(m))
            .cloned()
            .collect();

        debug!(
            "Sync {} <-> {}: {} local, {} remote",
            self.my_id,
            peer_id,
            local.len(),
            remote.len()
        );

        let report = SyncReport {
            pushed: push.len(),
            pulled: pull.len(),
        };
        for message in push {
            peer.put(message, None).await?;
        }
        for message in pull {
            self.local
                .put(message, Origin::Replica(peer_id), None)
                .await?;
        }

        info!(
            "Synchronised replica {} with {}: pushed {}, pulled {}",
            self.my_id, peer_id, report.pushed, report.pulled
        );
        Ok(report)
    }

    /// Synchronise with every other replica in turn, one per tick
    pub fn spawn_periodic(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let sync = Arc::clone(self);
        tokio::spawn(async move {
            let others: Vec<ReplicaId> = (0..sync.peers.len())
                .filter(|id| *id != sync.my_id)
                .collect();
            if others.is_empty() {
                return;
            }
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            for peer_id in others.iter().cycle() {
                ticker.tick().await;
                if let Err(e) = sync.synchronize(*peer_id).await {
                    warn!(
                        "Periodic sync of {} with {} failed: {}",
                        sync.my_id, peer_id, e
                    );
                }
            }
        })
    }
}
