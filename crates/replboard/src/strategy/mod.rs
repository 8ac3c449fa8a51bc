pub mod causal;
pub mod forward;
pub mod inform_all;
pub mod mutex;
pub mod sequenced;

pub use causal::CausalBroadcast;
pub use forward::CoordinatorForward;
pub use inform_all::InformAll;
pub use mutex::MutexSerialized;
pub use sequenced::SequencedReplication;

use crate::peer::{Peer, send_operation};
use crate::types::{Operation, ReplicaId, SequenceNumber};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, warn};

/// Send an operation to every replica except `my_id`, concurrently.
///
/// Best effort: a replica that fails is logged and skipped.
pub(crate) async fn broadcast(
    peers: &[Arc<dyn Peer>],
    my_id: ReplicaId,
    op: &Operation,
    seq: Option<SequenceNumber>,
) {
    let calls = peers
        .iter()
        .enumerate()
        .filter(|(id, _)| *id != my_id)
        .map(|(id, peer)| {
            let op = op.clone();
            async move { (id, send_operation(peer.as_ref(), op, seq).await) }
        });

    for (id, result) in join_all(calls).await {
        match result {
            Ok(_) => debug!("Propagated {} to replica {}", op.name(), id),
            Err(e) => warn!("Propagating {} to replica {} failed: {}", op.name(), id, e),
        }
    }
}
