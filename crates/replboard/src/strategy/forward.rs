use crate::board::{Board, apply_operation};
use crate::error::{BoardError, Result};
use crate::peer::{Peer, send_operation};
use crate::strategy::broadcast;
use crate::types::{Ack, Message, Operation, Origin, ReplicaId, SequenceNumber};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Primary-backup replication with a fixed coordinator
///
/// Backups forward client writes to the coordinator and only apply writes
/// that come from it. The coordinator broadcasts then applies under a local
/// lock, so every replica sees writes in the coordinator's order.
pub struct CoordinatorForward<S: Board> {
    my_id: ReplicaId,
    coordinator: ReplicaId,
    local: Arc<S>,
    peers: Vec<Arc<dyn Peer>>,
    write_path: Mutex<()>,
}

impl<S: Board> CoordinatorForward<S> {
    pub fn new(
        my_id: ReplicaId,
        coordinator: ReplicaId,
        local: Arc<S>,
        peers: Vec<Arc<dyn Peer>>,
    ) -> Self {
        Self {
            my_id,
            coordinator,
            local,
            peers,
            write_path: Mutex::new(()),
        }
    }

    pub fn is_coordinator(&self) -> bool {
        self.my_id == self.coordinator
    }

    async fn write(
        &self,
        op: Operation,
        origin: Origin,
        seq: Option<SequenceNumber>,
    ) -> Result<Ack> {
        if self.is_coordinator() {
            let _serialized = self.write_path.lock().await;
            debug!("Coordinator {} ordering {} from {}", self.my_id, op.name(), origin);
            broadcast(&self.peers, self.my_id, &op, seq).await;
            apply_operation(&*self.local, op, Origin::Replica(self.my_id), seq).await
        } else if origin == Origin::Replica(self.coordinator) {
            apply_operation(&*self.local, op, origin, seq).await
        } else {
            debug!(
                "Replica {} forwarding {} to coordinator {}",
                self.my_id,
                op.name(),
                self.coordinator
            );
            let coordinator = self
                .peers
                .get(self.coordinator)
                .ok_or(BoardError::UnknownReplica(self.coordinator))?;
            send_operation(coordinator.as_ref(), op, seq).await
        }
    }
}

#[async_trait]
impl<S: Board> Board for CoordinatorForward<S> {
    async fn put(
        &self,
        message: Message,
        origin: Origin,
        seq: Option<SequenceNumber>,
    ) -> Result<Ack> {
        self.write(Operation::Put(message), origin, seq).await
    }

    async fn get(&self, index: usize, origin: Origin) -> Result<Message> {
        self.local.get(index, origin).await
    }

    async fn get_num(&self, origin: Origin) -> Result<usize> {
        self.local.get_num(origin).await
    }

    async fn get_board(&self, origin: Origin) -> Result<Vec<Message>> {
        self.local.get_board(origin).await
    }

    async fn modify(
        &self,
        index: usize,
        message: Message,
        origin: Origin,
        seq: Option<SequenceNumber>,
    ) -> Result<Ack> {
        self.write(Operation::Modify(index, message), origin, seq)
            .await
    }

    async fn delete(
        &self,
        index: usize,
        origin: Origin,
        seq: Option<SequenceNumber>,
    ) -> Result<Ack> {
        self.write(Operation::Delete(index), origin, seq).await
    }

    async fn delete_all(&self, origin: Origin, seq: Option<SequenceNumber>) -> Result<Ack> {
        self.write(Operation::DeleteAll, origin, seq).await
    }

    async fn close(&self) -> Result<()> {
        self.local.close().await
    }
}
