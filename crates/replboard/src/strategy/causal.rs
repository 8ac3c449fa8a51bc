use crate::board::{Board, apply_operation};
use crate::clock::VectorClock;
use crate::error::Result;
use crate::peer::Peer;
use crate::strategy::broadcast;
use crate::types::{Ack, Message, Operation, Origin, ReplicaId, SequenceNumber};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Replication by vector timestamp
///
/// The replica a client writes to stamps the message with its clock, applies
/// it and broadcasts it as is; everybody else applies what they receive. The
/// local store is expected to keep messages sorted by timestamp
/// ([`crate::storage::BoardOrder::TotalOrder`]), which is what makes replicas
/// that hold the same messages show them in the same order.
pub struct CausalBroadcast<S: Board> {
    my_id: ReplicaId,
    clock: Arc<VectorClock>,
    local: Arc<S>,
    peers: Vec<Arc<dyn Peer>>,
}

impl<S: Board> CausalBroadcast<S> {
    pub fn new(
        my_id: ReplicaId,
        clock: Arc<VectorClock>,
        local: Arc<S>,
        peers: Vec<Arc<dyn Peer>>,
    ) -> Self {
        Self {
            my_id,
            clock,
            local,
            peers,
        }
    }

    fn originates_here(&self, origin: Origin) -> bool {
        origin.is_client() || origin == Origin::Replica(self.my_id)
    }

    /// Apply locally, then hand the very same operation to every peer
    async fn apply_and_propagate(
        &self,
        op: Operation,
        seq: Option<SequenceNumber>,
    ) -> Result<Ack> {
        let ack = apply_operation(&*self.local, op.clone(), Origin::Replica(self.my_id), seq).await?;
        broadcast(&self.peers, self.my_id, &op, seq).await;
        Ok(ack)
    }
}

#[async_trait]
impl<S: Board> Board for CausalBroadcast<S> {
    async fn put(
        &self,
        message: Message,
        origin: Origin,
        seq: Option<SequenceNumber>,
    ) -> Result<Ack> {
        if !self.originates_here(origin) {
            return self.local.put(message, origin, seq).await;
        }

        let message = match message {
            Message::Text(text) => {
                let time = self.clock.tick().await;
                debug!("Replica {} stamped '{}' with {}", self.my_id, text, time);
                Message::Timestamped(time, text)
            }
            stamped => stamped,
        };
        self.apply_and_propagate(Operation::Put(message), seq).await
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
        if !self.originates_here(origin) {
            return self.local.modify(index, message, origin, seq).await;
        }

        // an edit keeps the causal position of the message it replaces
        let existing = self.local.get(index, origin).await?;
        let edited = existing.with_text(message.text());
        self.apply_and_propagate(Operation::Modify(index, edited), seq)
            .await
    }

    async fn delete(
        &self,
        index: usize,
        origin: Origin,
        seq: Option<SequenceNumber>,
    ) -> Result<Ack> {
        if !self.originates_here(origin) {
            return self.local.delete(index, origin, seq).await;
        }
        self.apply_and_propagate(Operation::Delete(index), seq).await
    }

    async fn delete_all(&self, origin: Origin, seq: Option<SequenceNumber>) -> Result<Ack> {
        if !self.originates_here(origin) {
            return self.local.delete_all(origin, seq).await;
        }
        self.apply_and_propagate(Operation::DeleteAll, seq).await
    }

    async fn close(&self) -> Result<()> {
        self.local.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{BoardOrder, MessageStore};
    use crate::types::VectorTime;

    fn replica(id: ReplicaId) -> (CausalBroadcast<MessageStore>, Arc<MessageStore>) {
        let store = Arc::new(MessageStore::new(BoardOrder::TotalOrder));
        let clock = Arc::new(VectorClock::new(2, id));
        (
            CausalBroadcast::new(id, clock, Arc::clone(&store), Vec::new()),
            store,
        )
    }

    #[tokio::test]
    async fn test_client_write_is_stamped() {
        let (causal, store) = replica(1);
        causal.put("hello".into(), Origin::Client, None).await.unwrap();
        causal.put("again".into(), Origin::Client, None).await.unwrap();

        let board = store.snapshot().await;
        assert_eq!(board[0].time(), Some(&VectorTime::from_counters(vec![0, 1])));
        assert_eq!(board[1].time(), Some(&VectorTime::from_counters(vec![0, 2])));
    }

    #[tokio::test]
    async fn test_peer_write_is_applied_verbatim() {
        let (causal, store) = replica(0);
        let stamped = Message::Timestamped(VectorTime::from_counters(vec![0, 7]), "remote".into());
        causal
            .put(stamped.clone(), Origin::Replica(1), None)
            .await
            .unwrap();
        assert_eq!(store.snapshot().await, vec![stamped]);
    }

    #[tokio::test]
    async fn test_modify_preserves_timestamp() {
        let (causal, store) = replica(0);
        causal.put("draft".into(), Origin::Client, None).await.unwrap();
        causal.put("other".into(), Origin::Client, None).await.unwrap();

        causal.modify(0, "final".into(), Origin::Client, None).await.unwrap();
        let board = store.snapshot().await;
        assert_eq!(board[0].text(), "final");
        assert_eq!(board[0].time(), Some(&VectorTime::from_counters(vec![1, 0])));
        assert_eq!(board[1].text(), "other");
    }

    #[tokio::test]
    async fn test_concurrent_writes_order_the_same_everywhere() {
        let (first, first_store) = replica(0);
        let (second, second_store) = replica(1);

        first.put("A".into(), Origin::Client, None).await.unwrap();
        second.put("B".into(), Origin::Client, None).await.unwrap();
        let a = first_store.snapshot().await[0].clone();
        let b = second_store.snapshot().await[0].clone();

        first.put(b, Origin::Replica(1), None).await.unwrap();
        second.put(a, Origin::Replica(0), None).await.unwrap();

        let left = first_store.snapshot().await;
        let right = second_store.snapshot().await;
        assert_eq!(left, right);
        // [1,0] vs [0,1] are concurrent; the first component decides
        let texts: Vec<&str> = left.iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["B", "A"]);
    }
}
