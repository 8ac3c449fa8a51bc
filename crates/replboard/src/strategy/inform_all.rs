use crate::board::{Board, apply_operation};
use crate::error::Result;
use crate::peer::Peer;
use crate::strategy::broadcast;
use crate::types::{Ack, Message, Operation, Origin, ReplicaId, SequenceNumber};
use async_trait::async_trait;
use std::sync::Arc;

/// Unordered replication: apply locally, then tell everybody else
///
/// No sequencer, lock or timestamp is involved, so replicas that see
/// concurrent writes in a different order end up with differently ordered
/// boards. Writes from another replica are applied and not forwarded.
pub struct InformAll<S: Board> {
    my_id: ReplicaId,
    local: Arc<S>,
    peers: Vec<Arc<dyn Peer>>,
}

impl<S: Board> InformAll<S> {
    pub fn new(my_id: ReplicaId, local: Arc<S>, peers: Vec<Arc<dyn Peer>>) -> Self {
        Self {
            my_id,
            local,
            peers,
        }
    }

    async fn write(
        &self,
        op: Operation,
        origin: Origin,
        seq: Option<SequenceNumber>,
    ) -> Result<Ack> {
        let forward = origin.is_client() || origin == Origin::Replica(self.my_id);
        let ack = apply_operation(&*self.local, op.clone(), origin, seq).await?;
        if forward {
            broadcast(&self.peers, self.my_id, &op, seq).await;
        }
        Ok(ack)
    }
}

#[async_trait]
impl<S: Board> Board for InformAll<S> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::RemoteProxy;
    use crate::server::{Dispatcher, ServerContext};
    use crate::storage::{BoardOrder, MessageStore};
    use crate::transport::InMemoryNetwork;

    /// Two replicas joined by an in-memory network
    async fn pair() -> (Vec<Arc<InformAll<MessageStore>>>, Vec<Arc<MessageStore>>) {
        let network = InMemoryNetwork::new();
        let addrs = ["replica-0", "replica-1"];
        let mut replicas = Vec::new();
        let mut stores = Vec::new();
        for id in 0..2 {
            let store = Arc::new(MessageStore::new(BoardOrder::Arrival));
            let peers: Vec<Arc<dyn Peer>> = addrs
                .iter()
                .map(|addr| {
                    Arc::new(RemoteProxy::new(
                        *addr,
                        Origin::Replica(id),
                        Arc::new(network.clone()),
                    )) as Arc<dyn Peer>
                })
                .collect();
            let replica = Arc::new(InformAll::new(id, Arc::clone(&store), peers));
            let ctx = ServerContext::new(id, Arc::clone(&replica) as Arc<dyn Board>);
            network
                .register(addrs[id], Arc::new(Dispatcher::new(ctx)))
                .await;
            replicas.push(replica);
            stores.push(store);
        }
        (replicas, stores)
    }

    #[tokio::test]
    async fn test_client_writes_reach_every_replica() {
        let (replicas, stores) = pair().await;

        replicas[0].put("a".into(), Origin::Client, None).await.unwrap();
        replicas[1].put("b".into(), Origin::Client, None).await.unwrap();
        replicas[1]
            .modify(0, "a2".into(), Origin::Client, None)
            .await
            .unwrap();

        let expected = vec![Message::from("a2"), Message::from("b")];
        assert_eq!(stores[0].snapshot().await, expected);
        assert_eq!(stores[1].snapshot().await, expected);

        replicas[0].delete_all(Origin::Client, None).await.unwrap();
        assert!(stores[1].snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_peer_writes_are_not_forwarded() {
        let (replicas, stores) = pair().await;

        replicas[0]
            .put("from-1".into(), Origin::Replica(1), None)
            .await
            .unwrap();
        assert_eq!(stores[0].snapshot().await, vec![Message::from("from-1")]);
        assert!(stores[1].snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_local_failure_is_not_propagated() {
        let (replicas, stores) = pair().await;
        stores[1]
            .put("only-here".into(), Origin::Replica(1), None)
            .await
            .unwrap();

        assert!(replicas[0].delete(0, Origin::Client, None).await.is_err());
        assert_eq!(stores[1].snapshot().await.len(), 1);
    }
}
