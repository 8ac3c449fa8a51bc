use crate::board::{Board, apply_operation};
use crate::coord::Sequencer;
use crate::error::{BoardError, Result};
use crate::peer::Peer;
use crate::strategy::broadcast;
use crate::types::{Ack, Message, Operation, Origin, ReplicaId, SequenceNumber};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, trace, warn};

/// Writes waiting for their turn, keyed by sequence number
#[derive(Debug)]
struct PendingQueue {
    pending: BTreeMap<SequenceNumber, Operation>,
    next_expected: SequenceNumber,
}

impl PendingQueue {
    fn new() -> Self {
        Self {
            pending: BTreeMap::new(),
            next_expected: 1,
        }
    }

    fn push(&mut self, seq: SequenceNumber, op: Operation) {
        if seq < self.next_expected {
            warn!(
                "Discarding {} #{}: already past it (next {})",
                op.name(),
                seq,
                self.next_expected
            );
            return;
        }
        if self.pending.insert(seq, op).is_some() {
            warn!("Duplicate delivery of #{} replaced queued entry", seq);
        }
    }

    /// Lowest queued operation if it is the next one due
    fn pop_ready(&mut self) -> Option<(SequenceNumber, Operation)> {
        let entry = self.pending.first_entry()?;
        if *entry.key() != self.next_expected {
            trace!(
                "Waiting for #{} (lowest queued #{})",
                self.next_expected,
                entry.key()
            );
            return None;
        }
        self.next_expected += 1;
        Some(entry.remove_entry())
    }
}

struct Inner<S> {
    my_id: ReplicaId,
    local: Arc<S>,
    queue: Mutex<PendingQueue>,
    wakeup: Notify,
}

/// Total-order broadcast through a central sequencer
///
/// A client write takes the next number from the sequencer, is broadcast
/// with it and queued locally; every replica applies queued writes strictly
/// in sequence-number order. Reads go straight to local storage. The
/// replica hosting the sequencer draws numbers from it in-process.
pub struct SequencedReplication<S: Board> {
    inner: Arc<Inner<S>>,
    peers: Vec<Arc<dyn Peer>>,
    sequencer: Arc<dyn Peer>,
    local_sequencer: Option<Arc<Sequencer>>,
    consumer_started: AtomicBool,
}

impl<S: Board + 'static> SequencedReplication<S> {
    pub fn new(
        my_id: ReplicaId,
        local: Arc<S>,
        peers: Vec<Arc<dyn Peer>>,
        sequencer: Arc<dyn Peer>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                my_id,
                local,
                queue: Mutex::new(PendingQueue::new()),
                wakeup: Notify::new(),
            }),
            peers,
            sequencer,
            local_sequencer: None,
            consumer_started: AtomicBool::new(false),
        }
    }

    /// Take numbers from a sequencer hosted by this replica
    pub fn with_local_sequencer(mut self, sequencer: Arc<Sequencer>) -> Self {
        self.local_sequencer = Some(sequencer);
        self
    }

    async fn next_sequence_number(&self) -> Result<SequenceNumber> {
        match &self.local_sequencer {
            Some(sequencer) => Ok(sequencer.next()),
            None => self.sequencer.get_sequence_number().await,
        }
    }

    /// Next sequence number this replica will apply
    pub async fn next_expected(&self) -> SequenceNumber {
        self.inner.queue.lock().await.next_expected
    }

    /// Number of writes waiting for an earlier sequence number
    pub async fn pending(&self) -> usize {
        self.inner.queue.lock().await.pending.len()
    }

    async fn write(
        &self,
        op: Operation,
        origin: Origin,
        seq: Option<SequenceNumber>,
    ) -> Result<Ack> {
        if origin.is_client() {
            let seq = self.next_sequence_number().await?;
            debug!(
                "Replica {} ordered {} as #{}",
                self.inner.my_id,
                op.name(),
                seq
            );
            broadcast(&self.peers, self.inner.my_id, &op, Some(seq)).await;
            self.enqueue(seq, op).await;
            Ok(Ack::Queued)
        } else {
            let seq = seq.ok_or(BoardError::MissingField("SEQNUM"))?;
            self.enqueue(seq, op).await;
            Ok(Ack::Done)
        }
    }

    async fn enqueue(&self, seq: SequenceNumber, op: Operation) {
        self.inner.queue.lock().await.push(seq, op);
        self.inner.wakeup.notify_one();
        self.ensure_consumer();
    }

    fn ensure_consumer(&self) {
        if self.consumer_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { consume(inner).await });
    }
}

/// Apply queued writes in order, sleeping until an enqueue when the next
/// one has not arrived yet
async fn consume<S: Board>(inner: Arc<Inner<S>>) {
    debug!("Update consumer started on replica {}", inner.my_id);
    loop {
        let ready = inner.queue.lock().await.pop_ready();
        match ready {
            Some((seq, op)) => {
                let name = op.name();
                if let Err(e) =
                    apply_operation(&*inner.local, op, Origin::Replica(inner.my_id), Some(seq)).await
                {
                    warn!("Applying {} #{} failed: {}", name, seq, e);
                } else {
                    trace!("Applied {} #{}", name, seq);
                }
            }
            None => inner.wakeup.notified().await,
        }
    }
}

#[async_trait]
impl<S: Board + 'static> Board for SequencedReplication<S> {
    async fn put(
        &self,
        message: Message,
        origin: Origin,
        seq: Option<SequenceNumber>,
    ) -> Result<Ack> {
        self.write(Operation::Put(message), origin, seq).await
    }

    async fn get(&self, index: usize, origin: Origin) -> Result<Message> {
        self.inner.local.get(index, origin).await
    }

    async fn get_num(&self, origin: Origin) -> Result<usize> {
        self.inner.local.get_num(origin).await
    }

    async fn get_board(&self, origin: Origin) -> Result<Vec<Message>> {
        self.inner.local.get_board(origin).await
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
        self.inner.local.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::RemoteProxy;
    use crate::storage::{BoardOrder, MessageStore};
    use crate::transport::InMemoryNetwork;
    use std::time::Duration;

    fn strategy(store: Arc<MessageStore>) -> SequencedReplication<MessageStore> {
        let sequencer: Arc<dyn Peer> = Arc::new(RemoteProxy::new(
            "sequencer",
            Origin::Replica(1),
            Arc::new(InMemoryNetwork::new()),
        ));
        SequencedReplication::new(1, store, Vec::new(), sequencer)
    }

    async fn wait_for_len(store: &MessageStore, len: usize) {
        for _ in 0..200 {
            if store.snapshot().await.len() == len {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("store never reached {} messages", len);
    }

    #[test]
    fn test_queue_releases_in_order() {
        let mut queue = PendingQueue::new();
        queue.push(3, Operation::Put("c".into()));
        queue.push(2, Operation::Put("b".into()));
        assert!(queue.pop_ready().is_none());

        queue.push(1, Operation::Put("a".into()));
        let order: Vec<SequenceNumber> = std::iter::from_fn(|| queue.pop_ready())
            .map(|(seq, _)| seq)
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(queue.next_expected, 4);
    }

    #[test]
    fn test_stale_numbers_are_dropped() {
        let mut queue = PendingQueue::new();
        queue.push(1, Operation::DeleteAll);
        assert!(queue.pop_ready().is_some());
        queue.push(1, Operation::DeleteAll);
        assert!(queue.pending.is_empty());
    }

    #[tokio::test]
    async fn test_peer_writes_apply_in_sequence_order() {
        let store = Arc::new(MessageStore::new(BoardOrder::Arrival));
        let replication = strategy(Arc::clone(&store));

        for (seq, text) in [(2, "second"), (3, "third")] {
            let ack = replication
                .put(text.into(), Origin::Replica(0), Some(seq))
                .await
                .unwrap();
            assert_eq!(ack, Ack::Done);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.snapshot().await.is_empty());
        assert_eq!(replication.pending().await, 2);

        replication
            .put("first".into(), Origin::Replica(0), Some(1))
            .await
            .unwrap();
        wait_for_len(&store, 3).await;

        let texts: Vec<String> = store
            .snapshot()
            .await
            .iter()
            .map(|m| m.text().to_string())
            .collect();
        assert_eq!(texts, vec!["first", "second", "third"]);
        assert_eq!(replication.next_expected().await, 4);
    }

    #[tokio::test]
    async fn test_peer_write_without_number_is_rejected() {
        let store = Arc::new(MessageStore::new(BoardOrder::Arrival));
        let replication = strategy(store);
        assert!(matches!(
            replication.put("x".into(), Origin::Replica(0), None).await,
            Err(BoardError::MissingField("SEQNUM"))
        ));
    }

    #[tokio::test]
    async fn test_failed_apply_still_advances() {
        let store = Arc::new(MessageStore::new(BoardOrder::Arrival));
        let replication = strategy(Arc::clone(&store));

        // deleting from an empty board fails but must not stall #2
        replication
            .delete(0, Origin::Replica(0), Some(1))
            .await
            .unwrap();
        replication
            .put("after".into(), Origin::Replica(0), Some(2))
            .await
            .unwrap();
        wait_for_len(&store, 1).await;
        assert_eq!(replication.next_expected().await, 3);
    }

    #[tokio::test]
    async fn test_hosted_sequencer_numbers_client_writes() {
        let store = Arc::new(MessageStore::new(BoardOrder::Arrival));
        let sequencer = Arc::new(Sequencer::new());
        let replication =
            strategy(Arc::clone(&store)).with_local_sequencer(Arc::clone(&sequencer));

        for text in ["a", "b"] {
            let ack = replication.put(text.into(), Origin::Client, None).await.unwrap();
            assert_eq!(ack, Ack::Queued);
        }
        wait_for_len(&store, 2).await;
        assert_eq!(sequencer.current(), 2);
        assert_eq!(replication.next_expected().await, 3);
    }

    #[tokio::test]
    async fn test_unreachable_sequencer_fails_client_write() {
        let store = Arc::new(MessageStore::new(BoardOrder::Arrival));
        let replication = strategy(Arc::clone(&store));
        assert!(replication.put("x".into(), Origin::Client, None).await.is_err());
        assert_eq!(replication.pending().await, 0);
    }
}
