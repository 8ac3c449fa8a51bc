use crate::board::Board;
use crate::error::Result;
use crate::types::{Ack, Message, Origin, SequenceNumber};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, trace};

/// How far behind a sender's newest sequence number a cached reply is kept
pub const DEDUP_WINDOW: SequenceNumber = 10;

/// Reply slot for one (sender, sequence) write. Empty while the write runs
/// or after it failed.
type ReplySlot = Arc<OnceCell<Ack>>;

/// Replies remembered for one sender
#[derive(Debug, Default)]
struct SenderCache {
    newest: SequenceNumber,
    replies: HashMap<SequenceNumber, ReplySlot>,
}

impl SenderCache {
    /// Slot for `seq`, created on first sight
    fn slot(&mut self, seq: SequenceNumber) -> ReplySlot {
        let slot = Arc::clone(self.replies.entry(seq).or_default());
        if seq > self.newest {
            self.newest = seq;
            let floor = self.newest.saturating_sub(DEDUP_WINDOW);
            self.replies.retain(|&cached, _| cached >= floor);
        }
        slot
    }
}

/// Receiving-side filter that executes each (sender, sequence) write once
///
/// Applies to `put` and `delete`, the writes an
/// [`crate::delivery::AtLeastOnceProxy`] tags. The first copy of a write
/// claims a reply slot before it touches the board; a repeat that arrives
/// while it is still running waits on that slot, and a later one is answered
/// from it. A write that fails leaves the slot empty, so the next copy runs
/// again.
///
/// By default the sequence number is only a delivery tag and is stripped
/// before the write reaches the wrapped board. Boards that order writes by
/// that number (sequenced replication) are wrapped with
/// [`AtMostOnceFilter::keeping_seq`] instead, which passes it through.
/// Everything else is forwarded untouched.
pub struct AtMostOnceFilter<B: Board> {
    inner: B,
    keep_seq: bool,
    cache: Mutex<HashMap<Origin, SenderCache>>,
}

impl<B: Board> AtMostOnceFilter<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            keep_seq: false,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Filter that hands the sequence number on to the wrapped board
    pub fn keeping_seq(inner: B) -> Self {
        Self {
            keep_seq: true,
            ..Self::new(inner)
        }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    /// Number of completed replies currently cached for a sender
    pub async fn cached(&self, origin: Origin) -> usize {
        self.cache.lock().await.get(&origin).map_or(0, |sender| {
            sender
                .replies
                .values()
                .filter(|slot| slot.initialized())
                .count()
        })
    }

    fn forwarded(&self, seq: SequenceNumber) -> Option<SequenceNumber> {
        self.keep_seq.then_some(seq)
    }

    /// Run `write` unless this (sender, sequence) pair already ran or is
    /// running, in which case its reply is reused
    async fn once<F, Fut>(
        &self,
        what: &str,
        origin: Origin,
        seq: SequenceNumber,
        write: F,
    ) -> Result<Ack>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Ack>>,
    {
        let slot = self.cache.lock().await.entry(origin).or_default().slot(seq);
        if let Some(ack) = slot.get() {
            debug!("Duplicate {} #{} from {} answered from cache", what, seq, origin);
            return Ok(*ack);
        }

        let mut ran = false;
        let ack = slot
            .get_or_try_init(|| {
                ran = true;
                write()
            })
            .await?;
        if ran {
            trace!("Caching {} #{} from {}", what, seq, origin);
        } else {
            debug!("Duplicate {} #{} from {} waited for the first copy", what, seq, origin);
        }
        Ok(*ack)
    }
}

#[async_trait]
impl<B: Board> Board for AtMostOnceFilter<B> {
    async fn put(
        &self,
        message: Message,
        origin: Origin,
        seq: Option<SequenceNumber>,
    ) -> Result<Ack> {
        let Some(seq) = seq else {
            return self.inner.put(message, origin, None).await;
        };
        self.once("PUT", origin, seq, || {
            self.inner.put(message, origin, self.forwarded(seq))
        })
        .await
    }

    async fn get(&self, index: usize, origin: Origin) -> Result<Message> {
        self.inner.get(index, origin).await
    }

    async fn get_num(&self, origin: Origin) -> Result<usize> {
        self.inner.get_num(origin).await
    }

    async fn get_board(&self, origin: Origin) -> Result<Vec<Message>> {
        self.inner.get_board(origin).await
    }

    async fn modify(
        &self,
        index: usize,
        message: Message,
        origin: Origin,
        seq: Option<SequenceNumber>,
    ) -> Result<Ack> {
        self.inner.modify(index, message, origin, seq).await
    }

    async fn delete(
        &self,
        index: usize,
        origin: Origin,
        seq: Option<SequenceNumber>,
    ) -> Result<Ack> {
        let Some(seq) = seq else {
            return self.inner.delete(index, origin, None).await;
        };
        self.once("DELETE", origin, seq, || {
            self.inner.delete(index, origin, self.forwarded(seq))
        })
        .await
    }

    async fn delete_all(&self, origin: Origin, seq: Option<SequenceNumber>) -> Result<Ack> {
        self.inner.delete_all(origin, seq).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::Peer;
    use crate::proxy::RemoteProxy;
    use crate::storage::{BoardOrder, MessageStore};
    use crate::strategy::SequencedReplication;
    use crate::transport::InMemoryNetwork;
    use std::time::Duration;

    /// Store whose writes take a while to land
    struct SlowStore {
        store: MessageStore,
        delay: Duration,
    }

    #[async_trait]
    impl Board for SlowStore {
        async fn put(
            &self,
            message: Message,
            origin: Origin,
            seq: Option<SequenceNumber>,
        ) -> Result<Ack> {
            tokio::time::sleep(self.delay).await;
            self.store.put(message, origin, seq).await
        }

        async fn get(&self, index: usize, origin: Origin) -> Result<Message> {
            self.store.get(index, origin).await
        }

        async fn get_num(&self, origin: Origin) -> Result<usize> {
            self.store.get_num(origin).await
        }

        async fn get_board(&self, origin: Origin) -> Result<Vec<Message>> {
            self.store.get_board(origin).await
        }

        async fn modify(
            &self,
            index: usize,
            message: Message,
            origin: Origin,
            seq: Option<SequenceNumber>,
        ) -> Result<Ack> {
            self.store.modify(index, message, origin, seq).await
        }

        async fn delete(
            &self,
            index: usize,
            origin: Origin,
            seq: Option<SequenceNumber>,
        ) -> Result<Ack> {
            tokio::time::sleep(self.delay).await;
            self.store.delete(index, origin, seq).await
        }

        async fn delete_all(&self, origin: Origin, seq: Option<SequenceNumber>) -> Result<Ack> {
            self.store.delete_all(origin, seq).await
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn filter() -> (AtMostOnceFilter<Arc<MessageStore>>, Arc<MessageStore>) {
        let store = Arc::new(MessageStore::new(BoardOrder::Arrival));
        (AtMostOnceFilter::new(Arc::clone(&store)), store)
    }

    #[tokio::test]
    async fn test_repeated_write_applies_once() {
        let (filter, store) = filter();
        let first = filter
            .put("once".into(), Origin::Replica(2), Some(1))
            .await
            .unwrap();
        let second = filter
            .put("once".into(), Origin::Replica(2), Some(1))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(store.snapshot().await, vec![Message::from("once")]);
    }

    #[tokio::test]
    async fn test_senders_are_tracked_separately() {
        let (filter, store) = filter();
        filter.put("a".into(), Origin::Replica(0), Some(1)).await.unwrap();
        filter.put("b".into(), Origin::Replica(1), Some(1)).await.unwrap();
        assert_eq!(store.snapshot().await.len(), 2);
    }

    #[tokio::test]
    async fn test_repeated_delete_removes_one_message() {
        let (filter, store) = filter();
        for text in ["a", "b", "c"] {
            filter.put(text.into(), Origin::Client, None).await.unwrap();
        }
        filter.delete(0, Origin::Replica(1), Some(5)).await.unwrap();
        filter.delete(0, Origin::Replica(1), Some(5)).await.unwrap();
        assert_eq!(
            store.snapshot().await,
            vec![Message::from("b"), Message::from("c")]
        );
    }

    #[tokio::test]
    async fn test_untagged_writes_pass_through() {
        let (filter, store) = filter();
        filter.put("x".into(), Origin::Replica(0), None).await.unwrap();
        filter.put("x".into(), Origin::Replica(0), None).await.unwrap();
        filter.modify(0, "y".into(), Origin::Replica(0), Some(3)).await.unwrap();
        filter.modify(0, "y".into(), Origin::Replica(0), Some(3)).await.unwrap();
        assert_eq!(store.snapshot().await.len(), 2);
        assert_eq!(filter.cached(Origin::Replica(0)).await, 0);
    }

    #[tokio::test]
    async fn test_old_entries_fall_out_of_window() {
        let (filter, _store) = filter();
        let sender = Origin::Replica(3);
        for seq in 1..=30 {
            filter.put("m".into(), sender, Some(seq)).await.unwrap();
        }
        // only numbers >= 30 - DEDUP_WINDOW remain
        assert_eq!(filter.cached(sender).await, DEDUP_WINDOW as usize + 1);
    }

    #[tokio::test]
    async fn test_failed_write_is_not_cached() {
        let (filter, store) = filter();
        assert!(filter.delete(0, Origin::Replica(1), Some(1)).await.is_err());
        filter.put("a".into(), Origin::Client, None).await.unwrap();
        filter.delete(0, Origin::Replica(1), Some(1)).await.unwrap();
        assert!(store.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_arriving_mid_write_applies_once() {
        let filter = AtMostOnceFilter::new(SlowStore {
            store: MessageStore::new(BoardOrder::Arrival),
            delay: Duration::from_millis(50),
        });

        let (first, second) = tokio::join!(
            filter.put("x".into(), Origin::Replica(2), Some(7)),
            filter.put("x".into(), Origin::Replica(2), Some(7)),
        );
        assert_eq!(first.unwrap(), second.unwrap());
        assert_eq!(filter.inner().store.snapshot().await, vec![Message::from("x")]);
        assert_eq!(filter.cached(Origin::Replica(2)).await, 1);
    }

    #[tokio::test]
    async fn test_duplicate_delete_arriving_mid_write_removes_one() {
        let filter = AtMostOnceFilter::new(SlowStore {
            store: MessageStore::new(BoardOrder::Arrival),
            delay: Duration::from_millis(30),
        });
        for text in ["a", "b"] {
            filter.put(text.into(), Origin::Client, None).await.unwrap();
        }

        let (first, second) = tokio::join!(
            filter.delete(0, Origin::Replica(1), Some(4)),
            filter.delete(0, Origin::Replica(1), Some(4)),
        );
        first.unwrap();
        second.unwrap();
        assert_eq!(filter.inner().store.snapshot().await, vec![Message::from("b")]);
    }

    #[tokio::test]
    async fn test_sequence_number_reaches_ordering_board() {
        let store = Arc::new(MessageStore::new(BoardOrder::Arrival));
        let sequencer: Arc<dyn Peer> = Arc::new(RemoteProxy::new(
            "sequencer",
            Origin::Replica(1),
            Arc::new(InMemoryNetwork::new()),
        ));
        let filter = AtMostOnceFilter::keeping_seq(SequencedReplication::new(
            1,
            Arc::clone(&store),
            Vec::new(),
            sequencer,
        ));

        for _ in 0..2 {
            let ack = filter
                .put("hello".into(), Origin::Replica(0), Some(1))
                .await
                .unwrap();
            assert_eq!(ack, Ack::Done);
        }
        filter
            .put("world".into(), Origin::Replica(0), Some(2))
            .await
            .unwrap();

        for _ in 0..200 {
            if store.snapshot().await.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(
            store.snapshot().await,
            vec![Message::from("hello"), Message::from("world")]
        );
        assert_eq!(filter.inner().next_expected().await, 3);
    }
}
