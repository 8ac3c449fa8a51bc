use crate::error::Result;
use crate::peer::{Peer, send_operation};
use crate::types::{Ack, Message, Operation, PendingOperation, ReplicaId, SequenceNumber};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

/// Peer wrapper for fire-and-forget writes
///
/// A write is tried once. If that fails the caller gets the error straight
/// away and the write goes on a FIFO that a background task drains, retrying
/// each entry every `retry_delay` until it goes through. Writes that succeed
/// first time bypass the queue, so they can overtake queued ones. Reads and
/// coordination calls are passed through.
pub struct FaultTolerantProxy<P: Peer> {
    inner: Arc<P>,
    retry_delay: Duration,
    queue: mpsc::UnboundedSender<PendingOperation>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<PendingOperation>>>,
}

impl<P: Peer + 'static> FaultTolerantProxy<P> {
    pub fn new(inner: P, retry_delay: Duration) -> Self {
        let (queue, receiver) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(inner),
            retry_delay,
            queue,
            receiver: Mutex::new(Some(receiver)),
        }
    }

    async fn write(&self, op: Operation, seq: Option<SequenceNumber>) -> Result<Ack> {
        match send_operation(&*self.inner, op.clone(), seq).await {
            Ok(ack) => Ok(ack),
            Err(e) => {
                warn!(
                    "{} to {} failed, queued for retry: {}",
                    op.name(),
                    self.inner.name(),
                    e
                );
                self.ensure_drainer().await;
                if self.queue.send(PendingOperation::new(op, seq)).is_err() {
                    warn!("Retry queue for {} is gone", self.inner.name());
                }
                Err(e)
            }
        }
    }

    async fn ensure_drainer(&self) {
        let Some(mut receiver) = self.receiver.lock().await.take() else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        let retry_delay = self.retry_delay;
        tokio::spawn(async move {
            info!("Retry queue for {} started", inner.name());
            while let Some(pending) = receiver.recv().await {
                let mut attempts = 1u64;
                while let Err(e) = send_operation(&*inner, pending.op.clone(), pending.seq).await {
                    debug!(
                        "Retry {} of queued {} to {} failed: {}",
                        attempts,
                        pending.op.name(),
                        inner.name(),
                        e
                    );
                    attempts += 1;
                    tokio::time::sleep(retry_delay).await;
                }
                debug!("Queued {} delivered to {}", pending.op.name(), inner.name());
            }
        });
    }
}

#[async_trait]
impl<P: Peer + 'static> Peer for FaultTolerantProxy<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn put(&self, message: Message, seq: Option<SequenceNumber>) -> Result<Ack> {
        self.write(Operation::Put(message), seq).await
    }

    async fn get(&self, index: usize) -> Result<Message> {
        self.inner.get(index).await
    }

    async fn get_num(&self) -> Result<usize> {
        self.inner.get_num().await
    }

    async fn get_board(&self) -> Result<Vec<Message>> {
        self.inner.get_board().await
    }

    async fn modify(
        &self,
        index: usize,
        message: Message,
        seq: Option<SequenceNumber>,
    ) -> Result<Ack> {
        self.write(Operation::Modify(index, message), seq).await
    }

    async fn delete(&self, index: usize, seq: Option<SequenceNumber>) -> Result<Ack> {
        self.write(Operation::Delete(index), seq).await
    }

    async fn delete_all(&self, seq: Option<SequenceNumber>) -> Result<Ack> {
        self.write(Operation::DeleteAll, seq).await
    }

    async fn acquire(&self) -> Result<bool> {
        self.inner.acquire().await
    }

    async fn release(&self) -> Result<bool> {
        self.inner.release().await
    }

    async fn are_you_alive(&self) -> Result<bool> {
        self.inner.are_you_alive().await
    }

    async fn election(&self) -> Result<bool> {
        self.inner.election().await
    }

    async fn set_coordinator(&self, coordinator: ReplicaId) -> Result<()> {
        self.inner.set_coordinator(coordinator).await
    }

    async fn get_sequence_number(&self) -> Result<SequenceNumber> {
        self.inner.get_sequence_number().await
    }

    async fn synchronize(&self, other: ReplicaId) -> Result<()> {
        self.inner.synchronize(other).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
