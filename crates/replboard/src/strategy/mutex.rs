use crate::board::{Board, apply_operation};
use crate::election::LeaderElection;
use crate::error::Result;
use crate::peer::Peer;
use crate::strategy::broadcast;
use crate::types::{Ack, Message, Operation, Origin, PendingOperation, ReplicaId, SequenceNumber};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

/// Writes serialised by the coordinator's mutex
///
/// Client writes are queued and acknowledged with QUEUED. One worker per
/// replica takes them in turn: find the coordinator, poll its lock until
/// granted, apply locally, propagate, release. Peer writes are applied
/// directly, since the sender already holds the lock.
pub struct MutexSerialized<S: Board> {
    worker: Arc<Worker<S>>,
    queue: mpsc::UnboundedSender<PendingOperation>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<PendingOperation>>>,
}

struct Worker<S> {
    my_id: ReplicaId,
    local: Arc<S>,
    peers: Vec<Arc<dyn Peer>>,
    election: Arc<LeaderElection>,
    poll_interval: Duration,
}

impl<S: Board + 'static> MutexSerialized<S> {
    pub fn new(
        my_id: ReplicaId,
        local: Arc<S>,
        peers: Vec<Arc<dyn Peer>>,
        election: Arc<LeaderElection>,
        poll_interval: Duration,
    ) -> Self {
        let (queue, receiver) = mpsc::unbounded_channel();
        Self {
            worker: Arc::new(Worker {
                my_id,
                local,
                peers,
                election,
                poll_interval,
            }),
            queue,
            receiver: Mutex::new(Some(receiver)),
        }
    }

    async fn write(
        &self,
        op: Operation,
        origin: Origin,
        seq: Option<SequenceNumber>,
    ) -> Result<Ack> {
        if !origin.is_client() {
            return apply_operation(&*self.worker.local, op, origin, seq).await;
        }

        self.ensure_worker().await;
        debug!("Replica {} queued {}", self.worker.my_id, op.name());
        if self.queue.send(PendingOperation::new(op, seq)).is_err() {
            warn!("Write worker on replica {} is gone", self.worker.my_id);
        }
        Ok(Ack::Queued)
    }

    async fn ensure_worker(&self) {
        let Some(mut receiver) = self.receiver.lock().await.take() else {
            return;
        };
        let worker = Arc::clone(&self.worker);
        tokio::spawn(async move {
            info!("Write worker started on replica {}", worker.my_id);
            while let Some(pending) = receiver.recv().await {
                worker.process(pending).await;
            }
        });
    }
}

impl<S: Board> Worker<S> {
    async fn process(&self, pending: PendingOperation) {
        let lock = self.lock_coordinator().await;

        let name = pending.op.name();
        match apply_operation(
            &*self.local,
            pending.op.clone(),
            Origin::Replica(self.my_id),
            pending.seq,
        )
        .await
        {
            Ok(_) => broadcast(&self.peers, self.my_id, &pending.op, pending.seq).await,
            Err(e) => warn!("Applying queued {} failed: {}", name, e),
        }

        match lock.release().await {
            Ok(_) => debug!("Replica {} released the write lock", self.my_id),
            Err(e) => warn!("Releasing the write lock failed: {}", e),
        }
    }

    /// Block until the current coordinator grants its lock; returns the
    /// handle the lock has to be released on
    async fn lock_coordinator(&self) -> Arc<dyn Peer> {
        loop {
            let coordinator = match self.election.get_coordinator().await {
                Ok(id) => id,
                Err(e) => {
                    warn!("No coordinator for replica {}: {}", self.my_id, e);
                    tokio::time::sleep(self.poll_interval).await;
                    continue;
                }
            };
            let lock = match self.election.peer(coordinator) {
                Ok(peer) => peer,
                Err(e) => {
                    warn!("{}", e);
                    tokio::time::sleep(self.poll_interval).await;
                    continue;
                }
            };

            // the lock lives on another process; nothing local to wait on
            loop {
                match lock.acquire().await {
                    Ok(true) => {
                        debug!(
                            "Replica {} holds the lock on coordinator {}",
                            self.my_id, coordinator
                        );
                        return lock;
                    }
                    Ok(false) => tokio::time::sleep(self.poll_interval).await,
                    Err(e) => {
                        warn!("Lock request to coordinator {} failed: {}", coordinator, e);
                        break;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl<S: Board + 'static> Board for MutexSerialized<S> {
    async fn put(
        &self,
        message: Message,
        origin: Origin,
        seq: Option<SequenceNumber>,
    ) -> Result<Ack> {
        self.write(Operation::Put(message), origin, seq).await
    }

    async fn get(&self, index: usize, origin: Origin) -> Result<Message> {
        self.worker.local.get(index, origin).await
    }

    async fn get_num(&self, origin: Origin) -> Result<usize> {
        self.worker.local.get_num(origin).await
    }

    async fn get_board(&self, origin: Origin) -> Result<Vec<Message>> {
        self.worker.local.get_board(origin).await
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
        self.worker.local.close().await
    }
}
