use crate::error::Result;
use crate::types::{Ack, Message, Operation, ReplicaId, SequenceNumber};
use async_trait::async_trait;
use std::sync::Arc;

/// Handle for calling another replica.
///
/// The implementation decides who the caller is (`MYID`) and whether a
/// vector timestamp is attached, so nothing here takes an origin. Board
/// operations mirror [`crate::board::Board`]; the rest is the coordination
/// surface used by election, mutex and sequencer protocols.
#[async_trait]
pub trait Peer: Send + Sync {
    /// Address or name used in logs
    fn name(&self) -> &str;

    async fn put(&self, message: Message, seq: Option<SequenceNumber>) -> Result<Ack>;

    async fn get(&self, index: usize) -> Result<Message>;

    async fn get_num(&self) -> Result<usize>;

    async fn get_board(&self) -> Result<Vec<Message>>;

    async fn modify(
        &self,
        index: usize,
        message: Message,
        seq: Option<SequenceNumber>,
    ) -> Result<Ack>;

    async fn delete(&self, index: usize, seq: Option<SequenceNumber>) -> Result<Ack>;

    async fn delete_all(&self, seq: Option<SequenceNumber>) -> Result<Ack>;

    /// Try the remote mutex; true if it is now held by the caller
    async fn acquire(&self) -> Result<bool>;

    async fn release(&self) -> Result<bool>;

    async fn are_you_alive(&self) -> Result<bool>;

    /// Bully election message; true when the callee answered "Take-Over"
    async fn election(&self) -> Result<bool>;

    async fn set_coordinator(&self, coordinator: ReplicaId) -> Result<()>;

    async fn get_sequence_number(&self) -> Result<SequenceNumber>;

    /// Ask the callee to reconcile with another replica
    async fn synchronize(&self, other: ReplicaId) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
impl<P: Peer + ?Sized> Peer for Arc<P> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn put(&self, message: Message, seq: Option<SequenceNumber>) -> Result<Ack> {
        (**self).put(message, seq).await
    }

    async fn get(&self, index: usize) -> Result<Message> {
        (**self).get(index).await
    }

    async fn get_num(&self) -> Result<usize> {
        (**self).get_num().await
    }

    async fn get_board(&self) -> Result<Vec<Message>> {
        (**self).get_board().await
    }

    async fn modify(
        &self,
        index: usize,
        message: Message,
        seq: Option<SequenceNumber>,
    ) -> Result<Ack> {
        (**self).modify(index, message, seq).await
    }

    async fn delete(&self, index: usize, seq: Option<SequenceNumber>) -> Result<Ack> {
        (**self).delete(index, seq).await
    }

    async fn delete_all(&self, seq: Option<SequenceNumber>) -> Result<Ack> {
        (**self).delete_all(seq).await
    }

    async fn acquire(&self) -> Result<bool> {
        (**self).acquire().await
    }

    async fn release(&self) -> Result<bool> {
        (**self).release().await
    }

    async fn are_you_alive(&self) -> Result<bool> {
        (**self).are_you_alive().await
    }

    async fn election(&self) -> Result<bool> {
        (**self).election().await
    }

    async fn set_coordinator(&self, coordinator: ReplicaId) -> Result<()> {
        (**self).set_coordinator(coordinator).await
    }

    async fn get_sequence_number(&self) -> Result<SequenceNumber> {
        (**self).get_sequence_number().await
    }

    async fn synchronize(&self, other: ReplicaId) -> Result<()> {
        (**self).synchronize(other).await
    }

    async fn close(&self) -> Result<()> {
        (**self).close().await
    }
}

/// Replay an operation against a peer
pub async fn send_operation<P: Peer + ?Sized>(
    peer: &P,
    op: Operation,
    seq: Option<SequenceNumber>,
) -> Result<Ack> {
    match op {
        Operation::Put(message) => peer.put(message, seq).await,
        Operation::Modify(index, message) => peer.modify(index, message, seq).await,
        Operation::Delete(index) => peer.delete(index, seq).await,
        Operation::DeleteAll => peer.delete_all(seq).await,
    }
}
