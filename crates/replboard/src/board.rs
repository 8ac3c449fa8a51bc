use crate::error::Result;
use crate::types::{Ack, Message, Operation, Origin, SequenceNumber};
use async_trait::async_trait;
use std::sync::Arc;

/// The message board capability.
///
/// Implemented by the local store, by each replication strategy and by the
/// at-most-once filter, so they can be stacked freely at startup. Every call
/// names who issued it; writes may carry a sequence number.
///
/// Key design principles:
/// - `Origin::Client` means "order this and propagate it"
/// - `Origin::Replica(_)` means "already ordered elsewhere, apply it"
/// - `get`/`modify`/`delete` fail with `IndexOutOfRange` on a bad index
#[async_trait]
pub trait Board: Send + Sync {
    async fn put(
        &self,
        message: Message,
        origin: Origin,
        seq: Option<SequenceNumber>,
    ) -> Result<Ack>;

    async fn get(&self, index: usize, origin: Origin) -> Result<Message>;

    async fn get_num(&self, origin: Origin) -> Result<usize>;

    async fn get_board(&self, origin: Origin) -> Result<Vec<Message>>;

    async fn modify(
        &self,
        index: usize,
        message: Message,
        origin: Origin,
        seq: Option<SequenceNumber>,
    ) -> Result<Ack>;

    async fn delete(&self, index: usize, origin: Origin, seq: Option<SequenceNumber>)
    -> Result<Ack>;

    async fn delete_all(&self, origin: Origin, seq: Option<SequenceNumber>) -> Result<Ack>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
impl<B: Board + ?Sized> Board for Arc<B> {
    async fn put(
        &self,
        message: Message,
        origin: Origin,
        seq: Option<SequenceNumber>,
    ) -> Result<Ack> {
        (**self).put(message, origin, seq).await
    }

    async fn get(&self, index: usize, origin: Origin) -> Result<Message> {
        (**self).get(index, origin).await
    }

    async fn get_num(&self, origin: Origin) -> Result<usize> {
        (**self).get_num(origin).await
    }

    async fn get_board(&self, origin: Origin) -> Result<Vec<Message>> {
        (**self).get_board(origin).await
    }

    async fn modify(
        &self,
        index: usize,
        message: Message,
        origin: Origin,
        seq: Option<SequenceNumber>,
    ) -> Result<Ack> {
        (**self).modify(index, message, origin, seq).await
    }

    async fn delete(
        &self,
        index: usize,
        origin: Origin,
        seq: Option<SequenceNumber>,
    ) -> Result<Ack> {
        (**self).delete(index, origin, seq).await
    }

    async fn delete_all(&self, origin: Origin, seq: Option<SequenceNumber>) -> Result<Ack> {
        (**self).delete_all(origin, seq).await
    }

    async fn close(&self) -> Result<()> {
        (**self).close().await
    }
}

/// Apply a queued or replayed operation to a board
pub async fn apply_operation<B: Board + ?Sized>(
    board: &B,
    op: Operation,
    origin: Origin,
    seq: Option<SequenceNumber>,
) -> Result<Ack> {
    match op {
        Operation::Put(message) => board.put(message, origin, seq).await,
        Operation::Modify(index, message) => board.modify(index, message, origin, seq).await,
        Operation::Delete(index) => board.delete(index, origin, seq).await,
        Operation::DeleteAll => board.delete_all(origin, seq).await,
    }
}
