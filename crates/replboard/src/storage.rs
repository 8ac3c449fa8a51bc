use crate::board::Board;
use crate::error::{BoardError, Result};
use crate::types::{Ack, Message, Origin, SequenceNumber};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// How the store keeps its list ordered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BoardOrder {
    /// Messages stay where they were put
    #[default]
    Arrival,
    /// Messages are kept sorted by [`Message::total_order`], so replicas
    /// holding the same set hold the same sequence
    TotalOrder,
}

/// Single-node message board: an indexed list of messages, optionally
/// checkpointed to a flat JSON file after every mutation.
///
/// Origin and sequence numbers are accepted for interface compatibility and
/// ignored; ordering is decided by the strategy layered on top.
pub struct MessageStore {
    messages: RwLock<Vec<Message>>,
    ordering: BoardOrder,
    checkpoint: Option<PathBuf>,
}

impl MessageStore {
    pub fn new(ordering: BoardOrder) -> Self {
        Self {
            messages: RwLock::new(Vec::new()),
            ordering,
            checkpoint: None,
        }
    }

    /// Open a store backed by a checkpoint file, loading it if it exists
    pub async fn open<P: AsRef<Path>>(path: P, ordering: BoardOrder) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut messages: Vec<Message> = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        if ordering == BoardOrder::TotalOrder {
            messages.sort_by(|a, b| a.total_order(b));
        }
        info!(
            "Loaded {} messages from checkpoint {:?}",
            messages.len(),
            path
        );

        Ok(Self {
            messages: RwLock::new(messages),
            ordering,
            checkpoint: Some(path),
        })
    }

    pub fn ordering(&self) -> BoardOrder {
        self.ordering
    }

    /// Snapshot of the board without going through the Board trait
    pub async fn snapshot(&self) -> Vec<Message> {
        self.messages.read().await.clone()
    }

    async fn persist(&self, messages: &[Message]) -> Result<()> {
        let Some(path) = &self.checkpoint else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let bytes = serde_json::to_vec(messages)?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    fn check_index(messages: &[Message], index: usize) -> Result<()> {
        if index < messages.len() {
            Ok(())
        } else {
            Err(BoardError::IndexOutOfRange {
                index,
                len: messages.len(),
            })
        }
    }

    fn reorder(&self, messages: &mut [Message]) {
        if self.ordering == BoardOrder::TotalOrder {
            messages.sort_by(|a, b| a.total_order(b));
        }
    }

    /// Apply `change` to the board. With a checkpoint the change is made on
    /// a copy, which replaces the board only once it has been written out.
    async fn commit<F>(&self, change: F) -> Result<Ack>
    where
        F: FnOnce(&mut Vec<Message>) -> Result<()> + Send,
    {
        let mut messages = self.messages.write().await;
        if self.checkpoint.is_none() {
            change(&mut *messages)?;
            self.reorder(&mut messages);
            return Ok(Ack::Done);
        }

        let mut next = messages.clone();
        change(&mut next)?;
        self.reorder(&mut next);
        self.persist(&next).await?;
        *messages = next;
        Ok(Ack::Done)
    }
}

#[async_trait]
impl Board for MessageStore {
    async fn put(
        &self,
        message: Message,
        _origin: Origin,
        _seq: Option<SequenceNumber>,
    ) -> Result<Ack> {
        debug!("Storing message {}", message);
        self.commit(|messages| {
            messages.push(message);
            Ok(())
        })
        .await
    }

    async fn get(&self, index: usize, _origin: Origin) -> Result<Message> {
        let messages = self.messages.read().await;
        Self::check_index(&messages, index)?;
        Ok(messages[index].clone())
    }

    async fn get_num(&self, _origin: Origin) -> Result<usize> {
        Ok(self.messages.read().await.len())
    }

    async fn get_board(&self, _origin: Origin) -> Result<Vec<Message>> {
        Ok(self.snapshot().await)
    }

    async fn modify(
        &self,
        index: usize,
        message: Message,
        _origin: Origin,
        _seq: Option<SequenceNumber>,
    ) -> Result<Ack> {
        self.commit(|messages| {
            Self::check_index(messages.as_slice(), index)?;
            messages[index] = message;
            Ok(())
        })
        .await
    }

    async fn delete(
        &self,
        index: usize,
        _origin: Origin,
        _seq: Option<SequenceNumber>,
    ) -> Result<Ack> {
        self.commit(|messages| {
            Self::check_index(messages.as_slice(), index)?;
            messages.remove(index);
            Ok(())
        })
        .await
    }

    async fn delete_all(&self, _origin: Origin, _seq: Option<SequenceNumber>) -> Result<Ack> {
        self.commit(|messages| {
            messages.clear();
            Ok(())
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        let messages = self.messages.read().await;
        if let Err(e) = self.persist(&messages).await {
            warn!("Final checkpoint failed: {}", e);
            return Err(e);
        }
        Ok(())
    }
}
