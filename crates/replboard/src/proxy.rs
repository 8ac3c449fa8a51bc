use crate::clock::VectorClock;
use crate::error::{BoardError, Result};
use crate::peer::Peer;
use crate::protocol::{Command, Outcome, Request, reply_time};
use crate::transport::{Connection, Connector, TransportError};
use crate::types::{Ack, Message, Origin, ReplicaId, SequenceNumber};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Proxy for a replica reached over a [`Connector`]
///
/// Keeps one persistent connection. Every request is stamped with `MYID`
/// and, when a vector clock is attached, a fresh `TIME` (reading the clock
/// advances it); a `TIME` in the reply is merged back. A failed call
/// reconnects and retries once before giving up with `ConnectionFailure`.
/// With a reply timeout set, a reply that does not show up in time counts
/// as a failed exchange.
pub struct RemoteProxy {
    addr: String,
    identity: Origin,
    clock: Option<Arc<VectorClock>>,
    reply_timeout: Option<Duration>,
    connector: Arc<dyn Connector>,
    connection: Mutex<Option<Box<dyn Connection>>>,
}

impl RemoteProxy {
    pub fn new(addr: impl Into<String>, identity: Origin, connector: Arc<dyn Connector>) -> Self {
        Self {
            addr: addr.into(),
            identity,
            clock: None,
            reply_timeout: None,
            connector,
            connection: Mutex::new(None),
        }
    }

    /// Attach a vector clock; requests then carry `TIME` and get envelope
    /// replies
    pub fn with_clock(mut self, clock: Arc<VectorClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Give up on a reply after `timeout`
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = Some(timeout);
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn call(&self, mut request: Request) -> Result<Outcome> {
        let command = request.command()?;
        request.origin = self.identity;
        if let Some(clock) = &self.clock {
            request.time = Some(clock.tick().await);
        }
        let frame = Bytes::from(request.encode()?);

        let reply = match self.exchange(frame.clone(), false).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!("{} to {} failed ({}), reconnecting", command, self.addr, e);
                self.exchange(frame, true)
                    .await
                    .map_err(|source| BoardError::ConnectionFailure {
                        addr: self.addr.clone(),
                        source,
                    })?
            }
        };

        let value: Value = serde_json::from_slice(&reply)?;
        if let (Some(clock), Some(time)) = (&self.clock, reply_time(&value)) {
            clock.merge(&time).await;
        }
        Outcome::decode(command, &value)
    }

    /// One send/receive on the cached connection.
    ///
    /// The connection is taken out for the duration of the exchange and only
    /// put back after a complete reply, so an exchange that fails or is
    /// cancelled never leaves a half-read connection behind.
    async fn exchange(&self, frame: Bytes, fresh: bool) -> std::result::Result<Bytes, TransportError> {
        let mut slot = self.connection.lock().await;
        let mut conn = match slot.take() {
            Some(conn) if !fresh => conn,
            _ => {
                debug!("Opening connection to {}", self.addr);
                self.connector.connect(&self.addr).await?
            }
        };

        conn.send(frame).await?;
        let reply = match self.reply_timeout {
            Some(limit) => tokio::time::timeout(limit, conn.recv())
                .await
                .map_err(|_| TransportError::TimedOut(limit))??,
            None => conn.recv().await?,
        };
        *slot = Some(conn);
        Ok(reply)
    }

    fn expect_ack(outcome: Outcome) -> Result<Ack> {
        match outcome {
            Outcome::Ack(ack) => Ok(ack),
            Outcome::Ok => Ok(Ack::Done),
            other => Err(unexpected(other)),
        }
    }

    fn expect_flag(outcome: Outcome) -> Result<bool> {
        match outcome {
            Outcome::Flag(flag) => Ok(flag),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(outcome: Outcome) -> BoardError {
    BoardError::Protocol(format!("unexpected reply {:?}", outcome))
}

#[async_trait]
impl Peer for RemoteProxy {
    fn name(&self) -> &str {
        &self.addr
    }

    async fn put(&self, message: Message, seq: Option<SequenceNumber>) -> Result<Ack> {
        let request = Request::new(Command::Put)
            .with_message(message)
            .with_seq(seq);
        Self::expect_ack(self.call(request).await?)
    }

    async fn get(&self, index: usize) -> Result<Message> {
        match self.call(Request::new(Command::Get).with_index(index)).await? {
            Outcome::Message(message) => Ok(message),
            other => Err(unexpected(other)),
        }
    }

    async fn get_num(&self) -> Result<usize> {
        match self.call(Request::new(Command::GetNum)).await? {
            Outcome::Num(n) => Ok(n),
            other => Err(unexpected(other)),
        }
    }

    async fn get_board(&self) -> Result<Vec<Message>> {
        match self.call(Request::new(Command::GetBoard)).await? {
            Outcome::Board(board) => Ok(board),
            other => Err(unexpected(other)),
        }
    }

    async fn modify(
        &self,
        index: usize,
        message: Message,
        seq: Option<SequenceNumber>,
    ) -> Result<Ack> {
        let request = Request::new(Command::Modify)
            .with_index(index)
            .with_message(message)
            .with_seq(seq);
        Self::expect_ack(self.call(request).await?)
    }

    async fn delete(&self, index: usize, seq: Option<SequenceNumber>) -> Result<Ack> {
        let request = Request::new(Command::Delete).with_index(index).with_seq(seq);
        Self::expect_ack(self.call(request).await?)
    }

    async fn delete_all(&self, seq: Option<SequenceNumber>) -> Result<Ack> {
        let request = Request::new(Command::DeleteAll).with_seq(seq);
        Self::expect_ack(self.call(request).await?)
    }

    async fn acquire(&self) -> Result<bool> {
        Self::expect_flag(self.call(Request::new(Command::Acquire)).await?)
    }

    async fn release(&self) -> Result<bool> {
        Self::expect_flag(self.call(Request::new(Command::Release)).await?)
    }

    async fn are_you_alive(&self) -> Result<bool> {
        Ok(matches!(
            self.call(Request::new(Command::AreYouAlive)).await?,
            Outcome::Yes
        ))
    }

    async fn election(&self) -> Result<bool> {
        Ok(matches!(
            self.call(Request::new(Command::Election)).await?,
            Outcome::TakeOver
        ))
    }

    async fn set_coordinator(&self, coordinator: ReplicaId) -> Result<()> {
        let request = Request::new(Command::SetCoordinator).with_coordinator(coordinator);
        self.call(request).await.map(|_| ())
    }

    async fn get_sequence_number(&self) -> Result<SequenceNumber> {
        match self.call(Request::new(Command::GetSequenceNumber)).await? {
            Outcome::Seq(seq) => Ok(seq),
            other => Err(unexpected(other)),
        }
    }

    async fn synchronize(&self, other: ReplicaId) -> Result<()> {
        let request = Request::new(Command::Synchronize).with_other_server(other);
        self.call(request).await.map(|_| ())
    }

    async fn close(&self) -> Result<()> {
        self.connection.lock().await.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{Dispatcher, ServerContext};
    use crate::storage::{BoardOrder, MessageStore};
    use crate::transport::{InMemoryNetwork, LossyConnector};
    use std::time::Instant;

    async fn network_with_replica() -> InMemoryNetwork {
        let network = InMemoryNetwork::new();
        let board = Arc::new(MessageStore::new(BoardOrder::Arrival));
        let ctx = ServerContext::new(0, board);
        network
            .register("replica-0", Arc::new(Dispatcher::new(ctx)))
            .await;
        network
    }

    #[tokio::test]
    async fn test_call_round_trips() {
        let network = network_with_replica().await;
        let proxy = RemoteProxy::new("replica-0", Origin::Client, Arc::new(network))
            .with_reply_timeout(Duration::from_millis(100));

        proxy.put("hello".into(), None).await.unwrap();
        assert_eq!(proxy.get_num().await.unwrap(), 1);
        assert_eq!(proxy.addr(), "replica-0");
    }

    #[tokio::test]
    async fn test_lost_reply_times_out() {
        let network = network_with_replica().await;
        let lossy = LossyConnector::with_seed(network, 1.0, 3);
        let proxy = RemoteProxy::new("replica-0", Origin::Client, Arc::new(lossy))
            .with_reply_timeout(Duration::from_millis(50));

        let started = Instant::now();
        let err = proxy.get_num().await.unwrap_err();
        assert!(matches!(
            err,
            BoardError::ConnectionFailure {
                source: TransportError::TimedOut(_),
                ..
            }
        ));
        // one attempt plus one reconnect
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_unreachable_replica_is_connection_failure() {
        let proxy = RemoteProxy::new(
            "nowhere",
            Origin::Replica(1),
            Arc::new(InMemoryNetwork::new()),
        );
        assert!(matches!(
            proxy.are_you_alive().await,
            Err(BoardError::ConnectionFailure { .. })
        ));
    }
}
