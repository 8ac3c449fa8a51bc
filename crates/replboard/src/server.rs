use crate::board::Board;
use crate::clock::VectorClock;
use crate::coord::{Sequencer, TryMutex};
use crate::election::LeaderElection;
use crate::error::{BoardError, Result};
use crate::protocol::{Command, Outcome, Request, handler_error_reply, unknown_command_reply};
use crate::sync::AntiEntropy;
use crate::types::ReplicaId;
use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Everything one replica needs to answer requests
///
/// Built once at startup and handed to the [`Dispatcher`]; there is no
/// process-wide state besides this.
pub struct ServerContext {
    id: ReplicaId,
    board: Arc<dyn Board>,
    clock: Option<Arc<VectorClock>>,
    mutex: TryMutex,
    sequencer: Option<Arc<Sequencer>>,
    election: Option<Arc<LeaderElection>>,
    sync: Option<Arc<AntiEntropy>>,
}

impl ServerContext {
    pub fn new(id: ReplicaId, board: Arc<dyn Board>) -> Self {
        Self {
            id,
            board,
            clock: None,
            mutex: TryMutex::new(),
            sequencer: None,
            election: None,
            sync: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<VectorClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Host the cluster sequencer on this replica
    pub fn with_sequencer(mut self, sequencer: Arc<Sequencer>) -> Self {
        self.sequencer = Some(sequencer);
        self
    }

    pub fn with_election(mut self, election: Arc<LeaderElection>) -> Self {
        self.election = Some(election);
        self
    }

    pub fn with_sync(mut self, sync: Arc<AntiEntropy>) -> Self {
        self.sync = Some(sync);
        self
    }

    pub fn id(&self) -> ReplicaId {
        self.id
    }

    pub fn board(&self) -> &Arc<dyn Board> {
        &self.board
    }

    pub fn mutex(&self) -> &TryMutex {
        &self.mutex
    }
}

/// Turns request frames into reply frames for one replica
///
/// Every failure is caught here and downgraded to the sentinel matching the
/// requester class, so one bad request never ends a connection.
pub struct Dispatcher {
    ctx: ServerContext,
}

impl Dispatcher {
    pub fn new(ctx: ServerContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &ServerContext {
        &self.ctx
    }

    /// Decode, dispatch and encode one frame
    pub async fn handle_frame(&self, frame: &[u8]) -> Bytes {
        let reply = match Request::decode(frame) {
            Ok(request) => self.dispatch(request).await,
            Err(e) => {
                warn!("Replica {} got an undecodable request: {}", self.ctx.id, e);
                handler_error_reply(false, None)
            }
        };

        match serde_json::to_vec(&reply) {
            Ok(body) => Bytes::from(body),
            Err(e) => {
                warn!("Failed to encode reply: {}", e);
                Bytes::from_static(b"\"B-ERR\"")
            }
        }
    }

    /// Execute one request and shape the reply for its sender
    pub async fn dispatch(&self, request: Request) -> Value {
        let from_peer = request.is_from_peer();
        if let (Some(clock), Some(time)) = (&self.ctx.clock, &request.time) {
            clock.merge(time).await;
        }

        let result = match request.command() {
            Ok(command) => {
                trace!(
                    "Replica {} handling {} from {}",
                    self.ctx.id, command, request.origin
                );
                self.execute(command, &request).await
            }
            Err(e) => Err(e),
        };

        let time = match &self.ctx.clock {
            Some(clock) if from_peer => Some(clock.peek().await),
            _ => None,
        };

        match result {
            Ok(outcome) if from_peer => outcome.to_peer(time.as_ref()),
            Ok(outcome) => outcome.to_client(),
            Err(e) if e.is_unknown_command() => {
                warn!("Replica {}: {}", self.ctx.id, e);
                unknown_command_reply(from_peer, time.as_ref())
            }
            Err(e) => {
                warn!(
                    "Replica {} failed {} from {}: {}",
                    self.ctx.id, request.command, request.origin, e
                );
                handler_error_reply(from_peer, time.as_ref())
            }
        }
    }

    async fn execute(&self, command: Command, request: &Request) -> Result<Outcome> {
        let board = &self.ctx.board;
        let origin = request.origin;
        let seq = request.seq;

        let outcome = match command {
            Command::Put => Outcome::Ack(board.put(request.require_message()?, origin, seq).await?),
            Command::Get => Outcome::Message(board.get(request.require_index()?, origin).await?),
            Command::GetNum => Outcome::Num(board.get_num(origin).await?),
            Command::GetBoard => Outcome::Board(board.get_board(origin).await?),
            Command::Modify => Outcome::Ack(
                board
                    .modify(
                        request.require_index()?,
                        request.require_message()?,
                        origin,
                        seq,
                    )
                    .await?,
            ),
            Command::Delete => {
                Outcome::Ack(board.delete(request.require_index()?, origin, seq).await?)
            }
            Command::DeleteAll => Outcome::Ack(board.delete_all(origin, seq).await?),
            Command::Acquire => {
                let granted = self.ctx.mutex.acquire();
                debug!("Mutex on {} requested by {}: {}", self.ctx.id, origin, granted);
                Outcome::Flag(granted)
            }
            Command::Release => Outcome::Flag(self.ctx.mutex.release()),
            Command::AreYouAlive => Outcome::Yes,
            Command::Election => {
                let election = self.ctx.election.as_ref().ok_or(BoardError::NoElection)?;
                election.on_election();
                Outcome::TakeOver
            }
            Command::SetCoordinator => {
                let election = self.ctx.election.as_ref().ok_or(BoardError::NoElection)?;
                let coordinator = request
                    .coordinator
                    .ok_or(BoardError::MissingField("COORDINATORID"))?;
                election.set_coordinator(coordinator);
                Outcome::Ok
            }
            Command::GetSequenceNumber => {
                let sequencer = self.ctx.sequencer.as_ref().ok_or(BoardError::NoSequencer)?;
                let seq = sequencer.next();
                debug!("Issued sequence number {} to {}", seq, origin);
                Outcome::Seq(seq)
            }
            Command::Synchronize => {
                let sync = self
                    .ctx
                    .sync
                    .as_ref()
                    .ok_or_else(|| BoardError::UnknownCommand(command.to_string()))?;
                let other = request
                    .other_server
                    .ok_or(BoardError::MissingField("OTHERSERVERID"))?;
                sync.synchronize(other).await?;
                Outcome::Ok
            }
        };
        Ok(outcome)
    }

    /// Flush and close the board
    pub async fn close(&self) -> Result<()> {
        self.ctx.board.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{BoardOrder, MessageStore};
    use crate::types::{Message, Origin, VectorTime};
    use serde_json::json;

    fn dispatcher() -> Dispatcher {
        let board: Arc<dyn Board> = Arc::new(MessageStore::new(BoardOrder::Arrival));
        let ctx = ServerContext::new(0, board)
            .with_clock(Arc::new(VectorClock::new(2, 0)))
            .with_sequencer(Arc::new(Sequencer::new()));
        Dispatcher::new(ctx)
    }

    async fn call(dispatcher: &Dispatcher, request: Value) -> Value {
        let frame = serde_json::to_vec(&request).unwrap();
        let reply = dispatcher.handle_frame(&frame).await;
        serde_json::from_slice(&reply).unwrap()
    }

    #[tokio::test]
    async fn test_client_gets_bare_values() {
        let d = dispatcher();
        assert_eq!(
            call(&d, json!({"COMMAND": "PUT", "MESSAGE": "hello", "MYID": -1})).await,
            json!("DONE")
        );
        assert_eq!(call(&d, json!({"COMMAND": "getnum"})).await, json!(1));
        assert_eq!(
            call(&d, json!({"COMMAND": "GET", "INDEX": 0})).await,
            json!("hello")
        );
        assert_eq!(call(&d, json!({"COMMAND": "GETBOARD"})).await, json!(["hello"]));
        assert_eq!(call(&d, json!({"COMMAND": "AREYOUALIVE"})).await, json!("YES"));
    }

    #[tokio::test]
    async fn test_peer_gets_envelope_with_time() {
        let d = dispatcher();
        let reply = call(
            &d,
            json!({"COMMAND": "PUT", "MESSAGE": "x", "MYID": 1, "TIME": [0, 3]}),
        )
        .await;
        // merge counts as an event on replica 0
        assert_eq!(reply, json!({"RESULT": "DONE", "TIME": [1, 3]}));

        let reply = call(&d, json!({"COMMAND": "GETNUM", "MYID": 1, "TIME": [0, 3]})).await;
        assert_eq!(reply, json!({"RESULT": "OK", "NUM": 1, "TIME": [2, 3]}));
    }

    #[tokio::test]
    async fn test_unknown_command_sentinels() {
        let d = dispatcher();
        assert_eq!(call(&d, json!({"COMMAND": "FROB"})).await, json!("A-ERR"));
        let reply = call(&d, json!({"COMMAND": "FROB", "MYID": 1, "TIME": [0, 0]})).await;
        assert_eq!(reply["RESULT"], json!("UNKNOWN"));
    }

    #[tokio::test]
    async fn test_handler_errors_do_not_break_dispatch() {
        let d = dispatcher();
        assert_eq!(
            call(&d, json!({"COMMAND": "GET", "INDEX": 4})).await,
            json!("B-ERR")
        );
        assert_eq!(call(&d, json!({"COMMAND": "MODIFY", "INDEX": 0})).await, json!("B-ERR"));
        let reply = call(&d, json!({"COMMAND": "DELETE", "INDEX": 9, "MYID": 1, "TIME": [0, 1]})).await;
        assert_eq!(reply["RESULT"], json!("ERROR"));
        assert!(reply.get("TIME").is_some());

        let garbage = d.handle_frame(b"not json").await;
        assert_eq!(&garbage[..], b"\"B-ERR\"");

        // still serving
        assert_eq!(call(&d, json!({"COMMAND": "GETNUM"})).await, json!(0));
    }

    #[tokio::test]
    async fn test_mutex_and_sequencer_commands() {
        let d = dispatcher();
        assert_eq!(call(&d, json!({"COMMAND": "ACQUIRE"})).await, json!(true));
        assert_eq!(call(&d, json!({"COMMAND": "ACQUIRE"})).await, json!(false));
        assert_eq!(call(&d, json!({"COMMAND": "RELEASE"})).await, json!(true));
        assert_eq!(call(&d, json!({"COMMAND": "RELEASE"})).await, json!(false));

        assert_eq!(call(&d, json!({"COMMAND": "GETSEQUENCENUMBER"})).await, json!(1));
        let reply = call(
            &d,
            json!({"COMMAND": "GETSEQUENCENUMBER", "MYID": 1, "TIME": [0, 0]}),
        )
        .await;
        assert_eq!(reply["SEQNUM"], json!(2));
    }

    #[tokio::test]
    async fn test_missing_collaborators_are_handler_errors() {
        let board: Arc<dyn Board> = Arc::new(MessageStore::new(BoardOrder::Arrival));
        let d = Dispatcher::new(ServerContext::new(1, board));
        assert_eq!(call(&d, json!({"COMMAND": "GETSEQUENCENUMBER"})).await, json!("B-ERR"));
        assert_eq!(call(&d, json!({"COMMAND": "ELECTION"})).await, json!("B-ERR"));
        assert_eq!(
            call(&d, json!({"COMMAND": "SYNCHRONIZE", "OTHERSERVERID": 0})).await,
            json!("A-ERR")
        );
    }

    #[tokio::test]
    async fn test_timestamped_message_travels_as_pair() {
        let d = dispatcher();
        let reply = call(
            &d,
            json!({"COMMAND": "PUT", "MESSAGE": [[2, 0], "m"], "MYID": 1, "TIME": [2, 0]}),
        )
        .await;
        assert_eq!(reply["RESULT"], json!("DONE"));
        let board = d.context().board().get_board(Origin::Client).await.unwrap();
        assert_eq!(
            board,
            vec![Message::Timestamped(
                VectorTime::from_counters(vec![2, 0]),
                "m".to_string()
            )]
        );
    }
}
