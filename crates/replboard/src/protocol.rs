//! Request/response envelope spoken between clients, replicas and the
//! dispatcher.
//!
//! Requests are JSON objects keyed by upper-case field names. A request that
//! carries `TIME` comes from another replica and gets an envelope reply
//! (`{"RESULT": ..., "TIME": ...}`); everything else gets a bare value.

use crate::error::{BoardError, Result};
use crate::types::{Ack, Message, Origin, ReplicaId, SequenceNumber, VectorTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::fmt;
use std::str::FromStr;

pub const DONE: &str = "DONE";
pub const QUEUED: &str = "QUEUED";
pub const OK: &str = "OK";
pub const YES: &str = "YES";
pub const TAKE_OVER: &str = "Take-Over";
pub const ERROR: &str = "ERROR";
pub const UNKNOWN: &str = "UNKNOWN";
pub const CLIENT_UNKNOWN_COMMAND: &str = "A-ERR";
pub const CLIENT_HANDLER_ERROR: &str = "B-ERR";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Put,
    Get,
    GetNum,
    GetBoard,
    Modify,
    Delete,
    DeleteAll,
    Acquire,
    Release,
    AreYouAlive,
    Election,
    SetCoordinator,
    GetSequenceNumber,
    Synchronize,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Put => "PUT",
            Command::Get => "GET",
            Command::GetNum => "GETNUM",
            Command::GetBoard => "GETBOARD",
            Command::Modify => "MODIFY",
            Command::Delete => "DELETE",
            Command::DeleteAll => "DELETEALL",
            Command::Acquire => "ACQUIRE",
            Command::Release => "RELEASE",
            Command::AreYouAlive => "AREYOUALIVE",
            Command::Election => "ELECTION",
            Command::SetCoordinator => "SETCOORDINATOR",
            Command::GetSequenceNumber => "GETSEQUENCENUMBER",
            Command::Synchronize => "SYNCHRONIZE",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = BoardError;

    fn from_str(s: &str) -> Result<Self> {
        let command = match s.to_uppercase().as_str() {
            "PUT" => Command::Put,
            "GET" => Command::Get,
            "GETNUM" => Command::GetNum,
            "GETBOARD" => Command::GetBoard,
            "MODIFY" => Command::Modify,
            "DELETE" => Command::Delete,
            "DELETEALL" => Command::DeleteAll,
            "ACQUIRE" => Command::Acquire,
            "RELEASE" => Command::Release,
            "AREYOUALIVE" => Command::AreYouAlive,
            "ELECTION" => Command::Election,
            "SETCOORDINATOR" => Command::SetCoordinator,
            "GETSEQUENCENUMBER" => Command::GetSequenceNumber,
            "SYNCHRONIZE" => Command::Synchronize,
            _ => return Err(BoardError::UnknownCommand(s.to_string())),
        };
        Ok(command)
    }
}

fn client_origin() -> Origin {
    Origin::Client
}

/// Request envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "COMMAND", default)]
    pub command: String,
    #[serde(rename = "MESSAGE", default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(rename = "INDEX", default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(rename = "MYID", default = "client_origin")]
    pub origin: Origin,
    #[serde(rename = "SEQNUM", default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<SequenceNumber>,
    #[serde(rename = "TIME", default, skip_serializing_if = "Option::is_none")]
    pub time: Option<VectorTime>,
    #[serde(rename = "COORDINATORID", default, skip_serializing_if = "Option::is_none")]
    pub coordinator: Option<ReplicaId>,
    #[serde(rename = "OTHERSERVERID", default, skip_serializing_if = "Option::is_none")]
    pub other_server: Option<ReplicaId>,
}

impl Request {
    pub fn new(command: Command) -> Self {
        Self {
            command: command.as_str().to_string(),
            message: None,
            index: None,
            origin: Origin::Client,
            seq: None,
            time: None,
            coordinator: None,
            other_server: None,
        }
    }

    pub fn with_message(mut self, message: Message) -> Self {
        self.message = Some(message);
        self
    }

    pub fn with_index(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_seq(mut self, seq: Option<SequenceNumber>) -> Self {
        self.seq = seq;
        self
    }

    pub fn with_coordinator(mut self, coordinator: ReplicaId) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn with_other_server(mut self, other: ReplicaId) -> Self {
        self.other_server = Some(other);
        self
    }

    pub fn command(&self) -> Result<Command> {
        self.command.parse()
    }

    /// Server-to-server requests are recognised by the attached timestamp
    pub fn is_from_peer(&self) -> bool {
        self.time.is_some()
    }

    pub fn require_message(&self) -> Result<Message> {
        self.message.clone().ok_or(BoardError::MissingField("MESSAGE"))
    }

    pub fn require_index(&self) -> Result<usize> {
        self.index.ok_or(BoardError::MissingField("INDEX"))
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(frame)?)
    }
}

/// Successful result of executing one command
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Ack(Ack),
    Ok,
    Yes,
    TakeOver,
    Flag(bool),
    Message(Message),
    Num(usize),
    Board(Vec<Message>),
    Seq(SequenceNumber),
}

impl Outcome {
    /// Bare value sent to clients
    pub fn to_client(&self) -> Value {
        match self {
            Outcome::Ack(Ack::Done) => json!(DONE),
            Outcome::Ack(Ack::Queued) => json!(QUEUED),
            Outcome::Ok => json!(OK),
            Outcome::Yes => json!(YES),
            Outcome::TakeOver => json!(TAKE_OVER),
            Outcome::Flag(flag) => json!(flag),
            Outcome::Message(message) => json!(message),
            Outcome::Num(n) => json!(n),
            Outcome::Board(board) => json!(board),
            Outcome::Seq(seq) => json!(seq),
        }
    }

    /// Envelope sent to other replicas
    pub fn to_peer(&self, time: Option<&VectorTime>) -> Value {
        let mut envelope = Map::new();
        let (result, field) = match self {
            Outcome::Ack(Ack::Done) => (DONE, None),
            Outcome::Ack(Ack::Queued) => (QUEUED, None),
            Outcome::Ok => (OK, None),
            Outcome::Yes => (YES, None),
            Outcome::TakeOver => (TAKE_OVER, None),
            Outcome::Flag(flag) => (OK, Some(("GRANTED", json!(flag)))),
            Outcome::Message(message) => (OK, Some(("MESSAGE", json!(message)))),
            Outcome::Num(n) => (OK, Some(("NUM", json!(n)))),
            Outcome::Board(board) => (OK, Some(("BOARD", json!(board)))),
            Outcome::Seq(seq) => (OK, Some(("SEQNUM", json!(seq)))),
        };
        envelope.insert("RESULT".to_string(), json!(result));
        if let Some((key, value)) = field {
            envelope.insert(key.to_string(), value);
        }
        insert_time(&mut envelope, time);
        Value::Object(envelope)
    }

    /// Interpret a reply, bare or enveloped, for the command that was sent
    pub fn decode(command: Command, reply: &Value) -> Result<Outcome> {
        match reply {
            Value::Object(envelope) if envelope.contains_key("RESULT") => {
                Self::decode_envelope(command, envelope)
            }
            bare => Self::decode_bare(command, bare),
        }
    }

    fn decode_envelope(command: Command, envelope: &Map<String, Value>) -> Result<Outcome> {
        let result = envelope.get("RESULT").and_then(Value::as_str).unwrap_or("");
        match result {
            ERROR => return Err(BoardError::Remote),
            UNKNOWN => return Err(BoardError::UnknownCommand(command.to_string())),
            _ => {}
        }

        let field = |key: &'static str| {
            envelope
                .get(key)
                .ok_or_else(|| BoardError::Protocol(format!("{} reply without {}", command, key)))
        };

        match command {
            Command::Get => Ok(Outcome::Message(serde_json::from_value(
                field("MESSAGE")?.clone(),
            )?)),
            Command::GetNum => Ok(Outcome::Num(serde_json::from_value(field("NUM")?.clone())?)),
            Command::GetBoard => Ok(Outcome::Board(serde_json::from_value(
                field("BOARD")?.clone(),
            )?)),
            Command::GetSequenceNumber => {
                Ok(Outcome::Seq(serde_json::from_value(field("SEQNUM")?.clone())?))
            }
            Command::Acquire | Command::Release => Ok(Outcome::Flag(serde_json::from_value(
                field("GRANTED")?.clone(),
            )?)),
            _ => Self::decode_word(command, result),
        }
    }

    fn decode_bare(command: Command, reply: &Value) -> Result<Outcome> {
        if let Some(word) = reply.as_str() {
            match word {
                ERROR | CLIENT_HANDLER_ERROR => return Err(BoardError::Remote),
                CLIENT_UNKNOWN_COMMAND => {
                    return Err(BoardError::UnknownCommand(command.to_string()));
                }
                _ => {}
            }
        }

        match command {
            Command::Get => Ok(Outcome::Message(serde_json::from_value(reply.clone())?)),
            Command::GetNum => Ok(Outcome::Num(serde_json::from_value(reply.clone())?)),
            Command::GetBoard => Ok(Outcome::Board(serde_json::from_value(reply.clone())?)),
            Command::GetSequenceNumber => Ok(Outcome::Seq(serde_json::from_value(reply.clone())?)),
            Command::Acquire | Command::Release => {
                Ok(Outcome::Flag(serde_json::from_value(reply.clone())?))
            }
            _ => match reply.as_str() {
                Some(word) => Self::decode_word(command, word),
                None => Err(BoardError::Protocol(format!(
                    "unexpected {} reply: {}",
                    command, reply
                ))),
            },
        }
    }

    fn decode_word(command: Command, word: &str) -> Result<Outcome> {
        match word {
            DONE => Ok(Outcome::Ack(Ack::Done)),
            QUEUED => Ok(Outcome::Ack(Ack::Queued)),
            OK => Ok(Outcome::Ok),
            YES => Ok(Outcome::Yes),
            TAKE_OVER => Ok(Outcome::TakeOver),
            other => Err(BoardError::Protocol(format!(
                "unexpected {} reply: {}",
                command, other
            ))),
        }
    }
}

fn insert_time(envelope: &mut Map<String, Value>, time: Option<&VectorTime>) {
    if let Some(time) = time {
        envelope.insert("TIME".to_string(), json!(time));
    }
}

/// Reply for a request whose command is not recognised
pub fn unknown_command_reply(from_peer: bool, time: Option<&VectorTime>) -> Value {
    if from_peer {
        let mut envelope = Map::new();
        envelope.insert("RESULT".to_string(), json!(UNKNOWN));
        insert_time(&mut envelope, time);
        Value::Object(envelope)
    } else {
        json!(CLIENT_UNKNOWN_COMMAND)
    }
}

/// Reply for a request whose handler failed
pub fn handler_error_reply(from_peer: bool, time: Option<&VectorTime>) -> Value {
    if from_peer {
        let mut envelope = Map::new();
        envelope.insert("RESULT".to_string(), json!(ERROR));
        insert_time(&mut envelope, time);
        Value::Object(envelope)
    } else {
        json!(CLIENT_HANDLER_ERROR)
    }
}

/// Timestamp carried by a reply envelope, if any
pub fn reply_time(reply: &Value) -> Option<VectorTime> {
    reply
        .as_object()
        .and_then(|envelope| envelope.get("TIME"))
        .and_then(|time| serde_json::from_value(time.clone()).ok())
}
