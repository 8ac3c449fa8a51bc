use crate::transport::TransportError;
use crate::types::ReplicaId;
use std::time::Duration;
use thiserror::Error;

/// Failures that can occur anywhere in the board stack.
///
/// The dispatcher is the only place these are turned into wire sentinels
/// (`"A-ERR"`, `"B-ERR"`, `{RESULT: "ERROR"}`); everything below it returns
/// them with `?`.
#[derive(Debug, Error)]
pub enum BoardError {
    #[error("connection to {addr} failed: {source}")]
    ConnectionFailure {
        addr: String,
        #[source]
        source: TransportError,
    },
    #[error("index {index} out of range (board holds {len} messages)")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("remote replica answered with an error")]
    Remote,
    #[error("request is missing field {0}")]
    MissingField(&'static str),
    #[error("malformed reply: {0}")]
    Protocol(String),
    #[error("this replica does not host the sequencer")]
    NoSequencer,
    #[error("this replica has no leader election configured")]
    NoElection,
    #[error("replica {0} is not part of the cluster")]
    UnknownReplica(ReplicaId),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BoardError {
    /// Whether the dispatcher should report this as an unknown command rather
    /// than a handler failure.
    pub fn is_unknown_command(&self) -> bool {
        matches!(self, BoardError::UnknownCommand(_))
    }
}

pub type Result<T> = std::result::Result<T, BoardError>;
