// Architecture modules
pub mod board;
pub mod clock;
pub mod config;
pub mod coord;
pub mod delivery;
pub mod election;
pub mod error;
pub mod listener;
pub mod node;
pub mod peer;
pub mod protocol;
pub mod proxy;
pub mod server;
pub mod storage;
pub mod strategy;
pub mod sync;
pub mod transport;
pub mod types;

// Public exports
pub use board::Board;
pub use clock::VectorClock;
pub use config::{Config, DeliveryKind, StrategyKind};
pub use coord::{Sequencer, TryMutex};
pub use delivery::{AtLeastOnceProxy, AtMostOnceFilter, FaultTolerantProxy};
pub use election::{CoordinatorState, LeaderElection};
pub use error::{BoardError, Result};
pub use listener::Listener;
pub use node::Node;
pub use peer::Peer;
pub use protocol::{Command, Request};
pub use proxy::RemoteProxy;
pub use server::{Dispatcher, ServerContext};
pub use storage::{BoardOrder, MessageStore};
pub use strategy::{
    CausalBroadcast, CoordinatorForward, InformAll, MutexSerialized, SequencedReplication,
};
pub use sync::{AntiEntropy, SyncReport};
pub use transport::{Connector, InMemoryNetwork, LossyConnector, TcpConnector};
pub use types::{Ack, Message, Operation, Origin, ReplicaId, SequenceNumber, VectorTime};
