use crate::board::Board;
use crate::clock::VectorClock;
use crate::config::{Config, DeliveryKind, StrategyKind};
use crate::coord::Sequencer;
use crate::delivery::{AtLeastOnceProxy, AtMostOnceFilter, FaultTolerantProxy};
use crate::election::LeaderElection;
use crate::error::{BoardError, Result};
use crate::peer::Peer;
use crate::proxy::RemoteProxy;
use crate::server::{Dispatcher, ServerContext};
use crate::storage::{BoardOrder, MessageStore};
use crate::strategy::{
    CausalBroadcast, CoordinatorForward, InformAll, MutexSerialized, SequencedReplication,
};
use crate::sync::AntiEntropy;
use crate::transport::{Connector, LossyConnector};
use crate::types::{Origin, ReplicaId};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// One fully wired replica
///
/// Owns the local store, the clock, the election and anti-entropy
/// components and the dispatcher that fronts them. Anti-entropy is only
/// attached for strategies that accept its pushes as plain peer writes.
/// Serving it over TCP is left to [`crate::listener::Listener`]; tests
/// register the dispatcher on an in-memory network instead.
pub struct Node {
    pub id: ReplicaId,
    pub store: Arc<MessageStore>,
    pub clock: Arc<VectorClock>,
    pub election: Arc<LeaderElection>,
    pub sync: Option<Arc<AntiEntropy>>,
    pub dispatcher: Arc<Dispatcher>,
    config: Config,
}

impl Node {
    pub async fn build(config: Config, connector: Arc<dyn Connector>) -> Result<Self> {
        let id = config.server.id;
        let addrs = config.replica_addrs();
        // replica IDs double as indices, so they must be exactly 0..n
        let mut ids: Vec<ReplicaId> = config.cluster.replicas.iter().map(|r| r.id).collect();
        ids.sort_unstable();
        if let Some((_, bad)) = ids.iter().enumerate().find(|(pos, id)| pos != *id) {
            return Err(BoardError::UnknownReplica(*bad));
        }
        if id >= addrs.len() {
            return Err(BoardError::UnknownReplica(id));
        }
        let coordinator_id = config.replication.coordinator_id;
        if coordinator_id >= addrs.len() {
            return Err(BoardError::UnknownReplica(coordinator_id));
        }

        let connector: Arc<dyn Connector> = if config.transport.loss_probability > 0.0 {
            info!(
                "Replica {} dropping frames with probability {}",
                id, config.transport.loss_probability
            );
            Arc::new(LossyConnector::new(
                connector,
                config.transport.loss_probability,
            ))
        } else {
            connector
        };

        let clock = Arc::new(VectorClock::new(addrs.len(), id));
        let ordering = match config.replication.strategy {
            StrategyKind::Causal => BoardOrder::TotalOrder,
            _ => BoardOrder::Arrival,
        };
        let store = Arc::new(match &config.server.checkpoint_path {
            Some(path) => MessageStore::open(path, ordering).await?,
            None => MessageStore::new(ordering),
        });

        let proxies: Vec<Arc<dyn Peer>> = addrs
            .iter()
            .map(|addr| {
                Arc::new(raw_proxy(&config, addr, id, &connector, &clock)) as Arc<dyn Peer>
            })
            .collect();
        let delivered = wrap_delivery(&config, &addrs, id, &connector, &clock);
        let sequencer = (id == coordinator_id).then(|| Arc::new(Sequencer::new()));

        let election = Arc::new(LeaderElection::new(
            id,
            proxies.clone(),
            config.timing.election_timeout(),
        ));

        let strategy: Arc<dyn Board> = match config.replication.strategy {
            StrategyKind::Sequenced => {
                let replication = SequencedReplication::new(
                    id,
                    Arc::clone(&store),
                    delivered,
                    Arc::clone(&proxies[coordinator_id]),
                );
                match &sequencer {
                    Some(local) => Arc::new(replication.with_local_sequencer(Arc::clone(local))),
                    None => Arc::new(replication),
                }
            }
            StrategyKind::CoordinatorForward => Arc::new(CoordinatorForward::new(
                id,
                coordinator_id,
                Arc::clone(&store),
                delivered,
            )),
            StrategyKind::Causal => Arc::new(CausalBroadcast::new(
                id,
                Arc::clone(&clock),
                Arc::clone(&store),
                delivered,
            )),
            StrategyKind::MutexSerialized => Arc::new(MutexSerialized::new(
                id,
                Arc::clone(&store),
                delivered,
                Arc::clone(&election),
                config.timing.poll_interval(),
            )),
            StrategyKind::InformAll => Arc::new(InformAll::new(id, Arc::clone(&store), delivered)),
        };
        let settings = &config.replication;
        let board: Arc<dyn Board> = match (settings.at_most_once, settings.strategy) {
            (false, _) => strategy,
            // sequence numbers order sequenced writes, so they must get through
            (true, StrategyKind::Sequenced) => Arc::new(AtMostOnceFilter::keeping_seq(strategy)),
            (true, _) => Arc::new(AtMostOnceFilter::new(strategy)),
        };

        let sync = config.replication.strategy.supports_sync().then(|| {
            Arc::new(AntiEntropy::new(
                id,
                Arc::clone(&store) as Arc<dyn Board>,
                proxies,
            ))
        });

        let mut ctx = ServerContext::new(id, board)
            .with_clock(Arc::clone(&clock))
            .with_election(Arc::clone(&election));
        if let Some(sync) = &sync {
            ctx = ctx.with_sync(Arc::clone(sync));
        }
        if let Some(sequencer) = sequencer {
            ctx = ctx.with_sequencer(sequencer);
        }

        info!(
            "Replica {} of {} ready: {:?} strategy, {:?} delivery{}",
            id,
            addrs.len(),
            config.replication.strategy,
            config.replication.delivery,
            if config.replication.at_most_once {
                ", at-most-once filter"
            } else {
                ""
            }
        );

        Ok(Self {
            id,
            store,
            clock,
            election,
            sync,
            dispatcher: Arc::new(Dispatcher::new(ctx)),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start periodic anti-entropy if configured
    pub fn start_background_tasks(&self) -> Option<JoinHandle<()>> {
        let interval = self.config.timing.sync_interval()?;
        let Some(sync) = &self.sync else {
            warn!(
                "Replica {} ignoring sync_interval_ms: {:?} strategy does not support anti-entropy",
                self.id, self.config.replication.strategy
            );
            return None;
        };
        info!("Replica {} syncing every {:?}", self.id, interval);
        Some(sync.spawn_periodic(interval))
    }
}

/// Proxy with this replica's identity, clock and reply timeout
fn raw_proxy(
    config: &Config,
    addr: &str,
    id: ReplicaId,
    connector: &Arc<dyn Connector>,
    clock: &Arc<VectorClock>,
) -> RemoteProxy {
    RemoteProxy::new(addr, Origin::Replica(id), Arc::clone(connector))
        .with_clock(Arc::clone(clock))
        .with_reply_timeout(config.timing.attempt_timeout())
}

/// Peer handles used for propagation, wrapped per the delivery setting
fn wrap_delivery(
    config: &Config,
    addrs: &[String],
    id: ReplicaId,
    connector: &Arc<dyn Connector>,
    clock: &Arc<VectorClock>,
) -> Vec<Arc<dyn Peer>> {
    let timing = &config.timing;
    addrs
        .iter()
        .map(|addr| {
            let proxy = raw_proxy(config, addr, id, connector, clock);
            match config.replication.delivery {
                DeliveryKind::Direct => Arc::new(proxy) as Arc<dyn Peer>,
                DeliveryKind::AtLeastOnce => Arc::new(AtLeastOnceProxy::new(
                    proxy,
                    timing.attempt_timeout(),
                    timing.max_retries,
                )),
                DeliveryKind::FaultTolerant => {
                    Arc::new(FaultTolerantProxy::new(proxy, timing.retry_delay()))
                }
            }
        })
        .collect()
}
