use crate::election::DEFAULT_ELECTION_TIMEOUT;
use crate::types::ReplicaId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub id: ReplicaId,
    /// Defaults to this replica's address in the cluster list
    #[serde(default)]
    pub listen_addr: Option<String>,
    #[serde(default)]
    pub checkpoint_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub replicas: Vec<ReplicaInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, PartialOrd, Eq, Ord)]
pub struct ReplicaInfo {
    pub id: ReplicaId,
    pub addr: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    Sequenced,
    CoordinatorForward,
    Causal,
    MutexSerialized,
    InformAll,
}

impl StrategyKind {
    /// Whether anti-entropy can run under this strategy. It pushes messages
    /// as plain peer writes, which only strategies that apply those
    /// directly accept without reordering or re-forwarding them.
    pub fn supports_sync(self) -> bool {
        matches!(self, StrategyKind::Causal | StrategyKind::InformAll)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryKind {
    #[default]
    Direct,
    AtLeastOnce,
    FaultTolerant,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicationConfig {
    #[serde(default)]
    pub strategy: StrategyKind,
    /// Static coordinator for coordinator_forward and home of the sequencer
    #[serde(default)]
    pub coordinator_id: ReplicaId,
    #[serde(default)]
    pub delivery: DeliveryKind,
    #[serde(default)]
    pub at_most_once: bool,
}

fn default_attempt_timeout_ms() -> u64 {
    3000
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_election_timeout_ms() -> Option<u64> {
    Some(DEFAULT_ELECTION_TIMEOUT.as_millis() as u64)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// 0 waits for an announcement forever
    #[serde(default = "default_election_timeout_ms")]
    pub election_timeout_ms: Option<u64>,
    #[serde(default)]
    pub sync_interval_ms: Option<u64>,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_ms: default_attempt_timeout_ms(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            election_timeout_ms: default_election_timeout_ms(),
            sync_interval_ms: None,
        }
    }
}

impl TimingConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn election_timeout(&self) -> Option<Duration> {
        self.election_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn sync_interval(&self) -> Option<Duration> {
        self.sync_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Chance of losing each frame in either direction; 0 disables loss
    #[serde(default)]
    pub loss_probability: f64,
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()?;

        settings.try_deserialize()
    }

    pub fn from_toml_str(toml: &str) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?;

        settings.try_deserialize()
    }

    /// Config for a cluster whose replicas are listed in ID order
    pub fn for_cluster(id: ReplicaId, addrs: &[String], strategy: StrategyKind) -> Self {
        Self {
            server: ServerConfig {
                id,
                listen_addr: None,
                checkpoint_path: None,
            },
            cluster: ClusterConfig {
                replicas: addrs
                    .iter()
                    .enumerate()
                    .map(|(id, addr)| ReplicaInfo {
                        id,
                        addr: addr.clone(),
                    })
                    .collect(),
            },
            replication: ReplicationConfig {
                strategy,
                ..ReplicationConfig::default()
            },
            timing: TimingConfig::default(),
            transport: TransportConfig::default(),
        }
    }

    /// Run as a different replica of the same cluster
    pub fn with_id(mut self, id: ReplicaId) -> Self {
        if self.server.id != id {
            self.server.id = id;
            self.server.listen_addr = None;
        }
        self
    }

    /// Replica addresses ordered by ID
    pub fn replica_addrs(&self) -> Vec<String> {
        let mut replicas = self.cluster.replicas.clone();
        replicas.sort();
        replicas.into_iter().map(|r| r.addr).collect()
    }

    /// Address to listen on: explicit, or this replica's cluster entry
    pub fn listen_addr(&self) -> Option<String> {
        self.server.listen_addr.clone().or_else(|| {
            self.cluster
                .replicas
                .iter()
                .find(|r| r.id == self.server.id)
                .map(|r| r.addr.clone())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_defaults() {
        let config = Config::from_toml_str(
            r#"
            [server]
            id = 1

            [cluster]
            replicas = [
                { id = 0, addr = "127.0.0.1:7000" },
                { id = 1, addr = "127.0.0.1:7001" },
            ]
            "#,
        )
        .unwrap();

        assert_eq!(config.server.id, 1);
        assert_eq!(config.listen_addr().as_deref(), Some("127.0.0.1:7001"));
        assert_eq!(config.replication.strategy, StrategyKind::Sequenced);
        assert_eq!(config.replication.delivery, DeliveryKind::Direct);
        assert_eq!(config.timing.attempt_timeout(), Duration::from_secs(3));
        assert_eq!(config.timing.max_retries, 5);
        assert_eq!(config.timing.election_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.timing.sync_interval(), None);
        assert_eq!(config.transport.loss_probability, 0.0);
    }

    #[test]
    fn test_parse_full() {
        let config = Config::from_toml_str(
            r#"
            [server]
            id = 0
            listen_addr = "0.0.0.0:9000"
            checkpoint_path = "data/board-0.json"

            [cluster]
            replicas = [
                { id = 1, addr = "b:9001" },
                { id = 0, addr = "a:9000" },
            ]

            [replication]
            strategy = "mutex_serialized"
            coordinator_id = 1
            delivery = "at_least_once"
            at_most_once = true

            [timing]
            poll_interval_ms = 10
            election_timeout_ms = 0
            sync_interval_ms = 250

            [transport]
            loss_probability = 0.2
            "#,
        )
        .unwrap();

        assert_eq!(config.listen_addr().as_deref(), Some("0.0.0.0:9000"));
        assert_eq!(config.replica_addrs(), vec!["a:9000", "b:9001"]);
        assert_eq!(config.replication.strategy, StrategyKind::MutexSerialized);
        assert_eq!(config.replication.delivery, DeliveryKind::AtLeastOnce);
        assert!(config.replication.at_most_once);
        assert_eq!(config.timing.poll_interval(), Duration::from_millis(10));
        assert_eq!(config.timing.election_timeout(), None);
        assert_eq!(config.timing.sync_interval(), Some(Duration::from_millis(250)));
        assert_eq!(config.transport.loss_probability, 0.2);
    }

    #[test]
    fn test_id_override_drops_explicit_listen_addr() {
        let addrs = vec!["a:1".to_string(), "b:2".to_string()];
        let mut config = Config::for_cluster(0, &addrs, StrategyKind::Causal);
        config.server.listen_addr = Some("0.0.0.0:1".to_string());

        let config = config.with_id(1);
        assert_eq!(config.listen_addr().as_deref(), Some("b:2"));
    }

    #[test]
    fn test_inform_all_strategy_name() {
        let config = Config::from_toml_str(
            r#"
            [server]
            id = 0

            [cluster]
            replicas = [{ id = 0, addr = "a:1" }]

            [replication]
            strategy = "inform_all"
            "#,
        )
        .unwrap();

        assert_eq!(config.replication.strategy, StrategyKind::InformAll);
        assert!(StrategyKind::InformAll.supports_sync());
        assert!(StrategyKind::Causal.supports_sync());
        assert!(!StrategyKind::Sequenced.supports_sync());
        assert!(!StrategyKind::CoordinatorForward.supports_sync());
        assert!(!StrategyKind::MutexSerialized.supports_sync());
    }
}
