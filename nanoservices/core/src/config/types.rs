use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::NodeId;

/// Everything a node needs at process start.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeConfig {
    pub node_id: NodeId,
    #[serde(default = "default_zookeeper_hosts")]
    pub zookeeper_hosts: String,
    #[serde(default = "default_kafka_brokers")]
    pub kafka_brokers: String,
    #[serde(default)]
    pub debezium_api_url: Option<String>,
    #[serde(default)]
    pub parrot_api_url: Option<String>,
    /// SQLite file backing the registry; in-memory when unset.
    #[serde(default)]
    pub registry_path: Option<PathBuf>,
    /// Directory of processor definitions seeded at startup.
    #[serde(default)]
    pub processors_dir: Option<PathBuf>,
    #[serde(default)]
    pub metrics_addr: Option<String>,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub route: RouteConfig,
}

impl NodeConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: NodeId::new(node_id),
            zookeeper_hosts: default_zookeeper_hosts(),
            kafka_brokers: default_kafka_brokers(),
            debezium_api_url: None,
            parrot_api_url: None,
            registry_path: None,
            processors_dir: None,
            metrics_addr: None,
            cluster: ClusterConfig::default(),
            lifecycle: LifecycleConfig::default(),
            route: RouteConfig::default(),
        }
    }
}

fn default_zookeeper_hosts() -> String {
    "localhost:2181".to_string()
}

fn default_kafka_brokers() -> String {
    "localhost:9092".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClusterConfig {
    #[serde(with = "duration")]
    pub heartbeat_interval: Duration,
    /// Consecutive missed heartbeats after which a node is departed.
    pub max_missed_heartbeats: u32,
    #[serde(with = "duration")]
    pub reconcile_interval: Duration,
    #[serde(with = "duration")]
    pub leader_ttl: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            max_missed_heartbeats: 3,
            reconcile_interval: Duration::from_secs(1),
            leader_ttl: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LifecycleConfig {
    #[serde(with = "duration")]
    pub tick_interval: Duration,
    /// Immediate attempts at STARTING before the processor goes to ERROR.
    pub start_attempts: u32,
    /// RUNNING is reported after this long without an error, even with no batch.
    #[serde(with = "duration")]
    pub grace_period: Duration,
    #[serde(with = "duration")]
    pub drain_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(500),
            start_attempts: 3,
            grace_period: Duration::from_secs(2),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RouteConfig {
    pub max_batch_size: usize,
    #[serde(with = "duration")]
    pub max_fill: Duration,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self { max_batch_size: 500, max_fill: Duration::from_secs(1) }
    }
}

/// Humane duration strings: `250ms`, `5s`, `2m`, `1h`.
pub mod duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn parse(value: &str) -> Option<Duration> {
        let value = value.trim();
        let split = value.find(|c: char| !c.is_ascii_digit())?;
        let (amount, unit) = value.split_at(split);
        let amount: u64 = amount.parse().ok()?;
        match unit.trim() {
            "ms" => Some(Duration::from_millis(amount)),
            "s" => Some(Duration::from_secs(amount)),
            "m" => amount.checked_mul(60).map(Duration::from_secs),
            "h" => amount.checked_mul(3600).map(Duration::from_secs),
            _ => None,
        }
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{}ms", value.as_millis()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid duration '{raw}'")))
    }
}
