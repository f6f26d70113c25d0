use std::path::Path;

use parrot_utils::error::Error;
use parrot_utils::ParrotResult;

use crate::config::types::NodeConfig;
use crate::model::{NodeId, ProcessorDefinition};

/// Load a node config from a YAML file and apply `PARROT_*` environment
/// overrides.
pub fn load_node_config(path: impl AsRef<Path>) -> ParrotResult<NodeConfig> {
    let content = std::fs::read_to_string(path)?;
    let mut config = parse_node_config(&content)?;
    apply_overrides(&mut config, |key| std::env::var(key).ok());
    validate(&config)?;
    Ok(config)
}

/// Parse a node config from a YAML string.
pub fn parse_node_config(yaml: &str) -> ParrotResult<NodeConfig> {
    let config: NodeConfig = serde_yaml::from_str(yaml)?;
    Ok(config)
}

/// Overlay values from `lookup` (normally the process environment).
pub fn apply_overrides(config: &mut NodeConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(node) = lookup("PARROT_NODE_ID") {
        config.node_id = NodeId::new(node);
    }
    if let Some(hosts) = lookup("PARROT_ZOOKEEPER_HOSTS") {
        config.zookeeper_hosts = hosts;
    }
    if let Some(brokers) = lookup("PARROT_KAFKA_BROKERS") {
        config.kafka_brokers = brokers;
    }
    if let Some(url) = lookup("PARROT_DEBEZIUM_API_URL") {
        config.debezium_api_url = Some(url);
    }
    if let Some(url) = lookup("PARROT_API_URL") {
        config.parrot_api_url = Some(url);
    }
}

pub fn validate(config: &NodeConfig) -> ParrotResult<()> {
    if config.node_id.as_str().trim().is_empty() {
        return Err(Error::Config("node_id must not be empty".into()));
    }
    if config.route.max_batch_size == 0 {
        return Err(Error::Config("route.max_batch_size must be at least 1".into()));
    }
    if config.lifecycle.start_attempts == 0 {
        return Err(Error::Config("lifecycle.start_attempts must be at least 1".into()));
    }
    if config.cluster.max_missed_heartbeats == 0 {
        return Err(Error::Config("cluster.max_missed_heartbeats must be at least 1".into()));
    }
    Ok(())
}

/// Load one processor definition (YAML or JSON).
pub fn load_processor(path: impl AsRef<Path>) -> ParrotResult<ProcessorDefinition> {
    let content = std::fs::read_to_string(path)?;
    parse_processor(&content)
}

pub fn parse_processor(yaml: &str) -> ParrotResult<ProcessorDefinition> {
    let def: ProcessorDefinition = serde_yaml::from_str(yaml)?;
    def.validate()?;
    Ok(def)
}

/// Load every processor definition in a directory, in file name order.
pub fn load_processors_dir(dir: impl AsRef<Path>) -> ParrotResult<Vec<ProcessorDefinition>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let ext = path.extension().and_then(|e| e.to_str());
        if matches!(ext, Some("yaml") | Some("yml") | Some("json")) {
            paths.push(path);
        }
    }
    paths.sort();
    paths.into_iter().map(load_processor).collect()
}
