use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use parrot_utils::error::Error;
use parrot_utils::ParrotResult;
use serde::{Deserialize, Serialize};

use super::cluster::NodeId;

/// Operator-declared target state of a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DesiredState {
    Absent,
    Running,
    #[default]
    Stopped,
}

impl DesiredState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DesiredState::Absent => "ABSENT",
            DesiredState::Running => "RUNNING",
            DesiredState::Stopped => "STOPPED",
        }
    }

    pub fn parse(value: &str) -> ParrotResult<Self> {
        match value {
            "ABSENT" => Ok(DesiredState::Absent),
            "RUNNING" => Ok(DesiredState::Running),
            "STOPPED" => Ok(DesiredState::Stopped),
            other => Err(Error::Config(format!("unknown desired state '{other}'"))),
        }
    }
}

impl fmt::Display for DesiredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a processor reads its change events from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub topic: String,
    /// Passed through to the capture connector untouched.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// Target store selection plus its connection parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DialectConfig {
    Impala {
        hostname: String,
        #[serde(default = "default_impala_port")]
        port: u16,
        #[serde(default)]
        username: String,
        #[serde(default)]
        password: String,
    },
    Sqlite {
        root: PathBuf,
    },
}

fn default_impala_port() -> u16 {
    21050
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkConfig {
    pub database: String,
    pub dialect: DialectConfig,
}

/// A configured CDC pipeline. The id never changes once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorDefinition {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    pub source: SourceConfig,
    pub sink: SinkConfig,
    #[serde(default)]
    pub desired_state: DesiredState,
    /// Bumped by every restart command; workers compare it against the
    /// generation they started with.
    #[serde(default)]
    pub restart_generation: u64,
}

impl ProcessorDefinition {
    pub fn validate(&self) -> ParrotResult<()> {
        if self.id.trim().is_empty() {
            return Err(Error::precondition("processor id must not be empty"));
        }
        if !self.id.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')) {
            return Err(Error::precondition(format!(
                "processor id '{}' may only contain ASCII letters, digits, '.', '_' and '-'",
                self.id
            )));
        }
        if self.source.topic.trim().is_empty() {
            return Err(Error::precondition(format!(
                "processor '{}' has no source topic",
                self.id
            )));
        }
        if self.sink.database.trim().is_empty() {
            return Err(Error::precondition(format!(
                "processor '{}' has no sink database",
                self.id
            )));
        }
        Ok(())
    }
}

/// Lifecycle of a processor on the node that owns it.
///
/// `CREATED -> STARTING -> RUNNING -> STOPPING -> STOPPED`, with `ERROR`
/// reachable from `STARTING` and `RUNNING`. A restart is `STOPPING` followed
/// by `STARTING` from whatever state the processor is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LifecycleState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl LifecycleState {
    pub fn can_transition_to(&self, to: LifecycleState) -> bool {
        use LifecycleState::*;
        match (self, to) {
            (Stopping, Stopping) => false,
            (_, Stopping) => true,
            (Created | Stopped | Stopping, Starting) => true,
            (Starting, Running) => true,
            (Starting | Running, Error) => true,
            (Stopping, Stopped) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Created => "CREATED",
            LifecycleState::Starting => "STARTING",
            LifecycleState::Running => "RUNNING",
            LifecycleState::Stopping => "STOPPING",
            LifecycleState::Stopped => "STOPPED",
            LifecycleState::Error => "ERROR",
        }
    }

    pub fn parse(value: &str) -> ParrotResult<Self> {
        match value {
            "CREATED" => Ok(LifecycleState::Created),
            "STARTING" => Ok(LifecycleState::Starting),
            "RUNNING" => Ok(LifecycleState::Running),
            "STOPPING" => Ok(LifecycleState::Stopping),
            "STOPPED" => Ok(LifecycleState::Stopped),
            "ERROR" => Ok(LifecycleState::Error),
            other => Err(Error::Config(format!("unknown lifecycle state '{other}'"))),
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a node last reported about a processor it owns (or owned).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorRuntimeStatus {
    pub processor_id: String,
    pub node_id: NodeId,
    pub state: LifecycleState,
    pub last_error: Option<String>,
    pub generation: u64,
    pub updated_at_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleState::{Created, Running, Starting, Stopped, Stopping};

    #[test]
    fn forward_path_is_allowed() {
        assert!(Created.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(Stopped.can_transition_to(Starting));
    }

    #[test]
    fn error_only_from_starting_or_running() {
        assert!(Starting.can_transition_to(LifecycleState::Error));
        assert!(Running.can_transition_to(LifecycleState::Error));
        assert!(!Created.can_transition_to(LifecycleState::Error));
        assert!(!Stopped.can_transition_to(LifecycleState::Error));
    }

    #[test]
    fn error_leaves_only_through_restart() {
        assert!(LifecycleState::Error.can_transition_to(Stopping));
        assert!(!LifecycleState::Error.can_transition_to(Starting));
        assert!(!LifecycleState::Error.can_transition_to(Running));
        assert!(Stopping.can_transition_to(Starting));
    }

    #[test]
    fn no_shortcuts() {
        assert!(!Created.can_transition_to(Running));
        assert!(!Running.can_transition_to(Stopped));
        assert!(!Stopping.can_transition_to(Stopping));
        assert!(!Running.can_transition_to(Starting));
    }

    #[test]
    fn definition_parses_from_yaml_with_defaults() {
        let yaml = r#"
id: inventory
source:
  topic: dbserver1.inventory.customers
sink:
  database: inventory
  dialect:
    type: impala
    hostname: impala.local
"#;
        let def: ProcessorDefinition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(def.desired_state, DesiredState::Stopped);
        assert_eq!(def.restart_generation, 0);
        match def.sink.dialect {
            DialectConfig::Impala { port, ref username, .. } => {
                assert_eq!(port, 21050);
                assert!(username.is_empty());
            }
            other => panic!("unexpected dialect {other:?}"),
        }
        def.validate().unwrap();
    }

    #[test]
    fn validate_rejects_blank_id() {
        let def = ProcessorDefinition {
            id: " ".into(),
            description: None,
            source: SourceConfig { topic: "t".into(), properties: BTreeMap::new() },
            sink: SinkConfig {
                database: "db".into(),
                dialect: DialectConfig::Sqlite { root: "/tmp".into() },
            },
            desired_state: DesiredState::Running,
            restart_generation: 0,
        };
        assert!(matches!(def.validate(), Err(Error::Precondition(_))));
    }

    #[test]
    fn validate_keeps_ids_to_a_single_url_segment() {
        let mut def: ProcessorDefinition = serde_yaml::from_str(
            "id: x\nsource: {topic: t}\nsink: {database: db, dialect: {type: sqlite, root: /tmp}}\n",
        )
        .unwrap();
        for ok in ["orders", "sales.orders-2024_v1"] {
            def.id = ok.into();
            def.validate().unwrap();
        }
        for bad in ["sales orders", "bad/id", "orders%20", "naïve", "a?b"] {
            def.id = bad.into();
            assert!(matches!(def.validate(), Err(Error::Precondition(_))), "{bad} accepted");
        }
    }
}
