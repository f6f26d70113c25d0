use std::fmt;
use std::sync::Arc;

use parrot_utils::error::Error;
use parrot_utils::ParrotResult;

pub mod connector;
pub mod impala;
pub mod sql;
pub mod sqlite;
pub mod traits;

pub use connector::{SqlConnection, SqlConnector, SqlCursor};
pub use impala::ImpalaDialect;
pub use sqlite::SqliteDialect;
pub use traits::{Credentials, SinkDialect};

use crate::model::DialectConfig;

/// Wrap a failure from a sink's I/O path as a sink error, keeping the
/// deepest message.
pub(crate) fn into_sink_error(context: impl fmt::Display, err: Error) -> Error {
    match err {
        Error::Sink(_) => err,
        other => Error::Sink(format!("{context}: {other}")),
    }
}

/// Builds the dialect a processor definition asks for.
#[derive(Clone, Default)]
pub struct SinkResolver {
    hive: Option<Arc<dyn SqlConnector>>,
}

impl SinkResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Client used for Impala sinks. Without one, Impala sinks fail to resolve.
    pub fn with_hive_connector(mut self, connector: Arc<dyn SqlConnector>) -> Self {
        self.hive = Some(connector);
        self
    }

    pub fn resolve(&self, config: &DialectConfig) -> ParrotResult<Arc<dyn SinkDialect>> {
        match config {
            DialectConfig::Impala { hostname, port, username, password } => {
                let connector = self.hive.clone().ok_or_else(|| {
                    Error::sink("no HiveServer2 client is configured for impala sinks")
                })?;
                Ok(Arc::new(ImpalaDialect::new(
                    hostname.clone(),
                    *port,
                    Credentials { user: username.clone(), password: password.clone() },
                    connector,
                )))
            }
            DialectConfig::Sqlite { root } => Ok(Arc::new(SqliteDialect::new(root.clone()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_sqlite_and_rejects_unwired_impala() {
        let resolver = SinkResolver::new();
        let sqlite = resolver.resolve(&DialectConfig::Sqlite { root: "/tmp/sinks".into() }).unwrap();
        assert_eq!(sqlite.name(), "sqlite");

        let impala = DialectConfig::Impala {
            hostname: "impala.local".into(),
            port: 21050,
            username: "etl".into(),
            password: String::new(),
        };
        let err = resolver.resolve(&impala).err().unwrap();
        assert!(matches!(err, Error::Sink(_)));
    }

    #[test]
    fn transport_failures_become_sink_errors() {
        let err = into_sink_error("connect", Error::Transport("refused".into()));
        assert_eq!(err.to_string(), "Sink Error: connect: Transport Error: refused");
        let kept = into_sink_error("connect", Error::sink("ddl failed"));
        assert_eq!(kept.to_string(), "Sink Error: ddl failed");
    }
}
