use async_trait::async_trait;
use parrot_utils::{ChangeEvent, FieldType, ParrotResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

/// Adapter for one kind of target store.
///
/// The connection-describing methods are pure functions of the dialect's
/// configuration. The I/O methods open and release their own connection on
/// every call and report failures as [`Error::Sink`](parrot_utils::error::Error::Sink).
#[async_trait]
pub trait SinkDialect: Send + Sync {
    /// Short name for logging and metrics
    fn name(&self) -> &str;

    /// Column type for a generic field type. Total: anything unrecognised
    /// gets the dialect's wide text fallback.
    fn map_type(&self, field_type: &FieldType) -> String;

    fn driver_identifier(&self) -> &str;

    fn connection_uri(&self) -> String;

    fn credentials(&self) -> Credentials;

    /// Case-insensitive catalog lookup.
    async fn database_exists(&self, name: &str) -> ParrotResult<bool>;

    /// Issue the store's create DDL. Callers check existence first.
    async fn create_database(&self, name: &str) -> ParrotResult<()>;

    /// Apply a batch in order: inserts and updates as upserts by key, deletes
    /// by key. Returns the number of events applied.
    async fn apply(&self, database: &str, events: &[ChangeEvent]) -> ParrotResult<usize>;
}
