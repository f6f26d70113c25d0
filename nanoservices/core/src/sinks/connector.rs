//! Minimal client contract for SQL-over-the-wire stores such as
//! HiveServer2. A concrete client library implements these traits; the
//! dialects only ever talk to them.

use async_trait::async_trait;
use parrot_utils::ParrotResult;

use crate::sinks::traits::Credentials;

#[async_trait]
pub trait SqlConnector: Send + Sync {
    async fn connect(
        &self,
        uri: &str,
        credentials: &Credentials,
    ) -> ParrotResult<Box<dyn SqlConnection>>;
}

#[async_trait]
pub trait SqlConnection: Send {
    /// Run a statement that returns no rows.
    async fn execute(&mut self, sql: &str) -> ParrotResult<u64>;

    async fn query(&mut self, sql: &str) -> ParrotResult<Box<dyn SqlCursor>>;

    async fn close(&mut self) -> ParrotResult<()>;
}

#[async_trait]
pub trait SqlCursor: Send {
    /// Next row as text columns; `None` once exhausted.
    async fn next_row(&mut self) -> ParrotResult<Option<Vec<Option<String>>>>;

    async fn close(&mut self) -> ParrotResult<()>;
}
