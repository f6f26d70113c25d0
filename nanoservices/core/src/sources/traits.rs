use async_trait::async_trait;
use parrot_utils::{ChangeStream, ParrotResult, SourceOffset};

use crate::model::SourceConfig;

/// Supplies the change events a processor relays.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// Human-readable name for logging
    fn name(&self) -> &str;

    /// Open the stream for `source`, starting strictly after `after`, or at
    /// the origin when `after` is `None`. Events arrive in source order.
    async fn open(&self, source: &SourceConfig, after: Option<SourceOffset>) -> ParrotResult<ChangeStream>;
}
