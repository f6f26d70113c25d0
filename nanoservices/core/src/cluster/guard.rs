use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parrot_utils::error::Error;
use parrot_utils::ParrotResult;

/// Epoch sentinel meaning "no longer owned by this node".
const REVOKED: u64 = 0;

/// Fences a route engine to the ownership epoch it was started under.
///
/// The lifecycle worker holds one clone and the engine another. When the
/// worker learns its assignment moved it calls [`revoke`](Self::revoke), and
/// the engine's next [`check`](Self::check) fails before anything is written.
#[derive(Debug, Clone)]
pub struct OwnershipGuard {
    processor: Arc<str>,
    expected: u64,
    current: Arc<AtomicU64>,
}

impl OwnershipGuard {
    pub fn new(processor: &str, epoch: u64) -> Self {
        Self {
            processor: Arc::from(processor),
            expected: epoch,
            current: Arc::new(AtomicU64::new(epoch)),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.expected
    }

    /// Record the epoch of the latest assignment seen for this processor.
    pub fn observe(&self, epoch: u64) {
        self.current.store(epoch, Ordering::Release);
    }

    pub fn revoke(&self) {
        self.observe(REVOKED);
    }

    pub fn check(&self) -> ParrotResult<()> {
        let actual = self.current.load(Ordering::Acquire);
        if actual == self.expected {
            Ok(())
        } else {
            Err(Error::Fenced {
                processor: self.processor.to_string(),
                expected: self.expected,
                actual,
            })
        }
    }
}
