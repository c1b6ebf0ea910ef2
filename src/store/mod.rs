pub mod external;
pub mod ring;

use std::sync::Arc;

use crate::error::EngineError;
use crate::types::entities::FrameEntry;

/// Bounded newest-first buffer of recent frames for one source.
///
/// Two backends share this contract: the in-process ring (canonical) and the
/// external list store. The external store is only an eventually-consistent
/// append-trim log with atomic range reads; nothing stronger is assumed.
pub trait FrameStore: Send + Sync {
    /// Prepend `entry`, evicting the oldest entry beyond capacity.
    /// Non-blocking; never fails.
    fn push(&self, entry: FrameEntry);

    /// The newest entry, without removal.
    fn peek(&self) -> Option<FrameEntry>;

    /// The newest `n` entries, newest first, only if at least `n` are
    /// present. `None` means not ready.
    fn get(&self, n: usize) -> Option<Vec<FrameEntry>>;

    /// Current size plus up to `n` newest entries (may be fewer).
    fn range(&self, n: usize) -> (usize, Vec<FrameEntry>);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all contents.
    fn destroy(&self);
}

/// Chooses the frame store backend for new sources. Injected into the source
/// registry; there is no process-wide default.
pub enum StoreProvider {
    InProcess,
    Redis(redis::Client),
}

impl StoreProvider {
    pub fn make(
        &self,
        source_id: &str,
        capacity: usize,
    ) -> Result<Arc<dyn FrameStore>, EngineError> {
        match self {
            StoreProvider::InProcess => Ok(Arc::new(ring::RingFrameStore::new(capacity))),
            StoreProvider::Redis(client) => Ok(Arc::new(external::RedisFrameStore::connect(
                client, source_id, capacity,
            )?)),
        }
    }
}
