use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use uuid::Uuid;

use crate::capture::grabber::GrabberRegistry;
use crate::capture::worker::{CaptureWorker, SourceState};
use crate::error::EngineError;
use crate::store::{FrameStore, StoreProvider};
use crate::types::entities::{Shape, SourceKey};
use crate::types::schema::SourceConfig;

/// A live (or winding-down) source held by the registry.
pub struct SourceRecord {
    pub key: SourceKey,
    pub source_id: String,
    pub worker: CaptureWorker,
    pub created_at: DateTime<Utc>,
    refcount: AtomicI64,
}

impl SourceRecord {
    pub fn refcount(&self) -> i64 {
        self.refcount.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SourceState {
        self.worker.state()
    }

    pub fn store(&self) -> Arc<dyn FrameStore> {
        self.worker.store()
    }

    pub fn native_shape(&self) -> Option<Shape> {
        self.worker.native_shape()
    }

    pub fn native_fps(&self) -> Option<f64> {
        self.worker.native_fps()
    }
}

/// Reference-counted catalogue of capture sources, deduplicated by
/// `(uri, type)`.
///
/// Dropping the last reference does not remove a record: it only makes the
/// record reclaimable, and the periodic sweep stops the worker and removes
/// the entry. A burst of release/register on the same key therefore reuses
/// the running worker instead of bouncing the device.
pub struct SourceRegistry {
    sources: DashMap<SourceKey, Arc<SourceRecord>>,
    stores: StoreProvider,
}

impl SourceRegistry {
    pub fn new(stores: StoreProvider) -> Self {
        SourceRegistry {
            sources: DashMap::new(),
            stores,
        }
    }

    /// Get-or-create the record for the config's key and take a reference on
    /// it. The slot is reserved under the map entry lock; grabber I/O
    /// happens outside it, off the async runtime.
    pub async fn register(
        &self,
        cfg: &SourceConfig,
        handlers: &GrabberRegistry,
    ) -> Result<Arc<SourceRecord>, EngineError> {
        cfg.validate()?;
        let key = cfg.key()?;
        let handler = handlers.lookup(&cfg.handler_name)?;

        // Fast path: take a reference on the live record.
        if let Some(existing) = self.sources.get(&key) {
            if !existing.state().is_terminal() {
                existing.refcount.fetch_add(1, Ordering::AcqRel);
                return Ok(existing.value().clone());
            }
        }

        // Build the replacement before touching the entry again; the store
        // may connect out to its backend.
        let source_id = Uuid::now_v7().to_string();
        let store = self.stores.make(&source_id, cfg.frame_queue_size)?;
        let worker = CaptureWorker::new(source_id.clone(), key.clone(), cfg.clone(), store, handler);
        let fresh = Arc::new(SourceRecord {
            key: key.clone(),
            source_id,
            worker,
            created_at: Utc::now(),
            refcount: AtomicI64::new(1),
        });

        let (record, reserved) = match self.sources.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get().clone();
                if current.state().is_terminal() {
                    // A finished record still waiting for the sweep; swap in
                    // the replacement and reap the old worker.
                    let old = occupied.insert(fresh.clone());
                    old.worker.stop();
                    reap(old);
                    (fresh, true)
                } else {
                    // Someone beat us to the slot.
                    current.refcount.fetch_add(1, Ordering::AcqRel);
                    (current, false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh.clone());
                (fresh, true)
            }
        };

        if !reserved {
            return Ok(record);
        }

        let opened = {
            let record = record.clone();
            tokio::task::spawn_blocking(move || record.worker.open_and_start()).await
        };
        match opened {
            Ok(Ok(())) => {
                tracing::info!(source_id = %record.source_id, source = %record.key, "Source registered");
                Ok(record)
            }
            Ok(Err(e)) => {
                self.sources.remove_if(&key, |_, r| Arc::ptr_eq(r, &record));
                Err(e)
            }
            Err(e) => {
                self.sources.remove_if(&key, |_, r| Arc::ptr_eq(r, &record));
                Err(EngineError::Internal(anyhow::anyhow!(
                    "source open task failed: {e}"
                )))
            }
        }
    }

    /// Drop one reference. The record stays in the registry until the sweep
    /// observes it at zero.
    pub fn release(&self, key: &SourceKey) -> i64 {
        let Some(record) = self.sources.get(key) else {
            return 0;
        };
        let remaining = match record.refcount.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |refs| (refs > 0).then(|| refs - 1),
        ) {
            Ok(prev) => prev - 1,
            Err(_) => 0,
        };
        if remaining == 0 {
            tracing::debug!(source = %key, "Source has no consumers, reclaimable at next sweep");
        }
        remaining
    }

    /// Drop every reference on an orphaned source so the sweep can reclaim
    /// it.
    pub fn clear_refs(&self, key: &SourceKey) {
        if let Some(record) = self.sources.get(key) {
            let prior = record.refcount.swap(0, Ordering::AcqRel);
            if prior > 0 {
                tracing::warn!(source = %key, refs = prior, "Dropping stale references on orphaned source");
            }
        }
    }

    pub fn lookup(&self, key: &SourceKey) -> Option<Arc<SourceRecord>> {
        self.sources.get(key).map(|record| record.value().clone())
    }

    pub fn keys(&self) -> Vec<SourceKey> {
        self.sources.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn records(&self) -> Vec<Arc<SourceRecord>> {
        self.sources.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Remove zero-reference records and stop their workers. Returns how
    /// many were reclaimed.
    pub fn sweep(&self) -> usize {
        let reclaimable: Vec<SourceKey> = self
            .sources
            .iter()
            .filter(|entry| entry.value().refcount() <= 0)
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for key in reclaimable {
            // Re-checked under the entry lock; a concurrent register may
            // have revived the record since the snapshot.
            if let Some((_, record)) = self.sources.remove_if(&key, |_, r| r.refcount() <= 0) {
                tracing::info!(source = %key, source_id = %record.source_id, "Reclaiming idle source");
                record.worker.stop();
                reap(record);
                removed += 1;
            }
        }
        removed
    }

    /// Stop every worker and clear the registry.
    pub async fn remove_all(&self) {
        let records: Vec<Arc<SourceRecord>> = self.records();
        self.sources.clear();
        for record in &records {
            record.worker.stop();
        }
        for record in records {
            let _ = tokio::task::spawn_blocking(move || record.worker.join()).await;
        }
    }
}

fn reap(record: Arc<SourceRecord>) {
    tokio::task::spawn_blocking(move || record.worker.join());
}
