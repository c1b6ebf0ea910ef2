use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use uuid::Uuid;

use crate::app::{AppShared, AppState, AppWorker, FrameProcessor};
use crate::capture::grabber::GrabberRegistry;
use crate::capture::worker::SourceState;
use crate::error::EngineError;
use crate::registry::SourceRegistry;
use crate::store::StoreProvider;
use crate::types::entities::SourceKey;
use crate::types::schema::AppSpec;
use crate::view::ConsumerView;

/// App join budget during shutdown.
const JOIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Claim ticket for a running application. Carries no back-pointers; the
/// coordinator's index maps its id to the actual worker.
#[derive(Clone)]
pub struct AppHandle {
    pub id: Uuid,
    pub key: SourceKey,
    shared: Arc<AppShared>,
}

impl AppHandle {
    pub fn state(&self) -> AppState {
        self.shared.state()
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }
}

struct AppEntry {
    key: SourceKey,
    worker: AppWorker,
    created_at: DateTime<Utc>,
}

/// Top-level façade: wires consumer applications to shared capture sources
/// and garbage-collects sources nobody is watching anymore.
pub struct Coordinator {
    registry: SourceRegistry,
    handlers: GrabberRegistry,
    apps: DashMap<Uuid, AppEntry>,
    /// Serializes attach/detach against the reconciliation pass, so a source
    /// mid-attach can never be mistaken for an orphan.
    gate: tokio::sync::Mutex<()>,
}

impl Coordinator {
    pub fn new(handlers: GrabberRegistry, stores: StoreProvider) -> Arc<Self> {
        Arc::new(Coordinator {
            registry: SourceRegistry::new(stores),
            handlers,
            apps: DashMap::new(),
            gate: tokio::sync::Mutex::new(()),
        })
    }

    /// Attach one application: register (or reuse) its source, build the
    /// consumer view, start the app worker, index the handle.
    pub async fn add(
        &self,
        spec: AppSpec,
        processor: Arc<dyn FrameProcessor>,
    ) -> Result<AppHandle, EngineError> {
        spec.validate()?;
        let name = spec.alias();
        let _gate = self.gate.lock().await;

        let record = self.registry.register(&spec.source, &self.handlers).await?;
        let view = match ConsumerView::over(
            &record,
            &spec.view,
            spec.process_rate(),
            spec.batch_size,
            spec.dedupe,
        ) {
            Ok(view) => view,
            Err(e) => {
                self.registry.release(&record.key);
                return Err(e);
            }
        };
        let worker = match AppWorker::start(record.clone(), view, processor, &spec).await {
            Ok(worker) => worker,
            Err(e) => {
                self.registry.release(&record.key);
                return Err(e);
            }
        };

        let id = Uuid::now_v7();
        let handle = AppHandle {
            id,
            key: record.key.clone(),
            shared: worker.shared(),
        };
        self.apps.insert(
            id,
            AppEntry {
                key: record.key.clone(),
                worker,
                created_at: Utc::now(),
            },
        );
        tracing::info!(app = %name, id = %id, source_id = %record.source_id, "Application added");
        Ok(handle)
    }

    /// Detach one application. Its source keeps running until the
    /// reconciliation sweep observes that nobody is left.
    pub async fn remove(&self, handle: &AppHandle) {
        let _gate = self.gate.lock().await;
        if let Some((_, entry)) = self.apps.remove(&handle.id) {
            entry.worker.stop();
            self.registry.release(&entry.key);
            tracing::info!(app = %handle.name(), id = %handle.id, "Application removed");
        }
    }

    pub fn n_sources(&self) -> usize {
        self.registry.len()
    }

    pub fn n_apps(&self) -> usize {
        self.apps.len()
    }

    pub fn all_sources_failed(&self) -> bool {
        let records = self.registry.records();
        !records.is_empty()
            && records
                .iter()
                .all(|record| record.state() == SourceState::Failed)
    }

    /// One garbage-collection pass: drop finished app workers from the
    /// index, strip references from sources no indexed app is using, and
    /// sweep idle sources out of the registry.
    pub async fn reconcile(&self) {
        let _gate = self.gate.lock().await;

        self.apps.retain(|id, entry| {
            let alive = entry.worker.is_alive();
            if !alive {
                tracing::info!(id = %id, source = %entry.key, "Dropping finished app from dispatch index");
            }
            alive
        });

        let live: HashSet<SourceKey> = self
            .apps
            .iter()
            .map(|entry| entry.value().key.clone())
            .collect();
        for key in self.registry.keys() {
            if !live.contains(&key) {
                self.registry.clear_refs(&key);
            }
        }
        self.registry.sweep();
    }

    /// Stop every app worker, then every source.
    pub async fn stop(&self) {
        let _gate = self.gate.lock().await;
        let ids: Vec<Uuid> = self.apps.iter().map(|entry| *entry.key()).collect();
        for id in &ids {
            if let Some(entry) = self.apps.get(id) {
                entry.worker.stop();
            }
        }
        for id in ids {
            if let Some((_, entry)) = self.apps.remove(&id) {
                entry.worker.join(JOIN_TIMEOUT).await;
            }
        }
        self.registry.remove_all().await;
        tracing::info!("Coordinator stopped");
    }

    /// Serializable snapshot of everything the coordinator is running.
    pub fn describe(&self) -> EngineSnapshot {
        let sources = self
            .registry
            .records()
            .into_iter()
            .map(|record| SourceSnapshot {
                source_id: record.source_id.clone(),
                source: record.key.to_string(),
                state: record.state(),
                refcount: record.refcount(),
                buffered: record.store().len(),
                native_fps: record.native_fps(),
                created_at: record.created_at,
            })
            .collect();
        let apps = self
            .apps
            .iter()
            .map(|entry| AppSnapshot {
                id: *entry.key(),
                name: entry.value().worker.shared().name.clone(),
                source: entry.value().key.to_string(),
                state: entry.value().worker.state(),
                created_at: entry.value().created_at,
            })
            .collect();
        EngineSnapshot { sources, apps }
    }
}

#[derive(Serialize)]
pub struct EngineSnapshot {
    pub sources: Vec<SourceSnapshot>,
    pub apps: Vec<AppSnapshot>,
}

#[derive(Serialize)]
pub struct SourceSnapshot {
    pub source_id: String,
    pub source: String,
    pub state: SourceState,
    pub refcount: i64,
    pub buffered: usize,
    pub native_fps: Option<f64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize)]
pub struct AppSnapshot {
    pub id: Uuid,
    pub name: String,
    pub source: String,
    pub state: AppState,
    pub created_at: DateTime<Utc>,
}

/// Spawn the periodic garbage-collection pass.
/// Runs until the engine shuts down.
pub fn spawn_reconciler(
    coordinator: Arc<Coordinator>,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            coordinator.reconcile().await;
        }
    })
}
