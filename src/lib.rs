//! Multi-source video ingestion and fan-out engine.
//!
//! Sources are deduplicated by `(uri, type)` and each is decoded by a single
//! capture worker into a bounded ring of recent frames. Consumer
//! applications attach their own view (resize, crop, rate, batch) onto that
//! shared ring and receive batches through a callback; a source is reclaimed
//! as soon as its last consumer detaches.

pub mod app;
pub mod capture;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod registry;
pub mod store;
pub mod types;
pub mod view;

pub use app::{AppState, FrameProcessor, LogProcessor};
pub use coordinator::{AppHandle, Coordinator, spawn_reconciler};
pub use error::EngineError;
pub use types::schema::AppSpec;
