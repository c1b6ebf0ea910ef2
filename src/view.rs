use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::EngineError;
use crate::registry::SourceRecord;
use crate::store::FrameStore;
use crate::types::entities::{FrameEntry, ImageFrame, Shape};
use crate::types::schema::ViewConfig;

/// Blocking `provide` polls the store at most 50 Hz.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Upper bound on a single poll sleep, per missing frame.
const MAX_POLL_SLEEP_SECS: f64 = 0.1;

/// One consumer's read-only window onto a source's frame store: a transform
/// (resize target, crop zone) plus a rate-limited poll. Holds no worker and
/// never mutates the store.
pub struct ConsumerView {
    source_id: String,
    store: Arc<dyn FrameStore>,
    native_shape: Shape,
    view: ViewConfig,
    poll_interval: Duration,
    batch_size: usize,
    dedupe: bool,
    last_delivered: Mutex<HashSet<String>>,
}

impl ConsumerView {
    /// Build a view over a registered source. The crop zone is checked
    /// against the post-resize frame: the target shape when set, the
    /// source's native shape otherwise.
    pub fn over(
        record: &SourceRecord,
        view: &ViewConfig,
        process_rate: f64,
        batch_size: usize,
        dedupe: bool,
    ) -> Result<Self, EngineError> {
        let native_shape = record
            .native_shape()
            .ok_or_else(|| EngineError::SourceUnavailable(record.source_id.clone()))?;
        ConsumerView::new(
            record.source_id.clone(),
            record.store(),
            native_shape,
            view,
            process_rate,
            batch_size,
            dedupe,
        )
    }

    pub fn new(
        source_id: String,
        store: Arc<dyn FrameStore>,
        native_shape: Shape,
        view: &ViewConfig,
        process_rate: f64,
        batch_size: usize,
        dedupe: bool,
    ) -> Result<Self, EngineError> {
        view.validate()?;
        if let Some(zone) = view.zone {
            let frame = view
                .target_shape
                .map_or(native_shape, |target| target.resolve(native_shape));
            zone.fits_within(frame)?;
        }
        if !(process_rate > 0.0) {
            return Err(EngineError::invalid_config(format!(
                "invalid process rate {process_rate}"
            )));
        }
        if batch_size == 0 {
            return Err(EngineError::invalid_config("batch_size must be >= 1"));
        }
        let poll_interval = Duration::from_secs_f64(1.0 / process_rate).max(MIN_POLL_INTERVAL);
        Ok(ConsumerView {
            source_id,
            store,
            native_shape,
            view: view.clone(),
            poll_interval,
            batch_size,
            dedupe,
            last_delivered: Mutex::new(HashSet::new()),
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Resize factor this consumer applies to native frames.
    pub fn zoom_ratio(&self) -> f64 {
        self.view
            .target_shape
            .map_or(1.0, |target| target.zoom_ratio(self.native_shape))
    }

    /// Pull up to one batch of `n` frames, newest first.
    ///
    /// Non-blocking: all-or-nothing against the current store contents, and
    /// any overlap with the previously delivered batch yields `None` when
    /// deduplicating. Blocking: polls until `n` fresh frames are buffered or
    /// the deadline passes.
    pub async fn provide(&self, n: usize, block: bool, timeout: Duration) -> Option<Vec<ImageFrame>> {
        if n == 0 {
            return None;
        }
        let entries = if block {
            self.poll_fresh(n, timeout).await?
        } else {
            self.take_ready(n)?
        };

        if self.dedupe {
            let ids = entries.iter().map(|e| e.frame_id.clone()).collect();
            *self.last_delivered.lock().unwrap() = ids;
        }
        let zoom_ratio = self.zoom_ratio();
        Some(
            entries
                .into_iter()
                .map(|entry| ImageFrame {
                    source_id: self.source_id.clone(),
                    frame_id: entry.frame_id,
                    payload: entry.payload,
                    zoom_ratio,
                    zone: self.view.zone,
                })
                .collect(),
        )
    }

    fn take_ready(&self, n: usize) -> Option<Vec<FrameEntry>> {
        let entries = self.store.get(n)?;
        if self.dedupe {
            let last = self.last_delivered.lock().unwrap();
            if entries.iter().any(|e| last.contains(&e.frame_id)) {
                return None;
            }
        }
        Some(entries)
    }

    async fn poll_fresh(&self, n: usize, timeout: Duration) -> Option<Vec<FrameEntry>> {
        let deadline = Instant::now() + timeout;
        loop {
            let (_, entries) = self.store.range(n);
            let fresh: Vec<FrameEntry> = if self.dedupe {
                let last = self.last_delivered.lock().unwrap();
                entries
                    .into_iter()
                    .filter(|e| !last.contains(&e.frame_id))
                    .collect()
            } else {
                entries
            };
            if fresh.len() >= n {
                return Some(fresh.into_iter().take(n).collect());
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            // Back off proportionally to how many frames are still missing,
            // capped so a full batch still polls several times a second.
            let per_frame = (self.poll_interval.as_secs_f64() / 3.0).min(MAX_POLL_SLEEP_SECS);
            let sleep = (per_frame * (n - fresh.len()) as f64).min((deadline - now).as_secs_f64());
            tokio::time::sleep(Duration::from_secs_f64(sleep)).await;
        }
    }
}
