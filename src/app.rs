use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::capture::worker::SourceState;
use crate::error::EngineError;
use crate::registry::SourceRecord;
use crate::types::entities::ImageFrame;
use crate::types::schema::AppSpec;
use crate::view::ConsumerView;

/// How long a start attempt waits for its source to come up.
const START_GRACE: Duration = Duration::from_secs(1);

/// Blocking budget for one batch pull.
const PROVIDE_TIMEOUT: Duration = Duration::from_secs(1);

/// The consumer-side callback. Implemented for plain closures.
pub trait FrameProcessor: Send + Sync {
    fn process_frame(&self, frames: &[ImageFrame]) -> anyhow::Result<()>;
}

impl<F> FrameProcessor for F
where
    F: Fn(&[ImageFrame]) -> anyhow::Result<()> + Send + Sync,
{
    fn process_frame(&self, frames: &[ImageFrame]) -> anyhow::Result<()> {
        self(frames)
    }
}

/// Logs every delivered batch; the processor behind CLI-configured apps.
pub struct LogProcessor;

impl FrameProcessor for LogProcessor {
    fn process_frame(&self, frames: &[ImageFrame]) -> anyhow::Result<()> {
        if let Some(frame) = frames.first() {
            tracing::info!(
                source_id = %frame.source_id,
                frame_id = %frame.frame_id,
                batch = frames.len(),
                "Processed frame batch"
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AppState {
    Starting,
    Running,
    Stopped,
    Failed,
}

impl AppState {
    pub fn is_terminal(self) -> bool {
        matches!(self, AppState::Stopped | AppState::Failed)
    }
}

/// State shared between the app task and its observers (handles).
pub struct AppShared {
    pub name: String,
    state: Mutex<AppState>,
    stop: AtomicBool,
}

impl AppShared {
    pub fn state(&self) -> AppState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, next: AppState) {
        let mut state = self.state.lock().unwrap();
        if *state != next {
            tracing::debug!(app = %self.name, from = ?*state, to = ?next, "App state change");
            *state = next;
        }
    }
}

/// Drives one consumer: a tokio task pulling a batch per tick at the app's
/// process rate and handing it to the callback. Callback errors are logged
/// and absorbed unless `fail_on_error` is set; a terminal source ends the
/// worker.
pub struct AppWorker {
    shared: Arc<AppShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AppWorker {
    /// Wait (within a short grace) for the source to be running, then spawn
    /// the consumer loop.
    pub async fn start(
        record: Arc<SourceRecord>,
        view: ConsumerView,
        processor: Arc<dyn FrameProcessor>,
        spec: &AppSpec,
    ) -> Result<AppWorker, EngineError> {
        let deadline = Instant::now() + START_GRACE;
        loop {
            match record.state() {
                SourceState::Running | SourceState::Degraded => break,
                SourceState::New | SourceState::Opening | SourceState::Reloading
                    if Instant::now() < deadline =>
                {
                    tokio::time::sleep(Duration::from_millis(25)).await;
                }
                state => {
                    return Err(EngineError::SourceUnavailable(format!(
                        "{} is {state:?}",
                        record.key
                    )));
                }
            }
        }

        let shared = Arc::new(AppShared {
            name: spec.alias(),
            state: Mutex::new(AppState::Starting),
            stop: AtomicBool::new(false),
        });
        let params = LoopParams {
            process_rate: spec.process_rate(),
            fail_on_error: spec.fail_on_error,
        };
        let handle = tokio::spawn(run(shared.clone(), record, view, processor, params));
        Ok(AppWorker {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn shared(&self) -> Arc<AppShared> {
        self.shared.clone()
    }

    pub fn state(&self) -> AppState {
        self.shared.state()
    }

    pub fn is_alive(&self) -> bool {
        !self.shared.state().is_terminal()
    }

    /// Cooperative stop, observed at the next tick.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Relaxed);
    }

    /// Wait for the task to drain; abort it if the budget runs out.
    pub async fn join(&self, wait: Duration) {
        let handle = self.handle.lock().unwrap().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(wait, &mut handle).await.is_err() {
                tracing::warn!(app = %self.shared.name, "App worker did not drain in time, aborting");
                handle.abort();
            }
        }
    }
}

struct LoopParams {
    process_rate: f64,
    fail_on_error: bool,
}

async fn run(
    shared: Arc<AppShared>,
    record: Arc<SourceRecord>,
    view: ConsumerView,
    processor: Arc<dyn FrameProcessor>,
    params: LoopParams,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs_f64(1.0 / params.process_rate));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    shared.set_state(AppState::Running);
    tracing::info!(app = %shared.name, source_id = %record.source_id, "App worker started");

    while !shared.stop.load(Ordering::Relaxed) {
        ticker.tick().await;
        if shared.stop.load(Ordering::Relaxed) {
            break;
        }
        let source_state = record.state();
        if source_state.is_terminal() {
            tracing::warn!(
                app = %shared.name,
                source_id = %record.source_id,
                state = ?source_state,
                "Source lost"
            );
            shared.set_state(match source_state {
                SourceState::Stopped => AppState::Stopped,
                _ => AppState::Failed,
            });
            return;
        }

        let Some(frames) = view.provide(view.batch_size(), true, PROVIDE_TIMEOUT).await else {
            continue;
        };
        if let Err(e) = processor.process_frame(&frames) {
            tracing::error!(app = %shared.name, error = %e, "Frame callback failed");
            if params.fail_on_error {
                shared.set_state(AppState::Failed);
                return;
            }
        }
    }

    shared.set_state(AppState::Stopped);
    tracing::info!(app = %shared.name, "App worker stopped");
}
