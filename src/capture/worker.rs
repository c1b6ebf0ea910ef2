use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Instant;

use serde::Serialize;

use crate::capture::grabber::{FrameGrabber, Grab, GrabberHandler};
use crate::error::EngineError;
use crate::store::FrameStore;
use crate::types::entities::{FrameEntry, Shape, SourceKey, SourceKind, monotonic_ns};
use crate::types::schema::SourceConfig;

/// Consecutive failed grabs tolerated before the source is reloaded.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 100;

/// Reload attempts before the worker gives up for good.
pub const MAX_RELOAD_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    New,
    Opening,
    Running,
    Degraded,
    Reloading,
    Stopping,
    Stopped,
    Failed,
}

impl SourceState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SourceState::Stopped | SourceState::Failed)
    }
}

/// State shared between the capture thread and its observers.
struct CaptureShared {
    source_id: String,
    key: SourceKey,
    cfg: SourceConfig,
    store: Arc<dyn FrameStore>,
    handler: Arc<dyn GrabberHandler>,
    state: Mutex<SourceState>,
    stop: AtomicBool,
    failures: AtomicU32,
    native: OnceLock<(Shape, f64)>,
    grabber: Mutex<Option<Box<dyn FrameGrabber>>>,
    last_push_ns: AtomicU64,
}

impl CaptureShared {
    fn state(&self) -> SourceState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, next: SourceState) {
        let mut state = self.state.lock().unwrap();
        if *state != next {
            tracing::debug!(source_id = %self.source_id, from = ?*state, to = ?next, "Source state change");
            *state = next;
        }
    }
}

/// Owns one source: a dedicated thread looping grab -> push into the shared
/// frame store, with failure counting and reload on persistent trouble.
/// Grabber I/O is blocking, so the loop lives on an OS thread rather than an
/// async task; observers talk to it through atomics and the state mutex.
pub struct CaptureWorker {
    shared: Arc<CaptureShared>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl CaptureWorker {
    pub fn new(
        source_id: String,
        key: SourceKey,
        cfg: SourceConfig,
        store: Arc<dyn FrameStore>,
        handler: Arc<dyn GrabberHandler>,
    ) -> Self {
        CaptureWorker {
            shared: Arc::new(CaptureShared {
                source_id,
                key,
                cfg,
                store,
                handler,
                state: Mutex::new(SourceState::New),
                stop: AtomicBool::new(false),
                failures: AtomicU32::new(0),
                native: OnceLock::new(),
                grabber: Mutex::new(None),
                last_push_ns: AtomicU64::new(0),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Open the source and start the capture thread. Opening happens on the
    /// caller's thread so first-attempt failures surface synchronously.
    pub fn open_and_start(&self) -> Result<(), EngineError> {
        let shared = &self.shared;
        shared.set_state(SourceState::Opening);
        let grabber = match shared.handler.open(&shared.key.uri, shared.key.kind) {
            Ok(grabber) => grabber,
            Err(e) => {
                shared.set_state(SourceState::Failed);
                return Err(e);
            }
        };
        let shape = grabber.native_shape();
        let fps = grabber.native_fps();
        let _ = shared.native.set((shape, fps));
        tracing::info!(
            source_id = %shared.source_id,
            source = %shared.key,
            native_shape = %shape,
            native_fps = fps,
            "Source opened"
        );
        *shared.grabber.lock().unwrap() = Some(grabber);
        shared.set_state(SourceState::Running);

        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name(format!("capture-{}", self.shared.source_id))
            .spawn(move || run(shared))
            .map_err(|e| EngineError::Internal(e.into()))?;
        *self.handle.lock().unwrap() = Some(handle);
        Ok(())
    }

    pub fn state(&self) -> SourceState {
        self.shared.state()
    }

    pub fn failures(&self) -> u32 {
        self.shared.failures.load(Ordering::Relaxed)
    }

    pub fn native_shape(&self) -> Option<Shape> {
        self.shared.native.get().map(|(shape, _)| *shape)
    }

    pub fn native_fps(&self) -> Option<f64> {
        self.shared.native.get().map(|(_, fps)| *fps)
    }

    pub fn store(&self) -> Arc<dyn FrameStore> {
        self.shared.store.clone()
    }

    /// Monotonic timestamp of the last successful push, if any.
    pub fn last_push_ns(&self) -> Option<u64> {
        match self.shared.last_push_ns.load(Ordering::Relaxed) {
            0 => None,
            ns => Some(ns),
        }
    }

    /// Ask the capture thread to wind down. Observed at the next tick.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Relaxed);
    }

    /// Wait for the capture thread to exit. Blocking; callers on the async
    /// runtime go through `spawn_blocking`.
    pub fn join(&self) {
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

fn run(shared: Arc<CaptureShared>) {
    let interval = shared.cfg.frame_interval();
    tracing::info!(source_id = %shared.source_id, source = %shared.key, "Capture worker started");

    while !shared.stop.load(Ordering::Relaxed) {
        let tick = Instant::now();
        let grab = {
            let mut slot = shared.grabber.lock().unwrap();
            match slot.as_mut() {
                Some(grabber) => grabber.read(),
                None => break,
            }
        };
        match grab {
            Ok(Grab::Frame(frame)) => {
                shared.failures.store(0, Ordering::Relaxed);
                if shared.state() == SourceState::Degraded {
                    shared.set_state(SourceState::Running);
                }
                let entry = FrameEntry::capture(&shared.source_id, frame);
                shared.store.push(entry);
                shared.last_push_ns.store(monotonic_ns(), Ordering::Relaxed);
            }
            Ok(Grab::Empty) => {
                if shared.key.kind == SourceKind::VideoFile && !shared.cfg.endless {
                    tracing::info!(source_id = %shared.source_id, "Video file exhausted");
                    shared.set_state(SourceState::Stopping);
                    break;
                }
                if !note_failure(&shared, None) {
                    break;
                }
            }
            Err(e) => {
                if !note_failure(&shared, Some(e)) {
                    break;
                }
            }
        }
        let elapsed = tick.elapsed();
        if elapsed < interval {
            // A grab that returned immediately still pays the interval, so
            // the loop honours the configured capture cadence.
            thread::sleep(interval - elapsed);
        }
    }

    finish(&shared);
}

/// Count one failed grab; reload the source once the streak crosses the
/// threshold. Returns false when the worker should exit.
fn note_failure(shared: &Arc<CaptureShared>, error: Option<anyhow::Error>) -> bool {
    let failures = shared.failures.fetch_add(1, Ordering::Relaxed) + 1;
    if let Some(e) = error {
        tracing::warn!(source_id = %shared.source_id, failures, error = %e, "Frame read failed");
    } else {
        tracing::debug!(source_id = %shared.source_id, failures, "Read no frame");
    }
    if shared.state() == SourceState::Running {
        shared.set_state(SourceState::Degraded);
    }
    if failures >= MAX_CONSECUTIVE_FAILURES {
        return reload_source(shared);
    }
    true
}

/// Replace the grabber handle after too many consecutive failures. USB
/// devices forbid parallel opens, so they release the old handle first;
/// everything else opens the replacement before letting the old one go.
fn reload_source(shared: &Arc<CaptureShared>) -> bool {
    shared.set_state(SourceState::Reloading);
    tracing::warn!(
        source_id = %shared.source_id,
        source = %shared.key,
        "Too many consecutive read failures, reloading source"
    );
    for attempt in 1..=MAX_RELOAD_ATTEMPTS {
        if shared.stop.load(Ordering::Relaxed) {
            return false;
        }
        match reload_once(shared) {
            Ok(()) => {
                shared.failures.store(0, Ordering::Relaxed);
                shared.set_state(SourceState::Running);
                tracing::info!(source_id = %shared.source_id, attempt, "Source reloaded");
                return true;
            }
            Err(e) => {
                tracing::warn!(source_id = %shared.source_id, attempt, error = %e, "Source reload failed");
            }
        }
    }
    tracing::error!(source_id = %shared.source_id, source = %shared.key, "Source lost after repeated reloads");
    shared.set_state(SourceState::Failed);
    false
}

fn reload_once(shared: &Arc<CaptureShared>) -> Result<(), EngineError> {
    let mut slot = shared.grabber.lock().unwrap();
    if shared.key.kind == SourceKind::UsbCamera {
        if let Some(mut old) = slot.take() {
            old.release();
        }
        *slot = Some(shared.handler.open(&shared.key.uri, shared.key.kind)?);
    } else {
        let fresh = shared.handler.open(&shared.key.uri, shared.key.kind)?;
        if let Some(mut old) = slot.replace(fresh) {
            old.release();
        }
    }
    Ok(())
}

fn finish(shared: &Arc<CaptureShared>) {
    let failed = shared.state() == SourceState::Failed;
    if !failed {
        shared.set_state(SourceState::Stopping);
    }
    if let Some(mut grabber) = shared.grabber.lock().unwrap().take() {
        grabber.release();
    }
    shared.store.destroy();
    if !failed {
        shared.set_state(SourceState::Stopped);
    }
    tracing::info!(source_id = %shared.source_id, source = %shared.key, "Capture worker stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::capture::grabber::testing::{Script, ScriptedHandler, Step};
    use crate::store::ring::RingFrameStore;
    use crate::types::entities::SourceUri;

    fn make_cfg(kind: SourceKind, endless: bool, fps: f64) -> SourceConfig {
        let uri = match kind {
            SourceKind::UsbCamera => SourceUri::Index(0),
            _ => SourceUri::Addr("test://src".into()),
        };
        SourceConfig {
            source_uri: uri,
            source_type: kind,
            handler_name: "scripted".into(),
            endless,
            frame_queue_size: 24,
            native_fps: fps,
            name: None,
            description: None,
        }
    }

    fn make_worker(handler: Arc<ScriptedHandler>, cfg: SourceConfig) -> CaptureWorker {
        let key = cfg.key().unwrap();
        let store = Arc::new(RingFrameStore::new(cfg.frame_queue_size));
        CaptureWorker::new("test-src".into(), key, cfg, store, handler)
    }

    fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        check()
    }

    #[test]
    fn test_open_failure_is_terminal() {
        let script = Script::frames(Step::Frame);
        let handler = ScriptedHandler::failing_first(script, 1);
        let worker = make_worker(handler, make_cfg(SourceKind::IpCamera, false, 100.0));
        let result = worker.open_and_start();
        assert!(matches!(result, Err(EngineError::SourceOpen { .. })));
        assert_eq!(worker.state(), SourceState::Failed);
    }

    #[test]
    fn test_frames_flow_until_stop() {
        let script = Script::frames(Step::Frame);
        let handler = ScriptedHandler::new(script);
        let worker = make_worker(handler.clone(), make_cfg(SourceKind::IpCamera, false, 200.0));
        worker.open_and_start().unwrap();
        assert_eq!(worker.state(), SourceState::Running);
        assert_eq!(worker.native_shape().unwrap().width, 16);

        let store = worker.store();
        assert!(wait_until(Duration::from_secs(2), || store.len() >= 3));
        assert!(worker.last_push_ns().is_some());

        worker.stop();
        worker.join();
        assert_eq!(worker.state(), SourceState::Stopped);
        // Stop releases the grabber and destroys the buffer.
        assert_eq!(handler.releases.load(Ordering::SeqCst), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_video_file_stops_at_eof() {
        let script = Script::new(vec![Step::Frame, Step::Frame, Step::Frame], Step::Empty);
        let handler = ScriptedHandler::new(script.clone());
        let worker = make_worker(handler, make_cfg(SourceKind::VideoFile, false, 500.0));
        worker.open_and_start().unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            worker.state() == SourceState::Stopped
        }));
        assert_eq!(script.frames_read.load(Ordering::SeqCst), 3);
        worker.join();
    }

    #[test]
    fn test_endless_video_file_rides_through_gaps() {
        let script = Script::new(vec![Step::Frame, Step::Empty, Step::Empty], Step::Frame);
        let handler = ScriptedHandler::new(script);
        let worker = make_worker(handler, make_cfg(SourceKind::VideoFile, true, 500.0));
        worker.open_and_start().unwrap();

        let store = worker.store();
        assert!(wait_until(Duration::from_secs(2), || store.len() >= 4));
        // Streak broken by the next good frame.
        assert_eq!(worker.failures(), 0);
        assert_eq!(worker.state(), SourceState::Running);
        worker.stop();
        worker.join();
    }

    #[test]
    fn test_transient_errors_count_toward_the_streak() {
        let script = Script::new(vec![Step::Frame, Step::Error, Step::Error], Step::Empty);
        let handler = ScriptedHandler::new(script);
        let worker = make_worker(handler.clone(), make_cfg(SourceKind::IpCamera, false, 100.0));
        worker.open_and_start().unwrap();

        assert!(wait_until(Duration::from_secs(2), || worker.failures() >= 3));
        assert_eq!(worker.state(), SourceState::Degraded);
        // No reload below the threshold.
        assert_eq!(handler.opens.load(Ordering::SeqCst), 1);
        worker.stop();
        worker.join();
    }

    #[test]
    fn test_reload_after_failure_threshold() {
        let gaps = vec![Step::Empty; MAX_CONSECUTIVE_FAILURES as usize];
        let script = Script::new(gaps, Step::Frame);
        let handler = ScriptedHandler::new(script);
        let worker = make_worker(handler.clone(), make_cfg(SourceKind::IpCamera, false, 1000.0));
        worker.open_and_start().unwrap();

        let store = worker.store();
        // Exactly one reload, then frames resume.
        assert!(wait_until(Duration::from_secs(5), || store.len() >= 1));
        assert_eq!(handler.opens.load(Ordering::SeqCst), 2);
        assert_eq!(handler.releases.load(Ordering::SeqCst), 1);
        assert_eq!(worker.state(), SourceState::Running);
        assert_eq!(worker.failures(), 0);

        // IP sources open the replacement before releasing the old handle.
        let events = handler.events.lock().unwrap().clone();
        assert_eq!(events, vec!["open", "open", "release"]);

        worker.stop();
        worker.join();
    }

    #[test]
    fn test_usb_reload_releases_before_reopening() {
        let gaps = vec![Step::Empty; MAX_CONSECUTIVE_FAILURES as usize];
        let script = Script::new(gaps, Step::Frame);
        let handler = ScriptedHandler::new(script);
        let worker = make_worker(handler.clone(), make_cfg(SourceKind::UsbCamera, false, 1000.0));
        worker.open_and_start().unwrap();

        let store = worker.store();
        assert!(wait_until(Duration::from_secs(5), || store.len() >= 1));
        let events = handler.events.lock().unwrap().clone();
        assert_eq!(events, vec!["open", "release", "open"]);

        worker.stop();
        worker.join();
    }

    #[test]
    fn test_reload_exhaustion_fails_the_worker() {
        let gaps = vec![Step::Empty; MAX_CONSECUTIVE_FAILURES as usize];
        let script = Script::new(gaps, Step::Frame);
        let handler = ScriptedHandler::new(script);
        let worker = make_worker(handler.clone(), make_cfg(SourceKind::IpCamera, false, 1000.0));
        worker.open_and_start().unwrap();
        // Every reload attempt fails from here on.
        handler
            .fail_opens
            .store(MAX_RELOAD_ATTEMPTS as usize, Ordering::SeqCst);

        assert!(wait_until(Duration::from_secs(5), || {
            worker.state() == SourceState::Failed
        }));
        assert_eq!(
            handler.opens.load(Ordering::SeqCst),
            1 + MAX_RELOAD_ATTEMPTS as usize
        );
        worker.join();
        assert_eq!(worker.state(), SourceState::Failed);
    }
}
