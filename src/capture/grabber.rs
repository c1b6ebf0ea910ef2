use std::sync::Arc;

use dashmap::DashMap;

use crate::error::EngineError;
use crate::types::entities::{RawFrame, Shape, SourceKind, SourceUri};

/// Outcome of a single grab.
pub enum Grab {
    Frame(RawFrame),
    /// The source produced nothing this tick (decode gap or end of file).
    Empty,
}

/// An open handle on one decoding source. Implementations wrap the actual
/// decoder; the engine only sequences calls and never inspects payloads.
pub trait FrameGrabber: Send {
    fn native_shape(&self) -> Shape;

    fn native_fps(&self) -> f64;

    /// Pull the next frame. Errors are transient as far as the engine is
    /// concerned; the capture worker absorbs them into its failure counter.
    fn read(&mut self) -> anyhow::Result<Grab>;

    /// Release the underlying device or stream. Must be safe to call before
    /// a subsequent `open` on the same uri (USB devices forbid parallel
    /// opens).
    fn release(&mut self);
}

/// Factory selected by a source config's `handler_name`. Opening may block
/// on device or network I/O.
pub trait GrabberHandler: Send + Sync {
    fn open(&self, uri: &SourceUri, kind: SourceKind) -> Result<Box<dyn FrameGrabber>, EngineError>;
}

pub const HANDLER_VIDEO_CAPTURE: &str = "video_capture";
pub const HANDLER_VIDEO_FILE: &str = "video_file";
pub const HANDLER_SYNTHETIC: &str = "synthetic";

/// Handler catalogue, built once at startup. Selection is a map lookup.
///
/// The engine ships no real decoder: `video_capture` and `video_file` are the
/// conventional names under which the embedding application registers its
/// own grabbers. Only the decoder-free `synthetic` handler is built in.
pub struct GrabberRegistry {
    handlers: DashMap<String, Arc<dyn GrabberHandler>>,
}

impl GrabberRegistry {
    pub fn new() -> Self {
        GrabberRegistry {
            handlers: DashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let registry = GrabberRegistry::new();
        registry.register(HANDLER_SYNTHETIC, Arc::new(SyntheticHandler::default()));
        registry
    }

    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn GrabberHandler>) {
        let name = name.into();
        tracing::debug!(handler = %name, "Registered source handler");
        self.handlers.insert(name, handler);
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<dyn GrabberHandler>, EngineError> {
        self.handlers
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::UnknownHandler(name.to_string()))
    }
}

impl Default for GrabberRegistry {
    fn default() -> Self {
        GrabberRegistry::new()
    }
}

/// Decoder-free handler producing test-pattern frames, so a full pipeline
/// can run without camera hardware or codec dependencies.
pub struct SyntheticHandler {
    pub shape: Shape,
    pub fps: f64,
}

impl Default for SyntheticHandler {
    fn default() -> Self {
        SyntheticHandler {
            shape: Shape {
                width: 640,
                height: 480,
            },
            fps: 24.0,
        }
    }
}

impl GrabberHandler for SyntheticHandler {
    fn open(&self, _uri: &SourceUri, _kind: SourceKind) -> Result<Box<dyn FrameGrabber>, EngineError> {
        Ok(Box::new(SyntheticGrabber {
            shape: self.shape,
            fps: self.fps,
            seq: 0,
        }))
    }
}

struct SyntheticGrabber {
    shape: Shape,
    fps: f64,
    seq: u64,
}

impl FrameGrabber for SyntheticGrabber {
    fn native_shape(&self) -> Shape {
        self.shape
    }

    fn native_fps(&self) -> f64 {
        self.fps
    }

    fn read(&mut self) -> anyhow::Result<Grab> {
        self.seq = self.seq.wrapping_add(1);
        let len = (self.shape.width * self.shape.height) as usize;
        // Single-plane test pattern keyed by the frame sequence number.
        let data = vec![(self.seq & 0xff) as u8; len];
        Ok(Grab::Frame(RawFrame {
            width: self.shape.width,
            height: self.shape.height,
            data: Arc::new(data),
        }))
    }

    fn release(&mut self) {}
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted grabbers shared by the worker, registry, and coordinator
    //! tests. The script drives what each `read` call returns; the handler
    //! counts opens and releases so tests can assert reload behaviour.

    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Clone, Copy)]
    pub enum Step {
        Frame,
        Empty,
        Error,
    }

    pub struct Script {
        steps: Mutex<VecDeque<Step>>,
        /// Returned forever once the scripted steps run out.
        tail: Step,
        pub frames_read: AtomicUsize,
    }

    impl Script {
        pub fn new(steps: Vec<Step>, tail: Step) -> Arc<Self> {
            Arc::new(Script {
                steps: Mutex::new(steps.into()),
                tail,
                frames_read: AtomicUsize::new(0),
            })
        }

        pub fn frames(tail: Step) -> Arc<Self> {
            Script::new(Vec::new(), tail)
        }

        fn next(&self) -> Step {
            self.steps
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(self.tail)
        }
    }

    pub struct ScriptedHandler {
        pub script: Arc<Script>,
        pub shape: Shape,
        pub fps: f64,
        pub opens: AtomicUsize,
        pub releases: Arc<AtomicUsize>,
        /// Number of open calls to fail before succeeding.
        pub fail_opens: AtomicUsize,
        /// Interleaved "open" / "release" events, for asserting reload order.
        pub events: Arc<Mutex<Vec<&'static str>>>,
    }

    impl ScriptedHandler {
        pub fn new(script: Arc<Script>) -> Arc<Self> {
            Arc::new(ScriptedHandler {
                script,
                shape: Shape {
                    width: 16,
                    height: 16,
                },
                fps: 200.0,
                opens: AtomicUsize::new(0),
                releases: Arc::new(AtomicUsize::new(0)),
                fail_opens: AtomicUsize::new(0),
                events: Arc::new(Mutex::new(Vec::new())),
            })
        }

        pub fn failing_first(script: Arc<Script>, failures: usize) -> Arc<Self> {
            let handler = ScriptedHandler::new(script);
            handler.fail_opens.store(failures, Ordering::SeqCst);
            handler
        }
    }

    impl GrabberHandler for ScriptedHandler {
        fn open(
            &self,
            uri: &SourceUri,
            _kind: SourceKind,
        ) -> Result<Box<dyn FrameGrabber>, EngineError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            self.events.lock().unwrap().push("open");
            if self
                .fail_opens
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(EngineError::source_open(uri, "scripted open failure"));
            }
            Ok(Box::new(ScriptedGrabber {
                script: self.script.clone(),
                shape: self.shape,
                fps: self.fps,
                releases: self.releases.clone(),
                events: self.events.clone(),
            }))
        }
    }

    pub struct ScriptedGrabber {
        script: Arc<Script>,
        shape: Shape,
        fps: f64,
        releases: Arc<AtomicUsize>,
        events: Arc<Mutex<Vec<&'static str>>>,
    }

    impl FrameGrabber for ScriptedGrabber {
        fn native_shape(&self) -> Shape {
            self.shape
        }

        fn native_fps(&self) -> f64 {
            self.fps
        }

        fn read(&mut self) -> anyhow::Result<Grab> {
            match self.script.next() {
                Step::Frame => {
                    let n = self.script.frames_read.fetch_add(1, Ordering::SeqCst);
                    Ok(Grab::Frame(RawFrame {
                        width: self.shape.width,
                        height: self.shape.height,
                        data: Arc::new(vec![(n & 0xff) as u8; 16]),
                    }))
                }
                Step::Empty => Ok(Grab::Empty),
                Step::Error => Err(anyhow::anyhow!("scripted decode error")),
            }
        }

        fn release(&mut self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
            self.events.lock().unwrap().push("release");
        }
    }
}
