use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// What kind of origin a video source is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    IpCamera,
    UsbCamera,
    VideoFile,
    VideoLink,
    ImageLink,
    ImageFile,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceKind::IpCamera => "ip_camera",
            SourceKind::UsbCamera => "usb_camera",
            SourceKind::VideoFile => "video_file",
            SourceKind::VideoLink => "video_link",
            SourceKind::ImageLink => "image_link",
            SourceKind::ImageFile => "image_file",
        };
        f.write_str(name)
    }
}

/// Source address: a device index (USB) or an address string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourceUri {
    Index(u32),
    Addr(String),
}

impl fmt::Display for SourceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceUri::Index(index) => write!(f, "{index}"),
            SourceUri::Addr(addr) => f.write_str(addr),
        }
    }
}

/// Deduplication key for live sources. Equality is structural; USB addresses
/// are canonicalised to device indices so `"0"` and `0` name the same device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceKey {
    pub uri: SourceUri,
    pub kind: SourceKind,
}

impl SourceKey {
    pub fn new(uri: SourceUri, kind: SourceKind) -> Result<Self, EngineError> {
        let uri = match (&uri, kind) {
            (SourceUri::Addr(addr), SourceKind::UsbCamera) => {
                let index = addr.parse::<u32>().map_err(|_| {
                    EngineError::invalid_config(format!(
                        "USB source uri must be a device index, got '{addr}'"
                    ))
                })?;
                SourceUri::Index(index)
            }
            _ => uri,
        };
        Ok(SourceKey { uri, kind })
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.kind, self.uri)
    }
}

/// Frame dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shape {
    pub width: u32,
    pub height: u32,
}

impl Shape {
    pub fn new(width: u32, height: u32) -> Result<Self, EngineError> {
        let shape = Shape { width, height };
        shape.validate()?;
        Ok(shape)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.width == 0 || self.height == 0 {
            return Err(EngineError::invalid_config(format!(
                "invalid frame shape [{}, {}]",
                self.width, self.height
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Rectangular crop, expressed in the post-resize coordinate frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    pub start_x: u32,
    pub start_y: u32,
    pub width: u32,
    pub height: u32,
}

impl Zone {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.width == 0 || self.height == 0 {
            return Err(EngineError::invalid_config(format!(
                "invalid zone size [{}, {}]",
                self.width, self.height
            )));
        }
        Ok(())
    }

    /// Check that the zone lies fully inside a frame of the given shape.
    pub fn fits_within(&self, shape: Shape) -> Result<(), EngineError> {
        self.validate()?;
        if self.start_x + self.width > shape.width || self.start_y + self.height > shape.height {
            return Err(EngineError::invalid_config(format!(
                "zone [{}, {}, {}, {}] exceeds frame {}",
                self.start_x, self.start_y, self.width, self.height, shape
            )));
        }
        Ok(())
    }
}

/// Opaque decoded image payload plus its native dimensions.
#[derive(Clone)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub data: Arc<Vec<u8>>,
}

impl RawFrame {
    pub fn shape(&self) -> Shape {
        Shape {
            width: self.width,
            height: self.height,
        }
    }
}

/// Custom `Debug` impl that skips the payload bytes.
impl fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// One captured frame as stored in a frame buffer.
#[derive(Debug, Clone)]
pub struct FrameEntry {
    pub frame_id: String,
    pub payload: RawFrame,
    pub captured_at: u64,
}

impl FrameEntry {
    /// Stamp a freshly grabbed frame. `frame_id` is unique per source for the
    /// buffer's lifetime.
    pub fn capture(source_id: &str, payload: RawFrame) -> Self {
        let captured_at = monotonic_ns();
        FrameEntry {
            frame_id: format!("{source_id}-{captured_at}"),
            payload,
            captured_at,
        }
    }
}

/// A frame as delivered to one consumer, carrying that consumer's view
/// parameters alongside the payload.
#[derive(Debug, Clone)]
pub struct ImageFrame {
    pub source_id: String,
    pub frame_id: String,
    pub payload: RawFrame,
    pub zoom_ratio: f64,
    pub zone: Option<Zone>,
}

/// Nanoseconds on a strictly increasing process-monotonic clock. Successive
/// calls never return the same value, even on coarse clocks.
pub fn monotonic_ns() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    static LAST: AtomicU64 = AtomicU64::new(0);

    let now = EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64;
    let mut prev = LAST.load(Ordering::Relaxed);
    loop {
        let next = now.max(prev + 1);
        match LAST.compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(observed) => prev = observed,
        }
    }
}
