use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::types::entities::{Shape, SourceKey, SourceKind, SourceUri, Zone};

fn default_handler() -> String {
    crate::capture::grabber::HANDLER_VIDEO_CAPTURE.to_string()
}

fn default_frame_queue_size() -> usize {
    24
}

fn default_native_fps() -> f64 {
    24.0
}

fn default_batch_size() -> usize {
    1
}

fn default_dedupe() -> bool {
    true
}

/// Everything needed to open and run one capture source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_uri: SourceUri,
    pub source_type: SourceKind,
    /// Selects the grabber implementation from the handler registry.
    #[serde(default = "default_handler")]
    pub handler_name: String,
    /// Video files loop on EOF instead of stopping.
    #[serde(default)]
    pub endless: bool,
    #[serde(default = "default_frame_queue_size")]
    pub frame_queue_size: usize,
    /// Target capture cadence, advisory for the grabber.
    #[serde(default = "default_native_fps")]
    pub native_fps: f64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl SourceConfig {
    pub fn key(&self) -> Result<SourceKey, EngineError> {
        SourceKey::new(self.source_uri.clone(), self.source_type)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        self.key()?;
        if self.handler_name.is_empty() {
            return Err(EngineError::invalid_config("handler_name must not be empty"));
        }
        if self.frame_queue_size == 0 {
            return Err(EngineError::invalid_config("frame_queue_size must be >= 1"));
        }
        if !(self.native_fps > 0.0) {
            return Err(EngineError::invalid_config(format!(
                "invalid native_fps {}",
                self.native_fps
            )));
        }
        Ok(())
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.native_fps)
    }

    pub fn alias(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("{}-{}", self.source_type, self.source_uri),
        }
    }
}

/// Resize target for one consumer. Width and height are independently
/// optional: a single dimension fixes the scale and the other is derived
/// from the native aspect ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetShape {
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl TargetShape {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.width.is_none() && self.height.is_none() {
            return Err(EngineError::invalid_config(
                "target shape must set width or height",
            ));
        }
        if self.width == Some(0) || self.height == Some(0) {
            return Err(EngineError::invalid_config(
                "target shape dimensions must be positive",
            ));
        }
        Ok(())
    }

    /// Resize factor against a native shape; width wins when both are set.
    pub fn zoom_ratio(&self, native: Shape) -> f64 {
        if let Some(width) = self.width {
            return f64::from(width) / f64::from(native.width);
        }
        if let Some(height) = self.height {
            return f64::from(height) / f64::from(native.height);
        }
        1.0
    }

    /// The post-resize frame, deriving an unset dimension from the native
    /// aspect ratio.
    pub fn resolve(&self, native: Shape) -> Shape {
        match (self.width, self.height) {
            (Some(width), Some(height)) => Shape { width, height },
            (Some(width), None) => {
                let ratio = f64::from(width) / f64::from(native.width);
                Shape {
                    width,
                    height: ((f64::from(native.height) * ratio) as u32).max(1),
                }
            }
            (None, Some(height)) => {
                let ratio = f64::from(height) / f64::from(native.height);
                Shape {
                    width: ((f64::from(native.width) * ratio) as u32).max(1),
                    height,
                }
            }
            (None, None) => native,
        }
    }
}

/// Per-consumer view parameters: resize first, then crop.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ViewConfig {
    #[serde(default)]
    pub target_shape: Option<TargetShape>,
    #[serde(default)]
    pub zone: Option<Zone>,
}

impl ViewConfig {
    /// Validate what can be checked without knowing the source's native
    /// shape. A zone is checked against the target here only when the
    /// target is fully specified; partial targets and bare zones resolve
    /// against the native shape once the source is open.
    pub fn validate(&self) -> Result<(), EngineError> {
        if let Some(target) = self.target_shape {
            target.validate()?;
        }
        if let Some(zone) = self.zone {
            zone.validate()?;
            if let Some(TargetShape {
                width: Some(width),
                height: Some(height),
            }) = self.target_shape
            {
                zone.fits_within(Shape { width, height })?;
            }
        }
        Ok(())
    }
}

/// One consumer application: the source it reads, its view onto that source,
/// and its delivery cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSpec {
    pub source: SourceConfig,
    #[serde(default)]
    pub view: ViewConfig,
    /// Consumer cadence; defaults to the source's native fps.
    #[serde(default)]
    pub process_rate_fps: Option<f64>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Suppress re-delivery of frames already seen in the previous batch.
    #[serde(default = "default_dedupe")]
    pub dedupe: bool,
    /// A callback error terminates the worker instead of being logged.
    #[serde(default)]
    pub fail_on_error: bool,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl AppSpec {
    pub fn validate(&self) -> Result<(), EngineError> {
        self.source.validate()?;
        self.view.validate()?;
        if self.batch_size == 0 {
            return Err(EngineError::invalid_config("batch_size must be >= 1"));
        }
        if let Some(rate) = self.process_rate_fps {
            if !(rate > 0.0) {
                return Err(EngineError::invalid_config(format!(
                    "invalid process_rate_fps {rate}"
                )));
            }
        }
        Ok(())
    }

    pub fn process_rate(&self) -> f64 {
        self.process_rate_fps.unwrap_or(self.source.native_fps)
    }

    pub fn alias(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("app-{}", self.source.alias()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_source() -> SourceConfig {
        SourceConfig {
            source_uri: SourceUri::Addr("rtsp://cam/stream".into()),
            source_type: SourceKind::IpCamera,
            handler_name: "video_capture".into(),
            endless: false,
            frame_queue_size: 24,
            native_fps: 24.0,
            name: None,
            description: None,
        }
    }

    #[test]
    fn test_source_config_defaults() {
        let cfg: SourceConfig = serde_json::from_value(serde_json::json!({
            "source_uri": 0,
            "source_type": "usb_camera",
        }))
        .unwrap();
        assert_eq!(cfg.handler_name, "video_capture");
        assert_eq!(cfg.frame_queue_size, 24);
        assert_eq!(cfg.native_fps, 24.0);
        assert!(!cfg.endless);
        assert_eq!(cfg.key().unwrap().uri, SourceUri::Index(0));
    }

    #[test]
    fn test_app_spec_defaults() {
        let spec: AppSpec = serde_json::from_value(serde_json::json!({
            "source": {
                "source_uri": "rtsp://cam/stream",
                "source_type": "ip_camera",
            },
        }))
        .unwrap();
        assert_eq!(spec.batch_size, 1);
        assert!(spec.dedupe);
        assert!(!spec.fail_on_error);
        assert_eq!(spec.process_rate(), 24.0);
        spec.validate().unwrap();
    }

    #[test]
    fn test_zone_outside_target_shape_is_rejected() {
        let spec = AppSpec {
            source: make_source(),
            view: ViewConfig {
                target_shape: Some(TargetShape {
                    width: Some(480),
                    height: Some(270),
                }),
                zone: Some(Zone {
                    start_x: 460,
                    start_y: 0,
                    width: 40,
                    height: 200,
                }),
            },
            process_rate_fps: None,
            batch_size: 1,
            dedupe: true,
            fail_on_error: false,
            name: None,
            description: None,
        };
        assert!(matches!(
            spec.validate(),
            Err(EngineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_single_dimension_target_derives_the_other() {
        let native = Shape::new(1920, 1080).unwrap();

        let by_width = TargetShape {
            width: Some(480),
            height: None,
        };
        by_width.validate().unwrap();
        assert!((by_width.zoom_ratio(native) - 0.25).abs() < f64::EPSILON);
        assert_eq!(by_width.resolve(native), Shape::new(480, 270).unwrap());

        let by_height = TargetShape {
            width: None,
            height: Some(540),
        };
        by_height.validate().unwrap();
        assert!((by_height.zoom_ratio(native) - 0.5).abs() < f64::EPSILON);
        assert_eq!(by_height.resolve(native), Shape::new(960, 540).unwrap());

        let exact = TargetShape {
            width: Some(640),
            height: Some(360),
        };
        assert_eq!(exact.resolve(native), Shape::new(640, 360).unwrap());
    }

    #[test]
    fn test_empty_or_degenerate_target_is_rejected() {
        let empty = TargetShape {
            width: None,
            height: None,
        };
        assert!(matches!(
            empty.validate(),
            Err(EngineError::InvalidConfig(_))
        ));

        let zeroed = TargetShape {
            width: Some(0),
            height: Some(270),
        };
        assert!(zeroed.validate().is_err());
    }

    #[test]
    fn test_zone_with_partial_target_passes_static_validation() {
        // The derived dimension is unknown until the source is open, so the
        // zone check is deferred to attach time.
        let view = ViewConfig {
            target_shape: Some(TargetShape {
                width: Some(480),
                height: None,
            }),
            zone: Some(Zone {
                start_x: 0,
                start_y: 0,
                width: 480,
                height: 4000,
            }),
        };
        view.validate().unwrap();
    }

    #[test]
    fn test_zone_without_target_shape_passes_static_validation() {
        let spec = AppSpec {
            source: make_source(),
            view: ViewConfig {
                target_shape: None,
                zone: Some(Zone {
                    start_x: 0,
                    start_y: 0,
                    width: 4000,
                    height: 4000,
                }),
            },
            process_rate_fps: None,
            batch_size: 1,
            dedupe: true,
            fail_on_error: false,
            name: None,
            description: None,
        };
        // Checked against the native shape at attach time instead.
        spec.validate().unwrap();
    }

    #[test]
    fn test_invalid_rates_rejected() {
        let mut source = make_source();
        source.native_fps = 0.0;
        assert!(source.validate().is_err());

        let spec = AppSpec {
            source: make_source(),
            view: ViewConfig::default(),
            process_rate_fps: Some(-1.0),
            batch_size: 1,
            dedupe: true,
            fail_on_error: false,
            name: None,
            description: None,
        };
        assert!(spec.validate().is_err());
    }
}
