//! Platform camera service: device acquisition, use-case binding and still capture.
//!
//! A [`CameraProvider`] hands out exclusive [`CameraDevice`] handles. Devices
//! accept a set of [`UseCase`]s at a time and refuse a second binding until the
//! previous one is released, so callers always `unbind_all` before `bind`.

#[cfg(all(feature = "gstreamer", target_os = "linux"))]
mod gst_camera;
mod virtual_camera;

#[cfg(all(feature = "gstreamer", target_os = "linux"))]
pub use gst_camera::GStreamerCameraProvider;
pub use virtual_camera::{VirtualCameraDevice, VirtualCameraFaults, VirtualCameraProvider};

use crate::config::{CameraBackendKind, CameraConfig};
use crate::error::{CameraError, CaptureError};
use crate::frame::FrameData;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Which lens to open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraSelector {
    Back,
    Front,
}

impl CameraSelector {
    pub fn toggled(self) -> Self {
        match self {
            CameraSelector::Back => CameraSelector::Front,
            CameraSelector::Front => CameraSelector::Back,
        }
    }
}

impl fmt::Display for CameraSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraSelector::Back => write!(f, "back"),
            CameraSelector::Front => write!(f, "front"),
        }
    }
}

/// Camera capability that is bound to and unbound from a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UseCase {
    Preview,
    ImageCapture,
}

impl fmt::Display for UseCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UseCase::Preview => write!(f, "preview"),
            UseCase::ImageCapture => write!(f, "image_capture"),
        }
    }
}

/// Rendering surface that receives live preview frames.
///
/// Clones share the same surface. The last delivered frame is retained so a
/// snapshot can be taken after the preview has been unbound.
#[derive(Clone)]
pub struct PreviewTarget {
    name: Arc<str>,
    frames: Arc<watch::Sender<Option<FrameData>>>,
}

impl PreviewTarget {
    pub fn new(name: &str) -> (Self, watch::Receiver<Option<FrameData>>) {
        let (tx, rx) = watch::channel(None);
        let target = Self {
            name: Arc::from(name),
            frames: Arc::new(tx),
        };
        (target, rx)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Render a frame on this surface
    pub fn deliver(&self, frame: FrameData) {
        self.frames.send_replace(Some(frame));
    }

    /// Last frame rendered on this surface, if any
    pub fn latest_frame(&self) -> Option<FrameData> {
        self.frames.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<FrameData>> {
        self.frames.subscribe()
    }

    /// Whether two handles refer to the same surface
    pub fn same_surface(&self, other: &PreviewTarget) -> bool {
        Arc::ptr_eq(&self.frames, &other.frames)
    }
}

impl fmt::Debug for PreviewTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreviewTarget")
            .field("name", &self.name)
            .finish()
    }
}

/// Acquires camera devices by selector
#[async_trait]
pub trait CameraProvider: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &str;

    /// Open the device for `selector`; resolves once the device is ready
    async fn acquire(&self, selector: CameraSelector) -> Result<Arc<dyn CameraDevice>, CameraError>;
}

/// An exclusive handle on a physical (or simulated) camera
#[async_trait]
pub trait CameraDevice: Send + Sync {
    fn selector(&self) -> CameraSelector;

    /// Bind use cases; fails with `DeviceBusy` while any use case is still bound
    fn bind(&self, use_cases: &[UseCase]) -> Result<(), CameraError>;

    fn unbind(&self, use_case: UseCase);

    fn unbind_all(&self);

    fn is_bound(&self, use_case: UseCase) -> bool;

    /// Redirect preview frames to `target`
    fn set_preview_target(&self, target: PreviewTarget);

    /// Take a still photo and write it as JPEG to `destination`.
    /// Requires the image capture use case to be bound.
    async fn take_picture(&self, destination: &Path) -> Result<(), CaptureError>;
}

/// Build the provider selected by configuration
pub fn create_provider(config: &CameraConfig) -> Result<Arc<dyn CameraProvider>, CameraError> {
    match config.backend {
        CameraBackendKind::Virtual => {
            info!(
                "Using virtual camera ({}x{} @ {}fps)",
                config.resolution.0, config.resolution.1, config.fps
            );
            Ok(Arc::new(VirtualCameraProvider::new(config.resolution, config.fps)))
        }
        #[cfg(all(feature = "gstreamer", target_os = "linux"))]
        CameraBackendKind::Gstreamer => {
            info!("Using GStreamer V4L2 camera backend");
            Ok(Arc::new(GStreamerCameraProvider::new(config.clone())))
        }
        #[cfg(not(all(feature = "gstreamer", target_os = "linux")))]
        CameraBackendKind::Gstreamer => Err(CameraError::Configuration {
            details: "GStreamer backend requires Linux and the `gstreamer` feature".to_string(),
        }),
    }
}
