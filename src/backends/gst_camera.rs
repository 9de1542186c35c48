use super::{CameraDevice, CameraProvider, CameraSelector, PreviewTarget, UseCase};
use crate::config::CameraConfig;
use crate::error::{CameraError, CaptureError};
use crate::frame::FrameData;
use async_trait::async_trait;
use gstreamer::prelude::*;
use gstreamer::Pipeline;
use gstreamer_app::AppSink;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, error, info, trace, warn};

const PICTURE_FRAME_TIMEOUT: Duration = Duration::from_secs(3);

/// V4L2 cameras driven through a GStreamer MJPEG pipeline
pub struct GStreamerCameraProvider {
    config: CameraConfig,
}

impl GStreamerCameraProvider {
    pub fn new(config: CameraConfig) -> Self {
        Self { config }
    }

    fn build_pipeline_string(&self, device_index: u32) -> String {
        let (width, height) = self.config.resolution;

        format!(
            "v4l2src device=/dev/video{} io-mode=mmap do-timestamp=true ! \
             image/jpeg,width={},height={},framerate={}/1 ! \
             queue max-size-buffers=4 leaky=downstream ! \
             appsink name=sink sync=false max-buffers=2 drop=true emit-signals=false",
            device_index, width, height, self.config.fps
        )
    }
}

#[async_trait]
impl CameraProvider for GStreamerCameraProvider {
    fn name(&self) -> &str {
        "gstreamer"
    }

    async fn acquire(&self, selector: CameraSelector) -> Result<Arc<dyn CameraDevice>, CameraError> {
        let device_index = self.config.device_index(selector);
        let device_path = format!("/dev/video{}", device_index);

        if !Path::new(&device_path).exists() {
            return Err(CameraError::DeviceOpen {
                device: device_path,
                details: "device node not found".to_string(),
            });
        }

        gstreamer::init().map_err(|e| CameraError::Configuration {
            details: format!("Failed to initialize GStreamer: {}", e),
        })?;

        let pipeline_desc = self.build_pipeline_string(device_index);
        info!("Creating GStreamer pipeline: {}", pipeline_desc);

        let pipeline = gstreamer::parse::launch(&pipeline_desc)
            .map_err(|e| CameraError::DeviceOpen {
                device: device_path.clone(),
                details: format!("Failed to create pipeline: {}", e),
            })?
            .downcast::<Pipeline>()
            .map_err(|_| CameraError::Configuration {
                details: "Failed to downcast to Pipeline".to_string(),
            })?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| CameraError::Configuration {
                details: "Pipeline has no appsink".to_string(),
            })?
            .downcast::<AppSink>()
            .map_err(|_| CameraError::Configuration {
                details: "Failed to downcast to AppSink".to_string(),
            })?;

        let shared = Arc::new(SharedState {
            bound: Mutex::new(HashSet::new()),
            target: Mutex::new(None),
            latest: Mutex::new(None),
            frame_counter: AtomicU64::new(0),
        });

        let callback_state = Arc::clone(&shared);
        appsink.set_callbacks(
            gstreamer_app::AppSinkCallbacks::builder()
                .new_sample(move |appsink| {
                    let sample = appsink
                        .pull_sample()
                        .map_err(|_| gstreamer::FlowError::Eos)?;
                    callback_state.handle_sample(&sample);
                    Ok(gstreamer::FlowSuccess::Ok)
                })
                .build(),
        );

        info!("GStreamer {} camera ready on {}", selector, device_path);

        Ok(Arc::new(GStreamerCameraDevice {
            selector,
            pipeline,
            shared,
        }))
    }
}

struct SharedState {
    bound: Mutex<HashSet<UseCase>>,
    target: Mutex<Option<PreviewTarget>>,
    latest: Mutex<Option<FrameData>>,
    frame_counter: AtomicU64,
}

impl SharedState {
    fn handle_sample(&self, sample: &gstreamer::Sample) {
        let frame = match self.frame_from_sample(sample) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Error processing GStreamer sample: {}", e);
                return;
            }
        };

        trace!(
            "Captured MJPEG frame {} ({}x{}, {} bytes)",
            frame.id,
            frame.width,
            frame.height,
            frame.len()
        );

        if self.bound.lock().contains(&UseCase::Preview) {
            if let Some(target) = self.target.lock().as_ref() {
                target.deliver(frame.clone());
            }
        }
        *self.latest.lock() = Some(frame);
    }

    fn frame_from_sample(&self, sample: &gstreamer::Sample) -> Result<FrameData, String> {
        let buffer = sample.buffer().ok_or("No buffer in sample")?;
        let caps = sample.caps().ok_or("No caps in sample")?;
        let structure = caps.structure(0).ok_or("Caps without structure")?;
        let width = structure.get::<i32>("width").map_err(|e| e.to_string())?;
        let height = structure.get::<i32>("height").map_err(|e| e.to_string())?;

        let map = buffer
            .map_readable()
            .map_err(|e| format!("Failed to map buffer: {}", e))?;

        let frame_id = self.frame_counter.fetch_add(1, Ordering::Relaxed);
        Ok(FrameData::new(
            frame_id,
            SystemTime::now(),
            map.as_slice().to_vec(),
            width as u32,
            height as u32,
        ))
    }
}

pub struct GStreamerCameraDevice {
    selector: CameraSelector,
    pipeline: Pipeline,
    shared: Arc<SharedState>,
}

impl GStreamerCameraDevice {
    fn set_state(&self, state: gstreamer::State) -> Result<(), CameraError> {
        self.pipeline
            .set_state(state)
            .map(|_| ())
            .map_err(|e| CameraError::DeviceBindingFailed {
                details: format!("Failed to set pipeline state {:?}: {}", state, e),
            })
    }

    fn stop_if_idle(&self) {
        if self.shared.bound.lock().is_empty() {
            if let Err(e) = self.set_state(gstreamer::State::Null) {
                warn!("{}", e);
            }
        }
    }
}

impl Drop for GStreamerCameraDevice {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gstreamer::State::Null);
        debug!("GStreamer {} camera released", self.selector);
    }
}

#[async_trait]
impl CameraDevice for GStreamerCameraDevice {
    fn selector(&self) -> CameraSelector {
        self.selector
    }

    fn bind(&self, use_cases: &[UseCase]) -> Result<(), CameraError> {
        {
            let mut bound = self.shared.bound.lock();
            if !bound.is_empty() {
                return Err(CameraError::DeviceBusy {
                    details: format!("{} camera already has use cases bound", self.selector),
                });
            }
            bound.extend(use_cases.iter().copied());
        }

        if let Err(e) = self.set_state(gstreamer::State::Playing) {
            self.shared.bound.lock().clear();
            return Err(e);
        }

        debug!("GStreamer {} camera bound {:?}", self.selector, use_cases);
        Ok(())
    }

    fn unbind(&self, use_case: UseCase) {
        self.shared.bound.lock().remove(&use_case);
        self.stop_if_idle();
    }

    fn unbind_all(&self) {
        self.shared.bound.lock().clear();
        self.stop_if_idle();
    }

    fn is_bound(&self, use_case: UseCase) -> bool {
        self.shared.bound.lock().contains(&use_case)
    }

    fn set_preview_target(&self, target: PreviewTarget) {
        *self.shared.target.lock() = Some(target);
    }

    async fn take_picture(&self, destination: &Path) -> Result<(), CaptureError> {
        if !self.is_bound(UseCase::ImageCapture) {
            return Err(CaptureError::Failed {
                reason: format!("Camera use case {} is not bound", UseCase::ImageCapture),
            });
        }

        // Wait for a frame that arrives after the request
        let requested_at = SystemTime::now();
        let deadline = Instant::now() + PICTURE_FRAME_TIMEOUT;
        let frame = loop {
            let candidate = self.shared.latest.lock().clone();
            if let Some(frame) = candidate {
                if frame.timestamp >= requested_at {
                    break frame;
                }
            }
            if Instant::now() >= deadline {
                return Err(CaptureError::Failed {
                    reason: "No frame received from camera".to_string(),
                });
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };

        tokio::fs::write(destination, frame.data.as_slice())
            .await
            .map_err(|e| CaptureError::Failed {
                reason: format!("Failed to write {}: {}", destination.display(), e),
            })?;

        debug!(
            "GStreamer {} camera wrote frame {} to {}",
            self.selector,
            frame.id,
            destination.display()
        );
        Ok(())
    }
}
