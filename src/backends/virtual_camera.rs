use super::{CameraDevice, CameraProvider, CameraSelector, PreviewTarget, UseCase};
use crate::error::{CameraError, CaptureError};
use crate::frame::FrameData;
use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::ColorType;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const MIN_FRAME_INTERVAL: Duration = Duration::from_millis(1);

/// Fault injection knobs shared by a provider and every device it opens
#[derive(Debug, Default)]
pub struct VirtualCameraFaults {
    acquire_failures: AtomicU32,
    capture_failures: AtomicU32,
    capture_delay_ms: AtomicU64,
    acquisitions: AtomicU32,
    pictures_taken: AtomicU32,
}

impl VirtualCameraFaults {
    /// Fail the next `count` acquisitions with `DeviceOpen`
    pub fn fail_next_acquisitions(&self, count: u32) {
        self.acquire_failures.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` still captures
    pub fn fail_next_captures(&self, count: u32) {
        self.capture_failures.store(count, Ordering::SeqCst);
    }

    /// Make every still capture take at least `delay`
    pub fn set_capture_delay(&self, delay: Duration) {
        self.capture_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn acquisitions(&self) -> u32 {
        self.acquisitions.load(Ordering::SeqCst)
    }

    pub fn pictures_taken(&self) -> u32 {
        self.pictures_taken.load(Ordering::SeqCst)
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Simulated camera producing a synthetic test pattern
pub struct VirtualCameraProvider {
    resolution: (u32, u32),
    fps: u32,
    faults: Arc<VirtualCameraFaults>,
    last_device: Mutex<Option<Arc<VirtualCameraDevice>>>,
}

impl VirtualCameraProvider {
    pub fn new(resolution: (u32, u32), fps: u32) -> Self {
        Self {
            resolution,
            fps: fps.max(1),
            faults: Arc::new(VirtualCameraFaults::default()),
            last_device: Mutex::new(None),
        }
    }

    pub fn faults(&self) -> Arc<VirtualCameraFaults> {
        Arc::clone(&self.faults)
    }

    /// Most recently acquired device
    pub fn last_device(&self) -> Option<Arc<VirtualCameraDevice>> {
        self.last_device.lock().clone()
    }
}

#[async_trait]
impl CameraProvider for VirtualCameraProvider {
    fn name(&self) -> &str {
        "virtual"
    }

    async fn acquire(&self, selector: CameraSelector) -> Result<Arc<dyn CameraDevice>, CameraError> {
        self.faults.acquisitions.fetch_add(1, Ordering::SeqCst);

        if VirtualCameraFaults::take_one(&self.faults.acquire_failures) {
            warn!("Virtual {} camera refused to open (injected fault)", selector);
            return Err(CameraError::DeviceOpen {
                device: format!("virtual:{}", selector),
                details: "simulated device failure".to_string(),
            });
        }

        let device = VirtualCameraDevice::open(
            selector,
            self.resolution,
            self.fps,
            Arc::clone(&self.faults),
        );
        *self.last_device.lock() = Some(Arc::clone(&device));

        info!(
            "Virtual {} camera ready ({}x{} @ {}fps)",
            selector, self.resolution.0, self.resolution.1, self.fps
        );
        Ok(device)
    }
}

struct DeviceState {
    bound: HashSet<UseCase>,
    target: Option<PreviewTarget>,
}

pub struct VirtualCameraDevice {
    selector: CameraSelector,
    resolution: (u32, u32),
    state: Arc<Mutex<DeviceState>>,
    frame_counter: Arc<AtomicU64>,
    faults: Arc<VirtualCameraFaults>,
    frame_loop: CancellationToken,
}

impl VirtualCameraDevice {
    fn open(
        selector: CameraSelector,
        resolution: (u32, u32),
        fps: u32,
        faults: Arc<VirtualCameraFaults>,
    ) -> Arc<Self> {
        let device = Arc::new(Self {
            selector,
            resolution,
            state: Arc::new(Mutex::new(DeviceState {
                bound: HashSet::new(),
                target: None,
            })),
            frame_counter: Arc::new(AtomicU64::new(0)),
            faults,
            frame_loop: CancellationToken::new(),
        });

        let state = Arc::clone(&device.state);
        let frame_counter = Arc::clone(&device.frame_counter);
        let token = device.frame_loop.clone();
        let period = frame_interval(fps);

        tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(period);
            debug!("Virtual camera frame loop started");

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval_timer.tick() => {
                        emit_preview_frame(&state, &frame_counter, resolution);
                    }
                }
            }

            debug!("Virtual camera frame loop stopped");
        });

        device
    }

    /// Number of frames generated so far
    pub fn frame_count(&self) -> u64 {
        self.frame_counter.load(Ordering::Relaxed)
    }

    pub fn bound_use_cases(&self) -> Vec<UseCase> {
        let mut bound: Vec<UseCase> = self.state.lock().bound.iter().copied().collect();
        bound.sort_by_key(|u| *u as u8);
        bound
    }
}

impl Drop for VirtualCameraDevice {
    fn drop(&mut self) {
        self.frame_loop.cancel();
    }
}

#[async_trait]
impl CameraDevice for VirtualCameraDevice {
    fn selector(&self) -> CameraSelector {
        self.selector
    }

    fn bind(&self, use_cases: &[UseCase]) -> Result<(), CameraError> {
        {
            let mut state = self.state.lock();
            if !state.bound.is_empty() {
                return Err(CameraError::DeviceBusy {
                    details: format!(
                        "{} camera still has {} use case(s) bound",
                        self.selector,
                        state.bound.len()
                    ),
                });
            }
            state.bound.extend(use_cases.iter().copied());
        }

        debug!("Virtual {} camera bound {:?}", self.selector, use_cases);

        // Show a frame right away instead of waiting for the next tick
        emit_preview_frame(&self.state, &self.frame_counter, self.resolution);
        Ok(())
    }

    fn unbind(&self, use_case: UseCase) {
        if self.state.lock().bound.remove(&use_case) {
            debug!("Virtual {} camera unbound {}", self.selector, use_case);
        }
    }

    fn unbind_all(&self) {
        let mut state = self.state.lock();
        if !state.bound.is_empty() {
            debug!("Virtual {} camera unbound all use cases", self.selector);
        }
        state.bound.clear();
    }

    fn is_bound(&self, use_case: UseCase) -> bool {
        self.state.lock().bound.contains(&use_case)
    }

    fn set_preview_target(&self, target: PreviewTarget) {
        debug!("Virtual {} camera preview -> {}", self.selector, target.name());
        self.state.lock().target = Some(target);
        emit_preview_frame(&self.state, &self.frame_counter, self.resolution);
    }

    async fn take_picture(&self, destination: &Path) -> Result<(), CaptureError> {
        if !self.is_bound(UseCase::ImageCapture) {
            return Err(CaptureError::Failed {
                reason: format!("Camera use case {} is not bound", UseCase::ImageCapture),
            });
        }

        let delay = self.faults.capture_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if VirtualCameraFaults::take_one(&self.faults.capture_failures) {
            return Err(CaptureError::Failed {
                reason: "Camera device busy".to_string(),
            });
        }

        let frame_id = self.frame_counter.fetch_add(1, Ordering::Relaxed);
        let data = render_test_pattern(frame_id, self.resolution).map_err(|e| {
            CaptureError::Failed {
                reason: format!("Failed to encode photo: {}", e),
            }
        })?;

        tokio::fs::write(destination, &data).await.map_err(|e| CaptureError::Failed {
            reason: format!("Failed to write {}: {}", destination.display(), e),
        })?;

        self.faults.pictures_taken.fetch_add(1, Ordering::SeqCst);
        debug!(
            "Virtual {} camera wrote {} bytes to {}",
            self.selector,
            data.len(),
            destination.display()
        );
        Ok(())
    }
}

/// Time between frames, never zero
fn frame_interval(fps: u32) -> Duration {
    Duration::from_secs_f64(1.0 / fps.max(1) as f64).max(MIN_FRAME_INTERVAL)
}

fn emit_preview_frame(state: &Mutex<DeviceState>, frame_counter: &AtomicU64, resolution: (u32, u32)) {
    let target = {
        let state = state.lock();
        if !state.bound.contains(&UseCase::Preview) {
            return;
        }
        match &state.target {
            Some(target) => target.clone(),
            None => return,
        }
    };

    let frame_id = frame_counter.fetch_add(1, Ordering::Relaxed);
    match render_test_pattern(frame_id, resolution) {
        Ok(data) => {
            trace!(
                "Generated virtual frame {} ({}x{}, {} bytes)",
                frame_id,
                resolution.0,
                resolution.1,
                data.len()
            );
            target.deliver(FrameData::new(
                frame_id,
                SystemTime::now(),
                data,
                resolution.0,
                resolution.1,
            ));
        }
        Err(e) => warn!("Failed to render virtual frame {}: {}", frame_id, e),
    }
}

/// Moving gradient, JPEG-encoded
fn render_test_pattern(frame_id: u64, (width, height): (u32, u32)) -> image::ImageResult<Vec<u8>> {
    let shift = (frame_id % 256) as u32;
    let mut pixels = Vec::with_capacity(width as usize * height as usize * 3);
    for y in 0..height {
        for x in 0..width {
            pixels.push(((x * 255 / width.max(1)) + shift) as u8);
            pixels.push(((y * 255 / height.max(1)) + shift) as u8);
            pixels.push(shift as u8);
        }
    }

    let mut data = Vec::new();
    JpegEncoder::new_with_quality(&mut data, 75).encode(&pixels, width, height, ColorType::Rgb8)?;
    Ok(data)
}
