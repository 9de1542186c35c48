use super::session::CameraSession;
use super::types::{
    BindingStatus, CaptureOutcome, CaptureRequest, CaptureStatus, CaptureTicket, Completion,
    PresentationState,
};
use crate::backends::{CameraDevice, CameraProvider, CameraSelector, PreviewTarget};
use crate::config::{CameraConfig, CaptureConfig, CaptureStrategy, SnapcamConfig};
use crate::error::{CameraError, CaptureError, StorageError};
use crate::frame::FrameData;
use crate::storage::{CaptureMetadata, ImageRef, ImageStore};
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capture currently waiting for its worker
struct InFlight {
    request: CaptureRequest,
    reply: oneshot::Sender<CaptureOutcome>,
    /// Preview was unbound for this capture and must be rebound
    exclusive: bool,
}

/// Device work performed off the owner task
enum CaptureJob {
    Still { device: Arc<dyn CameraDevice> },
    Snapshot { frame: Option<FrameData> },
}

impl CaptureJob {
    async fn run(
        self,
        store: &dyn ImageStore,
        destination: &Path,
        metadata: &CaptureMetadata,
    ) -> CaptureOutcome {
        match self {
            CaptureJob::Still { device } => {
                device.take_picture(destination).await?;
                store
                    .finalize(destination, metadata)
                    .await
                    .map_err(storage_failure)
            }
            CaptureJob::Snapshot { frame } => {
                let frame = frame.ok_or_else(|| CaptureError::Failed {
                    reason: "No preview frame available".to_string(),
                })?;
                store
                    .persist(destination, &frame, metadata)
                    .await
                    .map_err(storage_failure)
            }
        }
    }
}

/// Worker body for one capture. The photo goes to a path reserved up front so
/// an abandoned capture can be cleaned up once its device write settles.
async fn run_capture(
    job: CaptureJob,
    store: Arc<dyn ImageStore>,
    metadata: CaptureMetadata,
    timeout: Duration,
    token: CancellationToken,
) -> Option<CaptureOutcome> {
    let request_id = metadata.request_id;
    let destination = match store.output_for_capture().await {
        Ok(path) => path,
        Err(e) => return Some(Err(storage_failure(e))),
    };
    if token.is_cancelled() {
        debug!("Capture {} abandoned before it started", request_id);
        return None;
    }

    let work = job.run(store.as_ref(), &destination, &metadata);
    tokio::pin!(work);

    let result = tokio::select! {
        biased;
        _ = token.cancelled() => {
            debug!("Capture {} abandoned: session closed", request_id);
            // The device may still be writing; let it finish before removing
            let _ = tokio::time::timeout(timeout, &mut work).await;
            discard_output(store.as_ref(), &destination).await;
            return None;
        }
        outcome = tokio::time::timeout(timeout, &mut work) => match outcome {
            Ok(result) => result,
            Err(_) => Err(CaptureError::Failed {
                reason: format!("Capture timed out after {}s", timeout.as_secs()),
            }),
        },
    };

    if result.is_err() {
        discard_output(store.as_ref(), &destination).await;
    }
    Some(result)
}

async fn discard_output(store: &dyn ImageStore, destination: &Path) {
    if let Err(e) = store.discard(destination).await {
        warn!("Failed to clean up {}: {}", destination.display(), e);
    }
}

fn storage_failure(e: StorageError) -> CaptureError {
    CaptureError::Failed {
        reason: e.to_string(),
    }
}

/// Camera lifecycle and capture state machine.
///
/// Owned by a single task. Background work reports back through the
/// completion channel and only [`SessionController::handle_completion`]
/// applies its result.
pub struct SessionController {
    provider: Arc<dyn CameraProvider>,
    store: Arc<dyn ImageStore>,
    camera: CameraConfig,
    capture: CaptureConfig,
    selector: CameraSelector,
    session: Option<CameraSession>,
    preview_target: Option<PreviewTarget>,
    binding: BindingStatus,
    in_flight: Option<InFlight>,
    last_request: Option<CaptureRequest>,
    captured_image: Option<ImageRef>,
    notice: Option<String>,
    next_request_id: u64,
    generation: u64,
    lifecycle: CancellationToken,
    torn_down: bool,
    completions: mpsc::UnboundedSender<Completion>,
    state: watch::Sender<PresentationState>,
}

impl SessionController {
    pub fn new(
        config: &SnapcamConfig,
        provider: Arc<dyn CameraProvider>,
        store: Arc<dyn ImageStore>,
        completions: mpsc::UnboundedSender<Completion>,
    ) -> Self {
        let selector = config.camera.selector;
        let (state, _) = watch::channel(PresentationState::new(selector));

        Self {
            provider,
            store,
            camera: config.camera.clone(),
            capture: config.capture.clone(),
            selector,
            session: None,
            preview_target: None,
            binding: BindingStatus::Initializing,
            in_flight: None,
            last_request: None,
            captured_image: None,
            notice: None,
            next_request_id: 1,
            generation: 0,
            lifecycle: CancellationToken::new(),
            torn_down: false,
            completions,
            state,
        }
    }

    /// Acquire the device for `selector` and bind preview and capture.
    ///
    /// Background work started by this session stops when `lifecycle` is cancelled.
    pub async fn initialize(
        &mut self,
        lifecycle: &CancellationToken,
        selector: CameraSelector,
    ) -> Result<&CameraSession, CameraError> {
        if self.torn_down {
            return Err(CameraError::DeviceBindingFailed {
                details: "camera session has been torn down".to_string(),
            });
        }

        info!(
            "Initializing {} camera via {} backend",
            selector,
            self.provider.name()
        );

        self.lifecycle = lifecycle.child_token();
        self.selector = selector;
        self.release_session();
        self.binding = BindingStatus::Initializing;
        self.publish();

        self.bind_with_retry().await?;
        self.session
            .as_ref()
            .ok_or_else(|| CameraError::DeviceBindingFailed {
                details: "camera session was closed".to_string(),
            })
    }

    /// Attach live frames to `target`; safe to call repeatedly
    pub fn start_preview(&mut self, target: PreviewTarget) {
        info!("Attaching preview to {}", target.name());
        self.preview_target = Some(target.clone());
        if let Some(session) = self.session.as_mut() {
            session.attach_preview(target);
        }
    }

    /// Start a capture. Returns `None` when the trigger is rejected
    /// because a capture is already running or the session is not bound.
    pub fn capture(&mut self) -> Option<CaptureTicket> {
        if self.torn_down {
            debug!("Capture ignored: session torn down");
            return None;
        }

        if let Some(in_flight) = &self.in_flight {
            warn!(
                "Capture {} already in progress; ignoring trigger",
                in_flight.request.id
            );
            return None;
        }

        let strategy = self.capture.strategy;
        let session = match self.session.as_mut() {
            Some(session) if session.is_bound() => session,
            _ => {
                warn!("Capture ignored: camera is not bound");
                return None;
            }
        };

        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let metadata = CaptureMetadata {
            request_id,
            selector: session.selector(),
            strategy,
            captured_at: Utc::now(),
        };

        let job = match strategy {
            CaptureStrategy::StillCapture => CaptureJob::Still {
                device: Arc::clone(session.device()),
            },
            CaptureStrategy::PreviewSnapshot => {
                let frame = session.preview_target().and_then(|t| t.latest_frame());
                session.suspend_preview();
                CaptureJob::Snapshot { frame }
            }
        };

        if strategy.requires_exclusive_device() {
            self.binding = BindingStatus::Unbound;
        }

        info!("Capture {} started ({:?})", request_id, strategy);

        let store = Arc::clone(&self.store);
        let completions = self.completions.clone();
        let token = self.lifecycle.clone();
        let generation = self.generation;
        let timeout = self.capture.timeout();

        tokio::spawn(async move {
            let Some(result) = run_capture(job, store, metadata, timeout, token).await else {
                return;
            };

            let completion = Completion {
                generation,
                request_id,
                result,
            };
            if completions.send(completion).is_err() {
                debug!("Capture {} finished after teardown; ignoring", request_id);
            }
        });

        let (reply, receiver) = oneshot::channel();
        self.in_flight = Some(InFlight {
            request: CaptureRequest {
                id: request_id,
                status: CaptureStatus::InProgress,
            },
            reply,
            exclusive: strategy.requires_exclusive_device(),
        });
        self.notice = None;
        self.publish();

        Some(CaptureTicket::new(request_id, receiver))
    }

    /// Apply a worker result on the owner task
    pub fn handle_completion(&mut self, completion: Completion) {
        if self.torn_down || completion.generation != self.generation {
            debug!(
                "Ignoring stale completion for capture {}",
                completion.request_id
            );
            return;
        }

        let in_flight = match self.in_flight.take() {
            Some(in_flight) if in_flight.request.id == completion.request_id => in_flight,
            other => {
                debug!(
                    "Completion for capture {} does not match the in-flight request",
                    completion.request_id
                );
                self.in_flight = other;
                return;
            }
        };

        if in_flight.exclusive {
            self.restore_binding();
        }

        let status = match &completion.result {
            Ok(image) => {
                info!("Capture {} saved to {}", completion.request_id, image);
                self.captured_image = Some(image.clone());
                CaptureStatus::Succeeded(image.clone())
            }
            Err(e) => {
                warn!("Capture {} failed: {}", completion.request_id, e);
                self.notice = Some(format!("Photo capture failed: {}", e));
                CaptureStatus::Failed(e.to_string())
            }
        };

        self.last_request = Some(CaptureRequest {
            id: completion.request_id,
            status,
        });

        if in_flight.reply.send(completion.result).is_err() {
            debug!("Capture {} outcome had no listener", completion.request_id);
        }

        self.publish();
    }

    /// Clear the captured photo and return to the live preview
    pub fn dismiss_capture(&mut self) {
        if self.captured_image.take().is_some() {
            debug!("Captured image dismissed");
        }
        self.publish();
    }

    /// Clear the one-time notice once it has been shown
    pub fn acknowledge_notice(&mut self) {
        if self.notice.take().is_some() {
            self.publish();
        }
    }

    /// Re-run acquisition and binding after a binding failure
    pub async fn retry_binding(&mut self) -> Result<(), CameraError> {
        if self.torn_down {
            return Err(CameraError::DeviceBindingFailed {
                details: "camera session has been torn down".to_string(),
            });
        }
        if self.binding == BindingStatus::Bound {
            return Ok(());
        }
        if self.in_flight.is_some() {
            return Err(CameraError::DeviceBusy {
                details: "capture in progress".to_string(),
            });
        }

        info!("Retrying camera binding");

        if let Some(session) = self.session.as_mut() {
            if session.bind().is_ok() {
                self.binding = BindingStatus::Bound;
                self.publish();
                return Ok(());
            }
        }

        self.release_session();
        self.binding = BindingStatus::Initializing;
        self.publish();
        self.bind_with_retry().await
    }

    /// Rebind with another lens; rejected while a capture is running
    pub async fn switch_camera(&mut self, selector: CameraSelector) -> Result<(), CameraError> {
        if self.torn_down {
            return Err(CameraError::DeviceBindingFailed {
                details: "camera session has been torn down".to_string(),
            });
        }
        if self.in_flight.is_some() {
            return Err(CameraError::DeviceBusy {
                details: "capture in progress".to_string(),
            });
        }
        if selector == self.selector && self.binding == BindingStatus::Bound {
            return Ok(());
        }

        info!("Switching to {} camera", selector);
        self.release_session();
        self.selector = selector;
        self.binding = BindingStatus::Initializing;
        self.publish();
        self.bind_with_retry().await
    }

    /// Acquisition must wait for permission
    pub fn permission_denied(&mut self) {
        warn!("Camera permission denied; device will not be acquired");
        self.binding = BindingStatus::PermissionDenied;
        self.publish();
    }

    /// Release the device. Pending captures resolve as `Cancelled` and later
    /// completions are ignored.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }

        info!("Tearing down camera session");
        self.torn_down = true;
        self.generation += 1;
        self.lifecycle.cancel();

        if let Some(in_flight) = self.in_flight.take() {
            debug!("Abandoning capture {}", in_flight.request.id);
        }

        self.release_session();
        self.binding = BindingStatus::Unbound;
        self.publish();
    }

    pub fn subscribe(&self) -> watch::Receiver<PresentationState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> PresentationState {
        self.state.borrow().clone()
    }

    pub fn session(&self) -> Option<&CameraSession> {
        self.session.as_ref()
    }

    pub fn binding(&self) -> &BindingStatus {
        &self.binding
    }

    pub fn selector(&self) -> CameraSelector {
        self.selector
    }

    pub fn in_flight_request(&self) -> Option<&CaptureRequest> {
        self.in_flight.as_ref().map(|f| &f.request)
    }

    pub fn captured_image(&self) -> Option<&ImageRef> {
        self.captured_image.as_ref()
    }

    async fn bind_with_retry(&mut self) -> Result<(), CameraError> {
        let attempts = self.camera.bind_retries.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.acquire_and_bind().await {
                Ok(()) => {
                    self.binding = BindingStatus::Bound;
                    self.publish();
                    break;
                }
                Err(e) => {
                    warn!(
                        "Camera binding attempt {}/{} failed: {}",
                        attempt, attempts, e
                    );
                    let recoverable = e.is_recoverable();
                    last_error = Some(e);

                    if !recoverable || self.lifecycle.is_cancelled() || attempt == attempts {
                        break;
                    }

                    tokio::select! {
                        _ = self.lifecycle.cancelled() => break,
                        _ = tokio::time::sleep(self.camera.bind_retry_delay(attempt)) => {}
                    }
                }
            }
        }

        if self.session.is_some() {
            return Ok(());
        }

        let error = last_error.unwrap_or_else(|| CameraError::DeviceBindingFailed {
            details: "camera session was closed".to_string(),
        });
        error!("Camera binding failed: {}", error);
        self.binding = BindingStatus::Failed(error.to_string());
        self.publish();
        Err(error)
    }

    async fn acquire_and_bind(&mut self) -> Result<(), CameraError> {
        let provider = Arc::clone(&self.provider);
        let selector = self.selector;
        let worker = tokio::spawn(async move { provider.acquire(selector).await });

        let device = tokio::select! {
            joined = worker => joined.map_err(|e| CameraError::DeviceOpen {
                device: selector.to_string(),
                details: format!("acquisition task failed: {}", e),
            })??,
            _ = self.lifecycle.cancelled() => {
                return Err(CameraError::DeviceBindingFailed {
                    details: "screen closed before the camera was ready".to_string(),
                });
            }
        };

        let mut session = CameraSession::new(device, self.preview_target.clone());
        match session.bind() {
            Ok(()) => {
                self.session = Some(session);
                Ok(())
            }
            Err(e) => {
                session.release();
                Err(e)
            }
        }
    }

    fn restore_binding(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        match session.bind() {
            Ok(()) => self.binding = BindingStatus::Bound,
            Err(e) => {
                error!("Failed to rebind camera after capture: {}", e);
                self.binding = BindingStatus::Failed(e.to_string());
            }
        }
    }

    fn release_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.release();
        }
    }

    fn publish(&self) {
        let state = PresentationState {
            binding: self.binding.clone(),
            selector: self.selector,
            capture_status: if self.in_flight.is_some() {
                CaptureStatus::InProgress
            } else {
                CaptureStatus::Idle
            },
            last_request: self.last_request.clone(),
            captured_image: self.captured_image.clone(),
            notice: self.notice.clone(),
        };
        self.state.send_replace(state);
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.lifecycle.cancel();
        self.release_session();
    }
}
