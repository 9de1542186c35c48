use crate::backends::CameraSelector;
use crate::error::CaptureError;
use crate::storage::ImageRef;
use tokio::sync::oneshot;

/// Whether the session currently holds preview and capture on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindState {
    Unbound,
    Bound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureStatus {
    Idle,
    InProgress,
    Succeeded(ImageRef),
    Failed(String),
}

/// One photo capture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    pub id: u64,
    pub status: CaptureStatus,
}

/// Binding status as shown to the presentation layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingStatus {
    /// Waiting for permission or for the device to become ready
    Initializing,
    Bound,
    /// Device released, or transiently unbound during an exclusive capture
    Unbound,
    /// Acquisition or binding failed; `retry_binding` may recover
    Failed(String),
    PermissionDenied,
}

/// Everything the presentation layer renders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationState {
    pub binding: BindingStatus,
    pub selector: CameraSelector,
    /// `Idle` or `InProgress`; terminal outcomes are in `last_request`
    pub capture_status: CaptureStatus,
    pub last_request: Option<CaptureRequest>,
    /// Photo overlaid on the preview until dismissed
    pub captured_image: Option<ImageRef>,
    /// One-time user-visible message
    pub notice: Option<String>,
}

impl PresentationState {
    pub fn new(selector: CameraSelector) -> Self {
        Self {
            binding: BindingStatus::Initializing,
            selector,
            capture_status: CaptureStatus::Idle,
            last_request: None,
            captured_image: None,
            notice: None,
        }
    }

    pub fn capture_in_progress(&self) -> bool {
        self.capture_status == CaptureStatus::InProgress
    }

    /// The capture button is disabled while capturing or without a binding
    pub fn capture_enabled(&self) -> bool {
        !self.capture_in_progress() && self.binding == BindingStatus::Bound
    }

    pub fn show_loading(&self) -> bool {
        self.capture_in_progress()
    }

    pub fn show_overlay(&self) -> bool {
        self.captured_image.is_some()
    }
}

pub type CaptureOutcome = Result<ImageRef, CaptureError>;

/// Single-shot receiver for the outcome of one capture request
#[derive(Debug)]
pub struct CaptureTicket {
    request_id: u64,
    receiver: oneshot::Receiver<CaptureOutcome>,
}

impl CaptureTicket {
    pub(crate) fn new(request_id: u64, receiver: oneshot::Receiver<CaptureOutcome>) -> Self {
        Self {
            request_id,
            receiver,
        }
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Wait for the outcome; `Cancelled` if the session was torn down first
    pub async fn outcome(self) -> CaptureOutcome {
        self.receiver.await.unwrap_or(Err(CaptureError::Cancelled))
    }
}

/// Result of background work, applied on the owner task
#[derive(Debug)]
pub struct Completion {
    pub(crate) generation: u64,
    pub(crate) request_id: u64,
    pub(crate) result: CaptureOutcome,
}

impl Completion {
    pub fn request_id(&self) -> u64 {
        self.request_id
    }
}
