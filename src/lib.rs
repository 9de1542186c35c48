pub mod backends;
pub mod config;
pub mod controller;
pub mod error;
pub mod frame;
pub mod keyboard_input;
pub mod permission;
pub mod screen;
pub mod storage;

pub use backends::{CameraDevice, CameraProvider, CameraSelector, PreviewTarget, UseCase};
pub use config::{CaptureStrategy, SnapcamConfig};
pub use controller::{
    BindingStatus, CaptureStatus, CaptureTicket, PresentationState, SessionController,
};
pub use error::{CameraError, CaptureError, Result, SnapcamError};
pub use frame::FrameData;
pub use permission::{CameraPermission, PermissionState};
pub use screen::{CameraScreen, ScreenHandle};
pub use storage::{FileImageStore, ImageRef, ImageStore};
