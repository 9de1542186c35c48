mod core;
mod session;
mod types;
#[cfg(test)]
mod tests;

pub use self::core::SessionController;
pub use session::CameraSession;
pub use types::{
    BindState, BindingStatus, CaptureOutcome, CaptureRequest, CaptureStatus, CaptureTicket,
    Completion, PresentationState,
};
