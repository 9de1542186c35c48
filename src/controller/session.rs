use super::types::BindState;
use crate::backends::{CameraDevice, CameraSelector, PreviewTarget, UseCase};
use crate::error::CameraError;
use std::sync::Arc;
use tracing::{debug, info};

const SESSION_USE_CASES: [UseCase; 2] = [UseCase::Preview, UseCase::ImageCapture];

/// The acquired device together with its preview surface
pub struct CameraSession {
    device: Arc<dyn CameraDevice>,
    selector: CameraSelector,
    bound_state: BindState,
    preview_target: Option<PreviewTarget>,
}

impl CameraSession {
    pub(crate) fn new(device: Arc<dyn CameraDevice>, preview_target: Option<PreviewTarget>) -> Self {
        Self {
            selector: device.selector(),
            device,
            bound_state: BindState::Unbound,
            preview_target,
        }
    }

    pub fn selector(&self) -> CameraSelector {
        self.selector
    }

    pub fn bound_state(&self) -> BindState {
        self.bound_state
    }

    pub fn is_bound(&self) -> bool {
        self.bound_state == BindState::Bound
    }

    pub fn preview_target(&self) -> Option<&PreviewTarget> {
        self.preview_target.as_ref()
    }

    pub fn device(&self) -> &Arc<dyn CameraDevice> {
        &self.device
    }

    /// Unbind whatever the device holds, then bind preview and capture
    pub(crate) fn bind(&mut self) -> Result<(), CameraError> {
        self.device.unbind_all();
        self.bound_state = BindState::Unbound;

        if let Some(target) = &self.preview_target {
            self.device.set_preview_target(target.clone());
        }

        self.device
            .bind(&SESSION_USE_CASES)
            .map_err(|e| CameraError::DeviceBindingFailed {
                details: e.to_string(),
            })?;

        self.bound_state = BindState::Bound;
        info!("Camera session bound ({} camera)", self.selector);
        Ok(())
    }

    /// Attach the preview to `target`, replacing any previous surface
    pub(crate) fn attach_preview(&mut self, target: PreviewTarget) {
        if let Some(current) = &self.preview_target {
            if current.same_surface(&target) {
                debug!("Preview already attached to {}", target.name());
            }
        }
        self.device.set_preview_target(target.clone());
        self.preview_target = Some(target);
    }

    /// Release the preview while a capture needs the device to itself
    pub(crate) fn suspend_preview(&mut self) {
        self.device.unbind(UseCase::Preview);
        self.bound_state = BindState::Unbound;
        debug!("Preview unbound for exclusive capture");
    }

    pub(crate) fn release(&mut self) {
        self.device.unbind_all();
        self.bound_state = BindState::Unbound;
        info!("Camera session released ({} camera)", self.selector);
    }
}
