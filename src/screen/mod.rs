use crate::backends::{CameraProvider, CameraSelector, PreviewTarget};
use crate::config::SnapcamConfig;
use crate::controller::{CaptureTicket, Completion, PresentationState, SessionController};
use crate::error::{Result, SnapcamError};
use crate::permission::{CameraPermission, PermissionState};
use crate::storage::ImageStore;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};


/// Requests from the presentation layer to the screen's owner task
pub enum ScreenCommand {
    StartPreview(PreviewTarget),
    Capture {
        reply: oneshot::Sender<Option<CaptureTicket>>,
    },
    DismissCapture,
    AcknowledgeNotice,
    RetryBinding,
    SwitchCamera(CameraSelector),
    Shutdown,
}

impl ScreenCommand {
    fn name(&self) -> &'static str {
        match self {
            ScreenCommand::StartPreview(_) => "start_preview",
            ScreenCommand::Capture { .. } => "capture",
            ScreenCommand::DismissCapture => "dismiss_capture",
            ScreenCommand::AcknowledgeNotice => "acknowledge_notice",
            ScreenCommand::RetryBinding => "retry_binding",
            ScreenCommand::SwitchCamera(_) => "switch_camera",
            ScreenCommand::Shutdown => "shutdown",
        }
    }
}

/// Binding work the owner task runs while it keeps answering commands
#[derive(Debug, Clone, Copy)]
enum BindOp {
    Initialize,
    Retry,
    Switch(CameraSelector),
}

/// Cloneable handle the presentation layer uses to drive a [`CameraScreen`]
#[derive(Clone)]
pub struct ScreenHandle {
    commands: mpsc::UnboundedSender<ScreenCommand>,
    state: watch::Receiver<PresentationState>,
}

impl ScreenHandle {
    fn send(&self, command: ScreenCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| SnapcamError::system("Camera screen has shut down"))
    }

    pub fn start_preview(&self, target: PreviewTarget) -> Result<()> {
        self.send(ScreenCommand::StartPreview(target))
    }

    /// Trigger a capture. `Ok(None)` means the trigger was rejected.
    pub async fn capture(&self) -> Result<Option<CaptureTicket>> {
        let (reply, response) = oneshot::channel();
        self.send(ScreenCommand::Capture { reply })?;
        response
            .await
            .map_err(|_| SnapcamError::system("Camera screen closed before accepting the capture"))
    }

    pub fn dismiss_capture(&self) -> Result<()> {
        self.send(ScreenCommand::DismissCapture)
    }

    pub fn acknowledge_notice(&self) -> Result<()> {
        self.send(ScreenCommand::AcknowledgeNotice)
    }

    pub fn retry_binding(&self) -> Result<()> {
        self.send(ScreenCommand::RetryBinding)
    }

    pub fn switch_camera(&self, selector: CameraSelector) -> Result<()> {
        self.send(ScreenCommand::SwitchCamera(selector))
    }

    /// Switch to whichever lens is not currently selected
    pub fn toggle_camera(&self) -> Result<()> {
        let selector = self.state.borrow().selector.toggled();
        self.switch_camera(selector)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(ScreenCommand::Shutdown)
    }

    pub fn state(&self) -> PresentationState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PresentationState> {
        self.state.clone()
    }

    /// Wait until the published state satisfies `predicate`
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(&PresentationState) -> bool,
    ) -> Result<PresentationState> {
        let mut state = self.state.clone();
        let snapshot = state.wait_for(|s| predicate(s)).await.map(|s| (*s).clone());
        snapshot.map_err(|_| SnapcamError::system("Camera screen has shut down"))
    }
}

/// The camera screen's owner task.
///
/// Holds the [`SessionController`] and is the only place its state changes:
/// commands from [`ScreenHandle`]s and completions from capture workers are
/// applied here one at a time.
pub struct CameraScreen {
    controller: SessionController,
    permission: CameraPermission,
    selector: CameraSelector,
    permitted: bool,
    commands: mpsc::UnboundedReceiver<ScreenCommand>,
    completions: mpsc::UnboundedReceiver<Completion>,
    lifetime: CancellationToken,
}

impl CameraScreen {
    /// Create the screen. It closes when `lifetime` is cancelled or a
    /// handle sends `Shutdown`.
    pub fn new(
        config: &SnapcamConfig,
        provider: Arc<dyn CameraProvider>,
        store: Arc<dyn ImageStore>,
        permission: CameraPermission,
        lifetime: CancellationToken,
    ) -> (Self, ScreenHandle) {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let controller = SessionController::new(config, provider, store, completion_tx);

        let handle = ScreenHandle {
            commands: command_tx,
            state: controller.subscribe(),
        };

        let screen = Self {
            controller,
            permission,
            selector: config.camera.selector,
            permitted: false,
            commands: command_rx,
            completions: completion_rx,
            lifetime,
        };

        (screen, handle)
    }

    pub async fn run(mut self) -> Result<()> {
        info!("Camera screen active");

        if self.await_permission().await
            && self.bind_responsive(BindOp::Initialize).await
            && !self.lifetime.is_cancelled()
        {
            self.event_loop().await;
        }

        self.close();
        info!("Camera screen closed");
        Ok(())
    }

    /// Block acquisition until permission is granted. Returns `false` if the
    /// screen closed first.
    async fn await_permission(&mut self) -> bool {
        let mut permission = self.permission.subscribe();
        let mut reported = None;

        loop {
            let current = *permission.borrow_and_update();
            if reported != Some(current) {
                match current {
                    PermissionState::Granted => {
                        self.permitted = true;
                        return true;
                    }
                    PermissionState::Denied => self.controller.permission_denied(),
                    PermissionState::Undetermined => debug!("Waiting for camera permission"),
                }
                reported = Some(current);
            }

            tokio::select! {
                _ = self.lifetime.cancelled() => return false,
                changed = permission.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command).await {
                            return false;
                        }
                    }
                    None => return false,
                },
            }
        }
    }

    async fn event_loop(&mut self) {
        loop {
            tokio::select! {
                _ = self.lifetime.cancelled() => {
                    debug!("Camera screen lifetime ended");
                    break;
                }
                Some(completion) = self.completions.recv() => {
                    self.controller.handle_completion(completion);
                }
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command).await {
                            break;
                        }
                    }
                    None => {
                        debug!("All screen handles dropped");
                        break;
                    }
                },
            }
        }
    }

    /// Apply one command; `false` ends the screen
    async fn handle_command(&mut self, command: ScreenCommand) -> bool {
        debug!("Screen command: {}", command.name());

        match command {
            ScreenCommand::RetryBinding if self.permitted => {
                self.bind_responsive(BindOp::Retry).await
            }
            ScreenCommand::SwitchCamera(selector) if self.permitted => {
                self.bind_responsive(BindOp::Switch(selector)).await
            }
            ScreenCommand::RetryBinding | ScreenCommand::SwitchCamera(_) => {
                debug!("Camera permission not granted; ignoring command");
                true
            }
            ScreenCommand::Shutdown => {
                info!("Camera screen shutdown requested");
                false
            }
            command => {
                self.apply_command(command);
                true
            }
        }
    }

    /// Commands that never wait on the device
    fn apply_command(&mut self, command: ScreenCommand) {
        match command {
            ScreenCommand::StartPreview(target) => self.controller.start_preview(target),
            ScreenCommand::Capture { reply } => {
                let ticket = self.controller.capture();
                if reply.send(ticket).is_err() {
                    debug!("Capture requester went away");
                }
            }
            ScreenCommand::DismissCapture => self.controller.dismiss_capture(),
            ScreenCommand::AcknowledgeNotice => self.controller.acknowledge_notice(),
            other => debug!("Ignoring {} outside the event loop", other.name()),
        }
    }

    /// Run acquisition and binding while still reading commands, so a
    /// shutdown is not stuck behind the retry backoff. Captures are rejected
    /// until binding settles and a switch requested meanwhile runs next.
    /// Returns `false` if the screen closed first.
    async fn bind_responsive(&mut self, op: BindOp) -> bool {
        let mut next = Some(op);

        while let Some(op) = next.take() {
            let mut deferred = Vec::new();
            let mut pending_switch = None;

            let outcome = {
                let controller = &mut self.controller;
                let lifetime = &self.lifetime;
                let commands = &mut self.commands;
                let selector = self.selector;

                let binding = async move {
                    match op {
                        BindOp::Initialize => controller
                            .initialize(lifetime, selector)
                            .await
                            .map(|session| session.selector()),
                        BindOp::Retry => controller
                            .retry_binding()
                            .await
                            .map(|()| controller.selector()),
                        BindOp::Switch(selector) => {
                            controller.switch_camera(selector).await.map(|()| selector)
                        }
                    }
                };
                tokio::pin!(binding);

                loop {
                    tokio::select! {
                        result = &mut binding => break Some(result),
                        _ = lifetime.cancelled() => break None,
                        command = commands.recv() => match command {
                            Some(ScreenCommand::Shutdown) => {
                                info!("Camera screen shutdown requested while binding");
                                break None;
                            }
                            None => {
                                debug!("All screen handles dropped");
                                break None;
                            }
                            Some(ScreenCommand::Capture { reply }) => {
                                debug!("Capture rejected: camera binding in progress");
                                let _ = reply.send(None);
                            }
                            Some(ScreenCommand::SwitchCamera(selector)) => {
                                pending_switch = Some(selector);
                            }
                            Some(ScreenCommand::RetryBinding) => {
                                debug!("Camera binding already in progress");
                            }
                            Some(command) => deferred.push(command),
                        },
                    }
                }
            };

            let Some(result) = outcome else {
                return false;
            };

            match (op, result) {
                (BindOp::Initialize, Ok(selector)) => info!("Camera ready ({} camera)", selector),
                (BindOp::Initialize, Err(e)) => warn!("Camera unavailable: {}", e),
                (BindOp::Retry, Ok(selector)) => info!("Camera rebound ({} camera)", selector),
                (BindOp::Retry, Err(e)) => warn!("Camera binding retry failed: {}", e),
                (BindOp::Switch(selector), Ok(_)) => self.selector = selector,
                (BindOp::Switch(selector), Err(e)) => {
                    warn!("Camera switch to {} failed: {}", selector, e)
                }
            }

            for command in deferred {
                self.apply_command(command);
            }
            next = pending_switch.map(BindOp::Switch);
        }

        true
    }

    fn close(&mut self) {
        self.controller.teardown();
        self.completions.close();
        while let Ok(late) = self.completions.try_recv() {
            debug!("Dropping completion for capture {}", late.request_id());
        }
    }
}
