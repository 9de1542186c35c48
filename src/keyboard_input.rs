use crate::error::Result;
use crate::screen::ScreenHandle;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What a key press asks the camera screen to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    Capture,
    Dismiss,
    RetryBinding,
    SwitchCamera,
    Quit,
}

impl KeyAction {
    pub fn from_key(code: KeyCode) -> Option<Self> {
        match code {
            KeyCode::Char(' ') | KeyCode::Char('c') | KeyCode::Enter => Some(KeyAction::Capture),
            KeyCode::Char('d') | KeyCode::Char('x') | KeyCode::Backspace => {
                Some(KeyAction::Dismiss)
            }
            KeyCode::Char('r') => Some(KeyAction::RetryBinding),
            KeyCode::Char('s') => Some(KeyAction::SwitchCamera),
            KeyCode::Char('q') | KeyCode::Esc => Some(KeyAction::Quit),
            _ => None,
        }
    }

    /// Raw mode delivers Ctrl+C as a key press instead of a signal
    pub fn from_event(key_event: &KeyEvent) -> Option<Self> {
        if key_event.modifiers.contains(KeyModifiers::CONTROL)
            && key_event.code == KeyCode::Char('c')
        {
            return Some(KeyAction::Quit);
        }
        Self::from_key(key_event.code)
    }
}

/// Terminal keyboard controls for the camera screen
pub struct KeyboardInputHandler {
    screen: ScreenHandle,
    cancellation_token: CancellationToken,
}

impl KeyboardInputHandler {
    pub fn new(screen: ScreenHandle) -> Self {
        Self {
            screen,
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Start listening for keyboard input
    pub async fn start(&self) -> Result<()> {
        info!("Keyboard controls: SPACE/c capture, d dismiss, r retry, s switch camera, q quit");

        let screen = self.screen.clone();
        let cancellation_token = self.cancellation_token.clone();
        let runtime_handle = Handle::current();

        task::spawn_blocking(move || {
            if let Err(e) = enable_raw_mode() {
                error!("Failed to enable raw mode for keyboard input: {}", e);
                return;
            }

            debug!("Raw mode enabled - keyboard handler active");

            loop {
                if cancellation_token.is_cancelled() {
                    debug!("Keyboard input handler stopping");
                    break;
                }

                match event::poll(Duration::from_millis(100)) {
                    Ok(true) => {
                        let key_event = match event::read() {
                            Ok(Event::Key(key_event)) if key_event.kind == KeyEventKind::Press => {
                                key_event
                            }
                            _ => continue,
                        };

                        let Some(action) = KeyAction::from_event(&key_event) else {
                            debug!("Key pressed: {:?}", key_event.code);
                            continue;
                        };

                        let quit = action == KeyAction::Quit;
                        let screen = screen.clone();
                        runtime_handle.spawn(async move {
                            if let Err(e) = dispatch(&screen, action).await {
                                warn!("Failed to apply {:?}: {}", action, e);
                            }
                        });

                        if quit {
                            break;
                        }
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!("Error polling for keyboard events: {}", e);
                    }
                }
            }

            if let Err(e) = disable_raw_mode() {
                error!("Failed to disable raw mode: {}", e);
            } else {
                debug!("Raw mode disabled");
            }
        });

        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        debug!("Stopping keyboard input handler");
        self.cancellation_token.cancel();

        // Let the blocking task notice and restore the terminal
        tokio::time::sleep(Duration::from_millis(200)).await;
        let _ = disable_raw_mode();

        Ok(())
    }
}

/// Forward one key action to the screen
pub async fn dispatch(screen: &ScreenHandle, action: KeyAction) -> Result<()> {
    match action {
        KeyAction::Capture => match screen.capture().await? {
            Some(ticket) => {
                let request_id = ticket.request_id();
                match ticket.outcome().await {
                    Ok(image) => info!("Photo {} saved: {}", request_id, image),
                    Err(e) => warn!("Photo {} not saved: {}", request_id, e),
                }
            }
            None => info!("Capture not available right now"),
        },
        KeyAction::Dismiss => screen.dismiss_capture()?,
        KeyAction::RetryBinding => screen.retry_binding()?,
        KeyAction::SwitchCamera => screen.toggle_camera()?,
        KeyAction::Quit => {
            info!("Quit key pressed - closing camera screen");
            screen.shutdown()?;
        }
    }
    Ok(())
}
