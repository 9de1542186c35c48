use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionState {
    Undetermined,
    Granted,
    Denied,
}

/// Camera permission as reported by the platform permission collaborator.
///
/// Clones observe and update the same state.
#[derive(Clone)]
pub struct CameraPermission {
    state: Arc<watch::Sender<PermissionState>>,
}

impl CameraPermission {
    pub fn new(initial: PermissionState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self {
            state: Arc::new(tx),
        }
    }

    pub fn granted() -> Self {
        Self::new(PermissionState::Granted)
    }

    pub fn current(&self) -> PermissionState {
        *self.state.borrow()
    }

    pub fn grant(&self) {
        info!("Camera permission granted");
        self.state.send_replace(PermissionState::Granted);
    }

    pub fn deny(&self) {
        info!("Camera permission denied");
        self.state.send_replace(PermissionState::Denied);
    }

    pub fn subscribe(&self) -> watch::Receiver<PermissionState> {
        self.state.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_subscribers_see_grant() {
        let permission = CameraPermission::new(PermissionState::Undetermined);
        let mut rx = permission.subscribe();
        assert_eq!(*rx.borrow_and_update(), PermissionState::Undetermined);

        permission.grant();
        tokio::time::timeout(Duration::from_millis(100), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*rx.borrow(), PermissionState::Granted);
        assert_eq!(permission.current(), PermissionState::Granted);
    }

    #[test]
    fn test_clones_share_state() {
        let permission = CameraPermission::granted();
        let other = permission.clone();

        other.deny();
        assert_eq!(permission.current(), PermissionState::Denied);
    }
}
